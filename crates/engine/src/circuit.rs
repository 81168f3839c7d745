//! Per-endpoint circuit breaker for webhook delivery.
//!
//! After `threshold` consecutive failed deliveries an endpoint's circuit opens
//! and the executor stops calling it until the cooldown elapses. The first
//! successful delivery afterwards closes the circuit fully (no half-open probe).
//!
//! The breaker fails **open**: if the advisory store is missing or erroring,
//! every circuit reads as closed and failure/success records become no-ops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use hookline_common::config::DeliveryConfig;

use crate::advisory::{AdvisoryError, AdvisoryStore, CircuitKeys, FailureRecord};

/// Advisory-store-backed circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Option<Arc<dyn AdvisoryStore>>,
    threshold: u32,
    cooldown: Duration,
    failure_window: Duration,
}

impl CircuitBreaker {
    /// `store = None` models an unavailable advisory store.
    pub fn new(store: Option<Arc<dyn AdvisoryStore>>, config: &DeliveryConfig) -> Self {
        Self {
            store,
            threshold: config.circuit_failure_threshold.max(1),
            cooldown: config.circuit_cooldown(),
            failure_window: config.circuit_failure_window(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether deliveries to `endpoint_id` should currently be skipped.
    pub async fn is_circuit_open(&self, endpoint_id: Uuid) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        match self.check_open(store.as_ref(), endpoint_id).await {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!(
                    endpoint_id = %endpoint_id,
                    error = %e,
                    "Circuit state unavailable, treating circuit as closed"
                );
                false
            }
        }
    }

    /// Record a failed delivery. Best effort; never fails.
    pub async fn record_failure(&self, endpoint_id: Uuid) {
        let Some(store) = &self.store else {
            return;
        };

        let keys = CircuitKeys::for_endpoint(endpoint_id);
        let record = FailureRecord {
            threshold: self.threshold,
            failure_window: self.failure_window,
            cooldown: self.cooldown,
            opened_at_ms: Utc::now().timestamp_millis(),
        };

        let result = match store.record_failure_atomic(&keys, record).await {
            Err(AdvisoryError::ScriptingUnsupported) => {
                tracing::debug!(
                    endpoint_id = %endpoint_id,
                    "Atomic failure script unavailable, using non-atomic fallback"
                );
                self.record_failure_fallback(store.as_ref(), &keys, record)
                    .await
            }
            other => other,
        };

        match result {
            Ok(count) if count == i64::from(self.threshold) => {
                tracing::warn!(
                    endpoint_id = %endpoint_id,
                    failures = count,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Circuit opened for endpoint"
                );
            }
            Ok(count) => {
                tracing::debug!(endpoint_id = %endpoint_id, failures = count, "Delivery failure recorded");
            }
            Err(e) => {
                tracing::warn!(
                    endpoint_id = %endpoint_id,
                    error = %e,
                    "Failed to record delivery failure in circuit breaker"
                );
            }
        }
    }

    /// Record a successful delivery, fully closing the circuit. Best effort.
    pub async fn record_success(&self, endpoint_id: Uuid) {
        let Some(store) = &self.store else {
            return;
        };

        let keys = CircuitKeys::for_endpoint(endpoint_id);
        if let Err(e) = store.delete(&[&keys.failures, &keys.open_since]).await {
            tracing::warn!(
                endpoint_id = %endpoint_id,
                error = %e,
                "Failed to reset circuit after successful delivery"
            );
        }
    }

    /// Current consecutive failure count, if known.
    pub async fn failure_count(&self, endpoint_id: Uuid) -> Option<i64> {
        let store = self.store.as_ref()?;
        let keys = CircuitKeys::for_endpoint(endpoint_id);
        match store.get(&keys.failures).await {
            Ok(value) => Some(value.and_then(|v| v.parse().ok()).unwrap_or(0)),
            Err(_) => None,
        }
    }

    async fn check_open(
        &self,
        store: &dyn AdvisoryStore,
        endpoint_id: Uuid,
    ) -> Result<bool, AdvisoryError> {
        let keys = CircuitKeys::for_endpoint(endpoint_id);

        let Some(opened_at) = store.get(&keys.open_since).await? else {
            return Ok(false);
        };

        // An unreadable marker cannot be aged, so it is treated as expired
        let expired = match opened_at.parse::<i64>() {
            Ok(opened_at_ms) => {
                let age_ms = Utc::now().timestamp_millis().saturating_sub(opened_at_ms);
                age_ms >= i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX)
            }
            Err(_) => true,
        };

        if expired {
            store.delete(&[&keys.open_since, &keys.failures]).await?;
            tracing::info!(endpoint_id = %endpoint_id, "Circuit cooldown elapsed, circuit closed");
            return Ok(false);
        }

        Ok(true)
    }

    /// Increment, then check, then set. Concurrent failures may race and land
    /// slightly over or under the threshold, which is fine for an advisory signal.
    async fn record_failure_fallback(
        &self,
        store: &dyn AdvisoryStore,
        keys: &CircuitKeys,
        record: FailureRecord,
    ) -> Result<i64, AdvisoryError> {
        let mut count = store.increment(&keys.failures, record.failure_window).await?;
        let threshold = i64::from(record.threshold);

        if count > threshold && store.get(&keys.open_since).await?.is_none() {
            store
                .set_with_ttl(&keys.failures, "1", record.failure_window)
                .await?;
            count = 1;
        }

        if count >= threshold {
            store
                .set_if_absent(
                    &keys.open_since,
                    &record.opened_at_ms.to_string(),
                    record.cooldown,
                )
                .await?;
        }

        Ok(count)
    }
}
