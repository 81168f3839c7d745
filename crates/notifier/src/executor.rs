//! Delivery executor: one attempt per claimed delivery row.
//!
//! For each claim:
//! 1. Skip the network entirely while the endpoint's circuit is open
//! 2. Sign the stored envelope and POST it with the configured timeout
//! 3. Report the result to the circuit breaker (2xx closes, anything else counts)
//! 4. Persist exactly one outcome on the row: `completed`, a scheduled retry,
//!    or terminal `failed` once `max_retries` attempts are used up
//!
//! Every error string is sanitized before it reaches the database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use hookline_common::config::DeliveryConfig;
use hookline_common::error::AppError;
use hookline_common::sanitize::sanitize_error_message;
use hookline_common::types::DeliveryStatus;
use hookline_engine::circuit::CircuitBreaker;
use hookline_engine::queue::{ClaimedDelivery, DeliveryHandler};
use hookline_engine::store::{DeliveryStore, DeliveryUpdate};

use crate::client::{DeliveryClient, OutboundRequest, default_user_agent};
use crate::retry::RetrySchedule;
use crate::signing::{HmacSha256Signer, PayloadSigner};

pub const CIRCUIT_OPEN_ERROR: &str = "circuit open";

/// What happened to a single attempt, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered { status_code: u16 },
    Failed { error: String, status_code: Option<u16> },
    /// The circuit was open; no request was made.
    CircuitOpen,
}

pub struct DeliveryExecutor {
    pool: PgPool,
    client: DeliveryClient,
    breaker: CircuitBreaker,
    signer: Arc<dyn PayloadSigner>,
    schedule: RetrySchedule,
}

impl DeliveryExecutor {
    pub fn new(
        pool: PgPool,
        breaker: CircuitBreaker,
        config: &DeliveryConfig,
    ) -> Result<Self, AppError> {
        let client = DeliveryClient::new(config.http_timeout(), &default_user_agent())
            .map_err(|e| AppError::Http(e.to_string()))?;

        Ok(Self {
            pool,
            client,
            breaker,
            signer: Arc::new(HmacSha256Signer),
            schedule: RetrySchedule::from_config(config),
        })
    }

    /// Replace the default HMAC-SHA256 signer.
    pub fn with_signer(mut self, signer: Arc<dyn PayloadSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run one attempt and persist its outcome. Returns the row's new status,
    /// or `Delivering` when the claim was lost before the outcome was written.
    pub async fn execute(&self, claimed: &ClaimedDelivery) -> Result<DeliveryStatus, AppError> {
        let delivery = &claimed.delivery;
        let outcome = self.attempt(claimed).await?;
        let update = self.outcome_update(delivery.attempts, &outcome, Utc::now());

        let applied = DeliveryStore::record_outcome(&self.pool, delivery, &update).await?;
        if !applied {
            // The newer claim's outcome stands; this attempt is not reported
            return Ok(DeliveryStatus::Delivering);
        }

        let attempt = delivery.attempts + 1;
        let status = match &update {
            DeliveryUpdate::Completed { status_code } => {
                tracing::info!(
                    delivery_id = %delivery.id,
                    endpoint_id = %delivery.endpoint_id,
                    event_type = %delivery.event_type,
                    attempt,
                    status = status_code,
                    "Webhook delivered"
                );
                DeliveryStatus::Completed
            }
            DeliveryUpdate::Failed {
                next_attempt_at: Some(next),
                error,
                status_code,
            } => {
                tracing::warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %delivery.endpoint_id,
                    attempt,
                    status = ?status_code,
                    next_attempt_at = %next,
                    error = %error,
                    "Webhook delivery failed, retry scheduled"
                );
                DeliveryStatus::Failed
            }
            DeliveryUpdate::Failed { error, status_code, .. } => {
                tracing::error!(
                    delivery_id = %delivery.id,
                    endpoint_id = %delivery.endpoint_id,
                    attempt,
                    status = ?status_code,
                    error = %error,
                    "Webhook delivery failed permanently"
                );
                DeliveryStatus::Failed
            }
            DeliveryUpdate::Abandoned { .. } => DeliveryStatus::Failed,
        };

        Ok(status)
    }

    /// Perform the attempt (breaker check, sign, send) and feed the breaker.
    /// Does not touch the database.
    pub async fn attempt(&self, claimed: &ClaimedDelivery) -> Result<AttemptOutcome, AppError> {
        let delivery = &claimed.delivery;
        let endpoint = &claimed.endpoint;

        if self.breaker.is_circuit_open(endpoint.id).await {
            tracing::debug!(
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                "Circuit open, skipping delivery attempt"
            );
            return Ok(AttemptOutcome::CircuitOpen);
        }

        let body = serde_json::to_vec(&delivery.payload)
            .map_err(|e| AppError::Internal(format!("Failed to serialize payload: {}", e)))?;
        let timestamp = Utc::now().timestamp();
        let signature = self.signer.sign(&endpoint.secret, timestamp, &body);
        let event_id = delivery
            .payload
            .get("id")
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();

        let request = OutboundRequest {
            url: endpoint.url.clone(),
            headers: vec![
                ("Content-Type", "application/json".to_string()),
                ("X-Webhook-Id", delivery.id.to_string()),
                ("X-Webhook-Event", delivery.event_type.clone()),
                ("X-Webhook-Event-Id", event_id),
                ("X-Webhook-Attempt", (delivery.attempts + 1).to_string()),
                ("X-Webhook-Timestamp", timestamp.to_string()),
                (self.signer.header_name(), signature),
            ],
            body,
        };

        let outcome = match self.client.send(request).await {
            Ok(response) if response.is_success() => AttemptOutcome::Delivered {
                status_code: response.status_code,
            },
            Ok(response) => {
                let body = response.body.trim();
                let error = if body.is_empty() {
                    format!("HTTP {}", response.status_code)
                } else {
                    format!("HTTP {}: {}", response.status_code, body)
                };
                AttemptOutcome::Failed {
                    error,
                    status_code: Some(response.status_code),
                }
            }
            Err(e) => AttemptOutcome::Failed {
                error: e.to_string(),
                status_code: None,
            },
        };

        match &outcome {
            AttemptOutcome::Delivered { .. } => self.breaker.record_success(endpoint.id).await,
            AttemptOutcome::Failed { .. } => self.breaker.record_failure(endpoint.id).await,
            AttemptOutcome::CircuitOpen => {}
        }

        Ok(outcome)
    }

    /// Map an attempt outcome to the row update, given the attempt count the
    /// row had when it was claimed.
    pub fn outcome_update(
        &self,
        prior_attempts: i32,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> DeliveryUpdate {
        let attempts = u32::try_from(prior_attempts.saturating_add(1)).unwrap_or(u32::MAX);

        let (error, status_code) = match outcome {
            AttemptOutcome::Delivered { status_code } => {
                return DeliveryUpdate::Completed {
                    status_code: i32::from(*status_code),
                };
            }
            AttemptOutcome::Failed { error, status_code } => (error.as_str(), *status_code),
            AttemptOutcome::CircuitOpen => (CIRCUIT_OPEN_ERROR, None),
        };

        DeliveryUpdate::Failed {
            next_attempt_at: self.schedule.next_attempt_at(attempts, now),
            error: sanitize_error_message(error),
            status_code: status_code.map(i32::from),
        }
    }
}

#[async_trait]
impl DeliveryHandler for DeliveryExecutor {
    async fn deliver(&self, claimed: &ClaimedDelivery) -> Result<DeliveryStatus, AppError> {
        self.execute(claimed).await
    }
}
