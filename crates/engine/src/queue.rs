//! Delivery queue: fan-out on enqueue, batched draining, status reads.
//!
//! `queue_webhook` turns one domain event into one durable `pending` row per
//! subscribed endpoint. `process_queue` claims a batch of due rows (safe to run
//! from any number of workers at once) and hands each to a [`DeliveryHandler`]
//! concurrently. The handler owns the network attempt and the outcome write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use hookline_common::config::DeliveryConfig;
use hookline_common::error::AppError;
use hookline_common::types::{
    DeliveryStatus, DeliveryStatusView, EventEnvelope, WebhookDelivery, WebhookEndpoint,
};

use crate::registry::EndpointRegistry;
use crate::store::{DeliveryStore, DeliveryUpdate, NewDelivery};

/// Recorded on rows whose endpoint was deleted or disabled after enqueue.
pub const ENDPOINT_UNAVAILABLE: &str = "endpoint unavailable";

/// A claimed row together with the endpoint it targets.
#[derive(Debug, Clone)]
pub struct ClaimedDelivery {
    pub delivery: WebhookDelivery,
    pub endpoint: WebhookEndpoint,
}

/// Performs one delivery attempt for a claimed row and persists its outcome.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Returns the status the row was left in (`Completed` or `Failed`), or
    /// `Delivering` when the claim was taken over by another worker and this
    /// attempt's outcome was discarded.
    async fn deliver(&self, claimed: &ClaimedDelivery) -> Result<DeliveryStatus, AppError>;
}

/// Summary of one `process_queue` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Rows whose claim went stale and was taken over before the outcome was
    /// written; the newer claim owns them now.
    pub superseded: usize,
    /// Rows whose attempt or outcome write errored; they stay `delivering`
    /// until the stale-claim window returns them to the queue.
    pub errors: usize,
}

impl DrainReport {
    fn tally(&mut self, result: &Result<DeliveryStatus, AppError>) {
        match result {
            Ok(DeliveryStatus::Completed) => self.completed += 1,
            Ok(DeliveryStatus::Failed) => self.failed += 1,
            Ok(DeliveryStatus::Pending | DeliveryStatus::Delivering) => self.superseded += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Entry point for producers (enqueue), workers (drain) and operators (reads).
#[derive(Clone)]
pub struct DeliveryQueue {
    pool: PgPool,
    config: DeliveryConfig,
    handler: Arc<dyn DeliveryHandler>,
}

impl DeliveryQueue {
    pub fn new(pool: PgPool, config: DeliveryConfig, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            pool,
            config,
            handler,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Fan an event out to every enabled endpoint of `owner_id` subscribed to
    /// `event_type`. Returns the number of delivery rows created; rows that
    /// already exist for the same resource are left untouched.
    pub async fn queue_webhook(
        &self,
        owner_id: &str,
        event_type: &str,
        data: Value,
        resource_id: Option<&str>,
    ) -> Result<u64, AppError> {
        if owner_id.trim().is_empty() {
            return Err(AppError::Validation("owner_id must not be empty".to_string()));
        }
        if event_type.trim().is_empty() {
            return Err(AppError::Validation("event_type must not be empty".to_string()));
        }
        let resource_id = resolve_resource_id(resource_id, &data)?;

        let endpoints = EndpointRegistry::find_subscribed(&self.pool, owner_id, event_type).await?;
        if endpoints.is_empty() {
            tracing::debug!(owner_id, event_type, "No subscribed endpoints, nothing queued");
            return Ok(0);
        }

        let envelope = EventEnvelope::new(event_type, data);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| AppError::Internal(format!("Failed to serialize event envelope: {}", e)))?;

        let mut created = 0u64;
        for endpoint in &endpoints {
            let inserted = DeliveryStore::insert_if_absent(
                &self.pool,
                &NewDelivery {
                    endpoint_id: endpoint.id,
                    event_type,
                    resource_id: &resource_id,
                    payload: &payload,
                },
            )
            .await?;

            if inserted {
                created += 1;
            } else {
                tracing::debug!(
                    endpoint_id = %endpoint.id,
                    event_type,
                    resource_id = %resource_id,
                    "Delivery already queued, skipping duplicate"
                );
            }
        }

        tracing::info!(
            owner_id,
            event_type,
            resource_id = %resource_id,
            event_id = %envelope.id,
            endpoints = endpoints.len(),
            created,
            "Webhook queued"
        );

        Ok(created)
    }

    /// Claim up to `concurrency_limit` due rows and deliver them concurrently.
    pub async fn process_queue(&self, concurrency_limit: u32) -> Result<DrainReport, AppError> {
        let limit = concurrency_limit.max(1);
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.config.stale_claim_after())
            .map_err(|e| AppError::Config(format!("stale claim window out of range: {}", e)))?;

        let claimed = DeliveryStore::claim_due(
            &self.pool,
            limit,
            self.config.max_retries,
            now,
            now - stale_after,
        )
        .await?;

        if claimed.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport {
            claimed: claimed.len(),
            ..DrainReport::default()
        };

        let mut endpoint_ids: Vec<Uuid> = claimed.iter().map(|d| d.endpoint_id).collect();
        endpoint_ids.sort_unstable();
        endpoint_ids.dedup();
        let endpoints: HashMap<Uuid, WebhookEndpoint> =
            EndpointRegistry::find_by_ids(&self.pool, &endpoint_ids)
                .await?
                .into_iter()
                .map(|e| (e.id, e))
                .collect();

        let mut batch = Vec::with_capacity(claimed.len());
        for delivery in claimed {
            match endpoints.get(&delivery.endpoint_id) {
                Some(endpoint) if endpoint.enabled => batch.push(ClaimedDelivery {
                    endpoint: endpoint.clone(),
                    delivery,
                }),
                _ => {
                    let result = self.abandon(&delivery).await;
                    report.tally(&result);
                }
            }
        }

        let results = join_all(batch.iter().map(|claimed| self.handler.deliver(claimed))).await;
        for (claimed, result) in batch.iter().zip(&results) {
            if let Err(e) = result {
                tracing::error!(
                    delivery_id = %claimed.delivery.id,
                    endpoint_id = %claimed.endpoint.id,
                    error = %e,
                    "Delivery attempt errored"
                );
            }
            report.tally(result);
        }

        tracing::info!(
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            superseded = report.superseded,
            errors = report.errors,
            "Delivery queue drained"
        );

        Ok(report)
    }

    pub async fn get_delivery_status(
        &self,
        delivery_id: Uuid,
    ) -> Result<Option<DeliveryStatusView>, AppError> {
        DeliveryStore::get_status(&self.pool, delivery_id).await
    }

    /// Newest first; `limit` is clamped to `1..=100`.
    pub async fn get_endpoint_deliveries(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DeliveryStatusView>, AppError> {
        DeliveryStore::list_for_endpoint(&self.pool, endpoint_id, limit).await
    }

    async fn abandon(&self, delivery: &WebhookDelivery) -> Result<DeliveryStatus, AppError> {
        tracing::warn!(
            delivery_id = %delivery.id,
            endpoint_id = %delivery.endpoint_id,
            "Endpoint deleted or disabled, closing delivery"
        );
        let applied = DeliveryStore::record_outcome(
            &self.pool,
            delivery,
            &DeliveryUpdate::Abandoned {
                reason: ENDPOINT_UNAVAILABLE.to_string(),
            },
        )
        .await?;

        Ok(if applied {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Delivering
        })
    }
}

/// The idempotency resource id of an event: `explicit` when given, else
/// `data.id`, else `data.resource_id`. Numbers are rendered as strings.
pub fn resolve_resource_id(explicit: Option<&str>, data: &Value) -> Result<String, AppError> {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    ["id", "resource_id"]
        .iter()
        .filter_map(|field| data.get(*field))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| {
            AppError::Validation(
                "a resource id is required: pass one explicitly or include `id` or `resource_id` in the event data"
                    .to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_explicit_resource_id_wins() {
        let data = json!({"id": "from-data"});
        assert_eq!(resolve_resource_id(Some("explicit"), &data).unwrap(), "explicit");
    }

    #[test]
    fn test_resource_id_from_data_id() {
        assert_eq!(resolve_resource_id(None, &json!({"id": "inv_1"})).unwrap(), "inv_1");
        assert_eq!(resolve_resource_id(None, &json!({"id": 42})).unwrap(), "42");
    }

    #[test]
    fn test_resource_id_falls_back_to_resource_id_field() {
        let data = json!({"resource_id": "job_9", "status": "done"});
        assert_eq!(resolve_resource_id(None, &data).unwrap(), "job_9");

        // An unusable `id` does not shadow a valid `resource_id`
        let data = json!({"id": "", "resource_id": "job_9"});
        assert_eq!(resolve_resource_id(None, &data).unwrap(), "job_9");
    }

    #[test]
    fn test_missing_resource_id_is_validation_error() {
        for data in [json!({}), json!({"id": ""}), json!({"id": null}), json!({"id": {"nested": 1}})] {
            let err = resolve_resource_id(None, &data).unwrap_err();
            assert!(err.is_validation(), "{data}: {err}");
        }
        assert!(resolve_resource_id(Some("  "), &json!({})).unwrap_err().is_validation());
    }

    #[test]
    fn test_drain_report_tally() {
        let mut report = DrainReport::default();
        report.tally(&Ok(DeliveryStatus::Completed));
        report.tally(&Ok(DeliveryStatus::Failed));
        report.tally(&Ok(DeliveryStatus::Failed));
        report.tally(&Ok(DeliveryStatus::Delivering));
        report.tally(&Err(AppError::Internal("boom".to_string())));

        assert_eq!(
            report,
            DrainReport {
                claimed: 0,
                completed: 1,
                failed: 2,
                superseded: 1,
                errors: 1,
            }
        );
    }
}
