//! Endpoint registry reads.
//!
//! Endpoints are created and edited by the registry service; delivery only
//! ever reads them, at enqueue time (who is subscribed) and at drain time
//! (where to send, and with which secret).

use sqlx::PgPool;
use uuid::Uuid;

use hookline_common::error::AppError;
use hookline_common::types::WebhookEndpoint;

const ENDPOINT_COLUMNS: &str = "id, owner_id, url, secret, event_types, enabled, created_at";

/// Read-side access to `webhook_endpoints`.
pub struct EndpointRegistry;

impl EndpointRegistry {
    /// Enabled endpoints of `owner_id` subscribed to `event_type`.
    pub async fn find_subscribed(
        pool: &PgPool,
        owner_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>, AppError> {
        let endpoints: Vec<WebhookEndpoint> = sqlx::query_as(&format!(
            r#"
            SELECT {ENDPOINT_COLUMNS}
            FROM webhook_endpoints
            WHERE owner_id = $1
              AND enabled = true
              AND $2 = ANY(event_types)
            ORDER BY created_at
            "#
        ))
        .bind(owner_id)
        .bind(event_type)
        .fetch_all(pool)
        .await?;

        Ok(endpoints)
    }

    /// Endpoints by id, enabled or not. Unknown ids are simply absent.
    pub async fn find_by_ids(
        pool: &PgPool,
        ids: &[Uuid],
    ) -> Result<Vec<WebhookEndpoint>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let endpoints: Vec<WebhookEndpoint> = sqlx::query_as(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(pool)
        .await?;

        Ok(endpoints)
    }
}
