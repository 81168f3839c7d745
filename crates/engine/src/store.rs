//! Persistence for `webhook_deliveries`.
//!
//! All state transitions of a delivery row go through here:
//! - `insert_if_absent`: enqueue, idempotent on (endpoint, event type, resource)
//! - `claim_due`: pending/failed/stale rows → `delivering`, skip-locked
//! - `record_outcome`: `delivering` → `completed` | `failed`, fenced by the claim

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use hookline_common::error::AppError;
use hookline_common::types::{DeliveryStatusView, WebhookDelivery};

const STATUS_VIEW_COLUMNS: &str = "id, endpoint_id, event_type, resource_id, status, attempts, \
     last_error, last_status_code, next_attempt_at, created_at, updated_at, completed_at";

/// Maximum page size for per-endpoint listings.
pub const MAX_PAGE_SIZE: i64 = 100;

/// A new delivery row.
#[derive(Debug, Clone)]
pub struct NewDelivery<'a> {
    pub endpoint_id: Uuid,
    pub event_type: &'a str,
    pub resource_id: &'a str,
    pub payload: &'a serde_json::Value,
}

/// The result of one processed claim.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryUpdate {
    /// The receiver answered 2xx.
    Completed { status_code: i32 },
    /// The attempt failed. `next_attempt_at = None` makes the failure terminal.
    Failed {
        next_attempt_at: Option<DateTime<Utc>>,
        error: String,
        status_code: Option<i32>,
    },
    /// Closed without an attempt (endpoint gone or disabled). Always terminal.
    Abandoned { reason: String },
}

/// Query layer for delivery rows.
pub struct DeliveryStore;

impl DeliveryStore {
    /// Insert a `pending` row unless one already exists for the same
    /// (endpoint, event type, resource). Returns whether a row was created.
    pub async fn insert_if_absent(
        pool: &PgPool,
        delivery: &NewDelivery<'_>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (id, endpoint_id, event_type, resource_id, payload, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (endpoint_id, event_type, resource_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(delivery.endpoint_id)
        .bind(delivery.event_type)
        .bind(delivery.resource_id)
        .bind(delivery.payload)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Claim up to `limit` due rows and move them to `delivering`.
    ///
    /// Due means `pending`, or `failed` with a retry scheduled at or before
    /// `now` and fewer than `max_retries` attempts, or `delivering` with a claim
    /// older than `stale_before` (the claiming worker died). Rows locked by a
    /// concurrent claim are skipped, so two drains never receive the same row.
    pub async fn claim_due(
        pool: &PgPool,
        limit: u32,
        max_retries: u32,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let max_attempts = attempts_limit(max_retries)?;
        let claimed: Vec<WebhookDelivery> = sqlx::query_as(
            r#"
            UPDATE webhook_deliveries AS d
            SET status = 'delivering',
                claimed_at = $1,
                updated_at = $1
            FROM (
                SELECT id
                FROM webhook_deliveries
                WHERE (status = 'pending'
                       AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
                   OR (status = 'failed'
                       AND next_attempt_at IS NOT NULL
                       AND next_attempt_at <= $1
                       AND attempts < $3)
                   OR (status = 'delivering'
                       AND claimed_at < $4)
                ORDER BY next_attempt_at ASC NULLS FIRST, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ) AS due
            WHERE d.id = due.id
            RETURNING d.*
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .bind(max_attempts)
        .bind(stale_before)
        .fetch_all(pool)
        .await?;

        Ok(claimed)
    }

    /// Persist the outcome of a claimed row.
    ///
    /// The update only applies while the row is still `delivering` under the
    /// same claim; returns `false` when the claim was lost to a stale-claim
    /// takeover, in which case the newer claim's outcome wins.
    pub async fn record_outcome(
        pool: &PgPool,
        claimed: &WebhookDelivery,
        update: &DeliveryUpdate,
    ) -> Result<bool, AppError> {
        let now = Utc::now();

        let result = match update {
            DeliveryUpdate::Completed { status_code } => {
                sqlx::query(
                    r#"
                    UPDATE webhook_deliveries
                    SET status = 'completed',
                        attempts = attempts + 1,
                        next_attempt_at = NULL,
                        last_error = NULL,
                        last_status_code = $3,
                        claimed_at = NULL,
                        updated_at = $4,
                        completed_at = $4
                    WHERE id = $1 AND status = 'delivering' AND claimed_at = $2
                    "#,
                )
                .bind(claimed.id)
                .bind(claimed.claimed_at)
                .bind(*status_code)
                .bind(now)
                .execute(pool)
                .await?
            }
            DeliveryUpdate::Failed {
                next_attempt_at,
                error,
                status_code,
            } => {
                sqlx::query(
                    r#"
                    UPDATE webhook_deliveries
                    SET status = 'failed',
                        attempts = attempts + 1,
                        next_attempt_at = $3,
                        last_error = $4,
                        last_status_code = $5,
                        claimed_at = NULL,
                        updated_at = $6
                    WHERE id = $1 AND status = 'delivering' AND claimed_at = $2
                    "#,
                )
                .bind(claimed.id)
                .bind(claimed.claimed_at)
                .bind(*next_attempt_at)
                .bind(error)
                .bind(*status_code)
                .bind(now)
                .execute(pool)
                .await?
            }
            DeliveryUpdate::Abandoned { reason } => {
                sqlx::query(
                    r#"
                    UPDATE webhook_deliveries
                    SET status = 'failed',
                        next_attempt_at = NULL,
                        last_error = $3,
                        claimed_at = NULL,
                        updated_at = $4
                    WHERE id = $1 AND status = 'delivering' AND claimed_at = $2
                    "#,
                )
                .bind(claimed.id)
                .bind(claimed.claimed_at)
                .bind(reason)
                .bind(now)
                .execute(pool)
                .await?
            }
        };

        let applied = result.rows_affected() > 0;
        if !applied {
            tracing::warn!(
                delivery_id = %claimed.id,
                "Delivery claim was taken over before its outcome was recorded"
            );
        }

        Ok(applied)
    }

    /// Status projection of a single delivery.
    pub async fn get_status(
        pool: &PgPool,
        delivery_id: Uuid,
    ) -> Result<Option<DeliveryStatusView>, AppError> {
        let view: Option<DeliveryStatusView> = sqlx::query_as(&format!(
            "SELECT {STATUS_VIEW_COLUMNS} FROM webhook_deliveries WHERE id = $1"
        ))
        .bind(delivery_id)
        .fetch_optional(pool)
        .await?;

        Ok(view)
    }

    /// Most recent deliveries for an endpoint, newest first.
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list_for_endpoint(
        pool: &PgPool,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DeliveryStatusView>, AppError> {
        let views: Vec<DeliveryStatusView> = sqlx::query_as(&format!(
            r#"
            SELECT {STATUS_VIEW_COLUMNS}
            FROM webhook_deliveries
            WHERE endpoint_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(endpoint_id)
        .bind(clamp_page_size(limit))
        .fetch_all(pool)
        .await?;

        Ok(views)
    }
}

pub fn clamp_page_size(limit: i64) -> i64 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

/// `max_retries` as the `attempts` column type.
fn attempts_limit(max_retries: u32) -> Result<i32, AppError> {
    i32::try_from(max_retries).map_err(|_| {
        AppError::Config(format!(
            "max_retries {} exceeds the supported maximum of {}",
            max_retries,
            i32::MAX
        ))
    })
}
