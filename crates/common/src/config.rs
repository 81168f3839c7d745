use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global configuration for the delivery worker, loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the circuit breaker. When unset the breaker
    /// keeps its counters in process memory.
    pub redis_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Interval between queue drains in milliseconds (default: 5000)
    pub drain_interval_ms: u64,

    /// Delivery tuning shared by the queue, executor and breaker.
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            drain_interval_ms: env_or("WEBHOOK_DRAIN_INTERVAL_MS", 5_000)?,
            delivery: DeliveryConfig::from_env()?,
        })
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}

/// Tuning knobs for webhook delivery.
///
/// Every window is expressed in milliseconds so tests can run with short
/// cooldowns and backoffs.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Consecutive failures that open an endpoint's circuit (default: 10)
    pub circuit_failure_threshold: u32,
    /// How long an open circuit stays open (default: 5 minutes)
    pub circuit_cooldown_ms: u64,
    /// TTL of the failure counter; failures older than this are forgotten (default: 1 hour)
    pub circuit_failure_window_ms: u64,
    /// Attempts after which a delivery is left terminally failed (default: 5)
    pub max_retries: u32,
    /// Per-attempt HTTP timeout (default: 10s)
    pub http_timeout_ms: u64,
    /// Delay after the first failed attempt; doubles per attempt (default: 30s).
    /// Open-circuit skips use up attempts too, so the backoff summed over
    /// `max_retries` must outlast `circuit_cooldown_ms`.
    pub retry_base_delay_ms: u64,
    /// Upper bound for the retry delay (default: 1 hour)
    pub retry_max_delay_ms: u64,
    /// Rows claimed per drain (default: 10)
    pub drain_batch_size: u32,
    /// A `delivering` row older than this is assumed abandoned by a crashed
    /// worker and becomes claimable again (default: 5 minutes)
    pub stale_claim_ms: u64,
}

impl DeliveryConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            circuit_failure_threshold: env_or(
                "WEBHOOK_CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_failure_threshold,
            )?
            .max(1),
            circuit_cooldown_ms: env_or("WEBHOOK_CIRCUIT_COOLDOWN_MS", defaults.circuit_cooldown_ms)?,
            circuit_failure_window_ms: env_or(
                "WEBHOOK_CIRCUIT_FAILURE_WINDOW_MS",
                defaults.circuit_failure_window_ms,
            )?,
            max_retries: env_or("WEBHOOK_MAX_RETRIES", defaults.max_retries)?.max(1),
            http_timeout_ms: env_or("WEBHOOK_HTTP_TIMEOUT_MS", defaults.http_timeout_ms)?,
            retry_base_delay_ms: env_or("WEBHOOK_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: env_or("WEBHOOK_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            drain_batch_size: env_or("WEBHOOK_DRAIN_BATCH_SIZE", defaults.drain_batch_size)?.max(1),
            stale_claim_ms: env_or("WEBHOOK_STALE_CLAIM_MS", defaults.stale_claim_ms)?,
        })
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    pub fn circuit_failure_window(&self) -> Duration {
        Duration::from_millis(self.circuit_failure_window_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_millis(self.stale_claim_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            circuit_failure_threshold: 10,
            circuit_cooldown_ms: 300_000,
            circuit_failure_window_ms: 3_600_000,
            max_retries: 5,
            http_timeout_ms: 10_000,
            retry_base_delay_ms: 30_000,
            retry_max_delay_ms: 3_600_000,
            drain_batch_size: 10,
            stale_claim_ms: 300_000,
        }
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_defaults() {
        let config = DeliveryConfig::default();
        assert_eq!(config.circuit_failure_threshold, 10);
        assert_eq!(config.circuit_cooldown(), Duration::from_secs(300));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.drain_batch_size, 10);
        assert_eq!(config.retry_base_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_default_backoff_outlasts_circuit_cooldown() {
        // A row that only ever meets an open circuit must still be retryable
        // once the cooldown has passed.
        let config = DeliveryConfig::default();
        let total_backoff: Duration = (1..config.max_retries)
            .map(|failed| {
                config
                    .retry_base_delay()
                    .saturating_mul(1u32 << (failed - 1))
                    .min(config.retry_max_delay())
            })
            .sum();

        assert_eq!(total_backoff, Duration::from_secs(450));
        assert!(total_backoff > config.circuit_cooldown());
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        let value: u32 = env_or("HOOKLINE_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
