//! Deterministic exponential backoff for failed deliveries.
//!
//! `delay(n) = min(base * 2^(n-1), max)` for the n-th failed attempt, without
//! jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};

use hookline_common::config::DeliveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts after which a delivery is terminally failed.
    pub max_retries: u32,
}

impl RetrySchedule {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            max_retries: config.max_retries.max(1),
        }
    }

    /// Backoff after the `failed_attempts`-th failure (1-based).
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// When to try again after the attempt count reached `attempts`, or `None`
    /// once the delivery has used up its retries.
    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts >= self.max_retries {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay(attempts)).ok()?;
        now.checked_add_signed(delay)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}
