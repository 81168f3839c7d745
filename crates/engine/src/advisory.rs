//! Advisory key/value store backing the circuit breaker.
//!
//! The breaker only needs a handful of primitives: TTL'd counters, TTL'd
//! markers and one atomic "increment and maybe open" operation. Redis provides
//! all of them (the atomic one as a Lua script); the in-memory store mirrors
//! the same semantics for tests and single-process deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors talking to the advisory store. Never surfaced past the breaker.
#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("atomic scripts are not supported by this store")]
    ScriptingUnsupported,
}

/// The pair of keys that make up one endpoint's circuit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitKeys {
    pub failures: String,
    pub open_since: String,
}

impl CircuitKeys {
    pub fn for_endpoint(endpoint_id: impl std::fmt::Display) -> Self {
        Self {
            failures: format!("webhook:circuit:{}:failures", endpoint_id),
            open_since: format!("webhook:circuit:{}:open", endpoint_id),
        }
    }
}

/// Parameters of one failure record.
#[derive(Debug, Clone, Copy)]
pub struct FailureRecord {
    pub threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    /// Value written into the open marker (epoch milliseconds).
    pub opened_at_ms: i64,
}

#[async_trait]
pub trait AdvisoryStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AdvisoryError>;

    async fn delete(&self, keys: &[&str]) -> Result<(), AdvisoryError>;

    /// Increment `key`, giving it `ttl` when the increment creates it.
    /// Returns the post-increment value.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, AdvisoryError>;

    /// Overwrite `key` with `value` and a fresh TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), AdvisoryError>;

    /// Set `key` only when absent. Returns whether the value was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, AdvisoryError>;

    /// Increment the failure counter and open the circuit on reaching the
    /// threshold, as one atomic step. Returns the post-increment count.
    ///
    /// A counter already past the threshold while no open marker exists means
    /// the previous open window lapsed; counting restarts at 1.
    ///
    /// Returns [`AdvisoryError::ScriptingUnsupported`] when the store cannot do
    /// this atomically; callers then fall back to the individual primitives.
    async fn record_failure_atomic(
        &self,
        keys: &CircuitKeys,
        record: FailureRecord,
    ) -> Result<i64, AdvisoryError>;
}

const RECORD_FAILURE_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local threshold = tonumber(ARGV[1])
if count > threshold and redis.call('EXISTS', KEYS[2]) == 0 then
    redis.call('SET', KEYS[1], 1, 'PX', ARGV[2])
    count = 1
end
if count >= threshold then
    redis.call('SET', KEYS[2], ARGV[4], 'NX', 'PX', ARGV[3])
end
return count
"#;

/// Redis-backed advisory store shared by every worker process.
#[derive(Clone)]
pub struct RedisAdvisoryStore {
    conn: ConnectionManager,
    record_failure: redis::Script,
}

impl RedisAdvisoryStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            record_failure: redis::Script::new(RECORD_FAILURE_SCRIPT),
        }
    }
}

#[async_trait]
impl AdvisoryStore for RedisAdvisoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AdvisoryError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), AdvisoryError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(*key);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, AdvisoryError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if count == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await?;
        }
        Ok(count)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AdvisoryError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, AdvisoryError> {
        let mut conn = self.conn.clone();
        // Some("OK") when written, None when the key already exists
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn record_failure_atomic(
        &self,
        keys: &CircuitKeys,
        record: FailureRecord,
    ) -> Result<i64, AdvisoryError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = self
            .record_failure
            .key(&keys.failures)
            .key(&keys.open_since)
            .arg(record.threshold)
            .arg(ttl_millis(record.failure_window))
            .arg(ttl_millis(record.cooldown))
            .arg(record.opened_at_ms)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(count) => Ok(count),
            Err(e) if is_scripting_unavailable(&e) => Err(AdvisoryError::ScriptingUnsupported),
            Err(e) => Err(e.into()),
        }
    }
}

/// Managed Redis offerings sometimes rename or disable EVAL/EVALSHA.
fn is_scripting_unavailable(err: &redis::RedisError) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("unknown command") || message.contains("noscript is disabled")
}

/// Redis rejects a zero PX, so windows are clamped to at least 1ms.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local advisory store with TTL semantics matching Redis.
///
/// Circuit state kept here is not shared between worker processes, so each
/// process opens circuits independently.
#[derive(Debug, Default)]
pub struct InMemoryAdvisoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryAdvisoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn increment_locked(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        ttl: Duration,
        now: Instant,
    ) -> i64 {
        match Self::live_value(entries, key, now) {
            Some(entry) => {
                let count = entry.value.parse::<i64>().unwrap_or(0) + 1;
                entry.value = count.to_string();
                count
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: now + ttl,
                    },
                );
                1
            }
        }
    }
}

#[async_trait]
impl AdvisoryStore for InMemoryAdvisoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AdvisoryError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live_value(&mut entries, key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), AdvisoryError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, AdvisoryError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::increment_locked(&mut entries, key, ttl, Instant::now()))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AdvisoryError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, AdvisoryError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if Self::live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn record_failure_atomic(
        &self,
        keys: &CircuitKeys,
        record: FailureRecord,
    ) -> Result<i64, AdvisoryError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let mut count =
            Self::increment_locked(&mut entries, &keys.failures, record.failure_window, now);
        let open = Self::live_value(&mut entries, &keys.open_since, now).is_some();

        if count > i64::from(record.threshold) && !open {
            entries.insert(
                keys.failures.clone(),
                Entry {
                    value: "1".to_string(),
                    expires_at: now + record.failure_window,
                },
            );
            count = 1;
        }

        if count >= i64::from(record.threshold) && !open {
            entries.insert(
                keys.open_since.clone(),
                Entry {
                    value: record.opened_at_ms.to_string(),
                    expires_at: now + record.cooldown,
                },
            );
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(threshold: u32) -> FailureRecord {
        FailureRecord {
            threshold,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            opened_at_ms: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_memory_ttl_expiry() {
        let store = InMemoryAdvisoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_set_if_absent() {
        let store = InMemoryAdvisoryStore::new();
        let ttl = Duration::from_secs(5);
        assert!(store.set_if_absent("k", "first", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "second", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_memory_atomic_failure_opens_once() {
        let store = InMemoryAdvisoryStore::new();
        let keys = CircuitKeys::for_endpoint("ep");

        assert_eq!(store.record_failure_atomic(&keys, record(2)).await.unwrap(), 1);
        assert_eq!(store.get(&keys.open_since).await.unwrap(), None);

        assert_eq!(store.record_failure_atomic(&keys, record(2)).await.unwrap(), 2);
        let opened = store.get(&keys.open_since).await.unwrap();
        assert_eq!(opened.as_deref(), Some("1700000000000"));

        // Past the threshold while open: the marker is left untouched
        let mut later = record(2);
        later.opened_at_ms += 5_000;
        assert_eq!(store.record_failure_atomic(&keys, later).await.unwrap(), 3);
        assert_eq!(store.get(&keys.open_since).await.unwrap(), opened);
    }

    #[tokio::test]
    async fn test_memory_atomic_failure_restarts_after_lapsed_window() {
        let store = InMemoryAdvisoryStore::new();
        let keys = CircuitKeys::for_endpoint("ep");
        let mut short = record(2);
        short.cooldown = Duration::from_millis(20);

        store.record_failure_atomic(&keys, short).await.unwrap();
        store.record_failure_atomic(&keys, short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.record_failure_atomic(&keys, short).await.unwrap(), 1);
        assert_eq!(store.get(&keys.open_since).await.unwrap(), None);
    }

    #[test]
    fn test_circuit_keys_layout() {
        let keys = CircuitKeys::for_endpoint("abc");
        assert_eq!(keys.failures, "webhook:circuit:abc:failures");
        assert_eq!(keys.open_since, "webhook:circuit:abc:open");
    }
}
