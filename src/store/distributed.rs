//! Redis-backed counter store.
//!
//! Processes that point at the same Redis share counters, so one logical
//! budget holds across the fleet. Increment, expiry and TTL readback happen
//! in one Lua script, which Redis runs atomically.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{CounterSnapshot, CounterStore};
use crate::error::{QuotaError, Result};

/// Increment, set the TTL only when the key has none, and return both.
const INCREMENT_SCRIPT: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
return {value, ttl}
"#;

/// Counter store shared through Redis.
///
/// The connection is opened on first use and reopened after a failure.
pub struct RedisCounterStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    script: Script,
    timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store for `url`. No connection is made until the first call.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| QuotaError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            script: Script::new(INCREMENT_SCRIPT),
            timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        debug!("Opening Redis connection");
        let connection = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Bound `op` by the store timeout and drop the cached connection on failure.
    async fn guarded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let result = match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(QuotaError::StoreUnavailable(format!(
                "Redis operation timed out after {:?}",
                self.timeout
            ))),
        };

        if let Err(ref e) = result {
            warn!(error = %e, "Redis counter store call failed");
            self.connection.lock().await.take();
        }

        result
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<CounterSnapshot> {
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let (value, remaining_ms): (i64, i64) = self
            .guarded(async {
                let mut connection = self.connection().await?;
                let mut invocation = self.script.key(key);
                invocation.arg(amount).arg(ttl_ms);
                let reply: (i64, i64) = invocation.invoke_async(&mut connection).await?;
                Ok::<_, QuotaError>(reply)
            })
            .await?;

        trace!(key = %key, value, remaining_ms, "Incremented Redis counter");

        Ok(CounterSnapshot {
            value: value.max(0) as u64,
            expires_in: Duration::from_millis(remaining_ms.max(0) as u64),
        })
    }

    async fn current(&self, key: &str) -> Result<u64> {
        self.guarded(async {
            let mut connection = self.connection().await?;
            let value: Option<i64> = connection.get(key).await?;
            Ok::<_, QuotaError>(value.unwrap_or(0).max(0) as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
    }

    fn unique_key(name: &str) -> String {
        format!("quotakeeper-test:{}:{}", name, std::process::id())
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        let store = RedisCounterStore::new("redis://127.0.0.1:1/", Duration::from_millis(500))
            .unwrap();

        let result = store.increment("key", 1, Duration::from_secs(15)).await;
        assert!(matches!(result, Err(QuotaError::StoreUnavailable(_))));

        let result = store.current("key").await;
        assert!(matches!(result, Err(QuotaError::StoreUnavailable(_))));
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RedisCounterStore::new("http://not-redis", Duration::from_millis(100));
        assert!(matches!(result, Err(QuotaError::Config(_))));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_increment_sets_ttl_once() {
        let store = RedisCounterStore::new(&redis_url(), Duration::from_secs(2)).unwrap();
        let key = unique_key("ttl");

        let first = store.increment(&key, 40, Duration::from_secs(15)).await.unwrap();
        assert_eq!(first.value, 40);
        assert!(first.expires_in <= Duration::from_secs(15));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let second = store.increment(&key, 40, Duration::from_secs(15)).await.unwrap();
        assert_eq!(second.value, 80);
        assert!(second.expires_in < Duration::from_secs(14));
        assert_eq!(store.current(&key).await.unwrap(), 80);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(RedisCounterStore::new(&redis_url(), Duration::from_secs(2)).unwrap());
        let key = unique_key("concurrent");

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        store.increment(&key, 3, Duration::from_secs(30)).await.unwrap();
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.current(&key).await.unwrap(), 32 * 10 * 3);
    }
}
