//! Counter stores backing the windowed rate limiters.
//!
//! A store owns named counters that expire a fixed time after their first
//! increment. The in-memory store serves a single process; the Redis store
//! lets a fleet of processes share one budget.

mod distributed;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StoreConfig;
use crate::error::Result;

pub use distributed::RedisCounterStore;
pub use memory::MemoryCounterStore;

/// The state of a counter right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Cumulative amount recorded in the live window, including this increment
    pub value: u64,
    /// Time until the counter expires and the window starts over
    pub expires_in: Duration,
}

/// Which store holds the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

impl StoreBackend {
    /// Whether counters are shared with other processes.
    pub fn is_distributed(&self) -> bool {
        matches!(self, StoreBackend::Redis)
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Redis => write!(f, "redis"),
        }
    }
}

/// Trait for counter store implementations.
///
/// `increment` must be atomic against concurrent callers on the same key:
/// the returned value reflects every increment applied before it.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `amount` to the counter for `key`, creating it with a `ttl`
    /// lifetime when it does not exist.
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<CounterSnapshot>;

    /// Read the current value for `key`; missing or expired counters read as zero.
    async fn current(&self, key: &str) -> Result<u64>;
}

/// Build the store selected by the configuration.
///
/// The in-memory store is returned separately as well so the caller can
/// drive its sweeper.
pub fn build_store(
    config: &StoreConfig,
) -> Result<(Arc<dyn CounterStore>, Option<Arc<MemoryCounterStore>>)> {
    match config.backend {
        StoreBackend::Memory => {
            info!(backend = %config.backend, "Using in-memory counter store");
            let store = Arc::new(MemoryCounterStore::new());
            let shared: Arc<dyn CounterStore> = store.clone();
            Ok((shared, Some(store)))
        }
        StoreBackend::Redis => {
            info!(
                backend = %config.backend,
                url = %config.redis_url,
                timeout_ms = config.operation_timeout_ms,
                "Using Redis counter store"
            );
            let store: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(
                &config.redis_url,
                config.operation_timeout(),
            )?);
            Ok((store, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_display() {
        assert_eq!(StoreBackend::Memory.to_string(), "memory");
        assert_eq!(StoreBackend::Redis.to_string(), "redis");
        assert!(StoreBackend::Redis.is_distributed());
        assert!(!StoreBackend::Memory.is_distributed());
    }

    #[test]
    fn test_build_memory_store() {
        let config = StoreConfig::default();
        let (_, memory) = build_store(&config).unwrap();
        assert!(memory.is_some());
    }

    #[test]
    fn test_build_redis_store_rejects_bad_url() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: "not a url".to_string(),
            ..StoreConfig::default()
        };
        assert!(build_store(&config).is_err());
    }
}
