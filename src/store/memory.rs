//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{CounterSnapshot, CounterStore};
use crate::error::Result;

/// A counter and the instant its window closes.
#[derive(Debug)]
struct Entry {
    value: u64,
    expires_at: Instant,
}

/// Counters held in a sharded concurrent map.
///
/// Expired counters are reset lazily on access and dropped by
/// [`MemoryCounterStore::sweep`], which [`MemoryCounterStore::spawn_sweeper`]
/// runs on an interval.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Entry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired counter. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.counters.len())
    }

    /// Number of counters currently held, live or not yet swept.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting counter sweeper");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "Swept expired counters");
                        }
                    }
                }
            }
            info!("Counter sweeper stopped");
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<CounterSnapshot> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: 0,
                expires_at: now + ttl,
            });

        if entry.expires_at <= now {
            trace!(key = %key, "Counter window expired, starting over");
            entry.value = 0;
            entry.expires_at = now + ttl;
        }

        entry.value = entry.value.saturating_add(amount);

        Ok(CounterSnapshot {
            value: entry.value,
            expires_in: entry.expires_at.saturating_duration_since(now),
        })
    }

    async fn current(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn test_increment_accumulates() {
        let store = MemoryCounterStore::new();

        let first = store.increment("key", 5, WINDOW).await.unwrap();
        assert_eq!(first.value, 5);
        assert_eq!(first.expires_in, WINDOW);

        let second = store.increment("key", 3, WINDOW).await.unwrap();
        assert_eq!(second.value, 8);
        assert_eq!(store.current("key").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_missing_key_reads_zero() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.current("missing").await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_counts_from_first_increment() {
        let store = MemoryCounterStore::new();
        store.increment("key", 1, WINDOW).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let snapshot = store.increment("key", 1, WINDOW).await.unwrap();
        assert_eq!(snapshot.value, 2);
        assert_eq!(snapshot.expires_in, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.current("key").await.unwrap(), 0);

        let snapshot = store.increment("key", 1, WINDOW).await.unwrap();
        assert_eq!(snapshot.value, 1);
        assert_eq!(snapshot.expires_in, WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let store = MemoryCounterStore::new();
        store.increment("short", 1, Duration::from_secs(1)).await.unwrap();
        store.increment("long", 1, Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.current("long").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_stops_on_shutdown() {
        let store = Arc::new(MemoryCounterStore::new());
        store.increment("short", 1, Duration::from_secs(1)).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = store
            .clone()
            .spawn_sweeper(Duration::from_secs(5), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        store.increment("shared", 3, WINDOW).await.unwrap();
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.current("shared").await.unwrap(), 64 * 10 * 3);
    }
}
