//! Fixed-window rate limiter over a pluggable counter store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{QuotaError, Result};
use crate::store::CounterStore;

/// The rules a [`WindowedRateLimiter`] applies to each unit of work.
pub trait LimitRules: Send + Sync {
    /// The unit of work being admitted.
    type Request: ?Sized + Sync;

    /// Counter key for `request`.
    fn key(&self, request: &Self::Request) -> String;

    /// How much of the budget `request` consumes.
    fn amount(&self, request: &Self::Request) -> u64;

    /// How long a counter lives after its first increment.
    fn window(&self) -> Duration;

    /// Cumulative amount allowed per key per window.
    fn limit(&self) -> u64;
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the unit of work may proceed now
    pub allowed: bool,
    /// Budget left in the window after this check
    pub remaining: u64,
    /// Time until the window for this key starts over
    pub reset_after: Duration,
}

impl Admission {
    /// Admission granted without consulting the store.
    pub(crate) fn open(limit: u64) -> Self {
        Self {
            allowed: true,
            remaining: limit,
            reset_after: Duration::ZERO,
        }
    }
}

/// How a check behaves when the counter store is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request
    FailOpen,
    /// Deny the request and surface the error
    #[default]
    FailClosed,
}

/// A rate limiter that counts per key within a fixed window.
///
/// The counter is incremented on every check, admitted or not, and the
/// decision uses the value before the increment. Concurrent checks on the
/// same key may therefore overshoot the limit by at most one request's amount.
pub struct WindowedRateLimiter<R: LimitRules> {
    rules: R,
    store: Arc<dyn CounterStore>,
}

impl<R: LimitRules> WindowedRateLimiter<R> {
    pub fn new(rules: R, store: Arc<dyn CounterStore>) -> Self {
        Self { rules, store }
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// Record `request` against its counter and decide whether it may proceed.
    pub async fn check(&self, request: &R::Request) -> Result<Admission> {
        let key = self.rules.key(request);
        let amount = self.rules.amount(request);
        let limit = self.rules.limit();

        trace!(key = %key, amount, limit, "Checking windowed rate limit");

        let snapshot = self
            .store
            .increment(&key, amount, self.rules.window())
            .await?;

        let before = snapshot.value.saturating_sub(amount);
        let allowed = amount <= limit && before <= limit - amount;

        if !allowed {
            debug!(
                key = %key,
                count = snapshot.value,
                limit,
                reset_after_ms = snapshot.expires_in.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        Ok(Admission {
            allowed,
            remaining: limit.saturating_sub(snapshot.value),
            reset_after: snapshot.expires_in,
        })
    }

    /// [`check`](Self::check), resolving an unreachable store by `policy`.
    pub async fn check_with_policy(
        &self,
        request: &R::Request,
        policy: FailurePolicy,
    ) -> Result<Admission> {
        match self.check(request).await {
            Err(QuotaError::StoreUnavailable(reason)) => match policy {
                FailurePolicy::FailOpen => {
                    warn!(reason = %reason, "Counter store unavailable, admitting request");
                    Ok(Admission::open(self.rules.limit()))
                }
                FailurePolicy::FailClosed => {
                    warn!(reason = %reason, "Counter store unavailable, denying request");
                    Err(QuotaError::StoreUnavailable(reason))
                }
            },
            other => other,
        }
    }

    /// Add `request`'s amount to its counter without deciding admission.
    /// Returns the budget left in the window.
    pub async fn record(&self, request: &R::Request) -> Result<u64> {
        let snapshot = self
            .store
            .increment(
                &self.rules.key(request),
                self.rules.amount(request),
                self.rules.window(),
            )
            .await?;
        Ok(self.rules.limit().saturating_sub(snapshot.value))
    }

    /// Amount recorded for `request`'s key in the live window.
    pub async fn current(&self, request: &R::Request) -> Result<u64> {
        self.store.current(&self.rules.key(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CounterSnapshot, MemoryCounterStore};
    use async_trait::async_trait;

    struct FixedRules {
        amount: u64,
        limit: u64,
    }

    impl LimitRules for FixedRules {
        type Request = str;

        fn key(&self, request: &str) -> String {
            format!("test:{}", request)
        }

        fn amount(&self, _request: &str) -> u64 {
            self.amount
        }

        fn window(&self) -> Duration {
            Duration::from_secs(15)
        }

        fn limit(&self) -> u64 {
            self.limit
        }
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _: &str, _: u64, _: Duration) -> Result<CounterSnapshot> {
            Err(QuotaError::StoreUnavailable("connection refused".into()))
        }

        async fn current(&self, _: &str) -> Result<u64> {
            Err(QuotaError::StoreUnavailable("connection refused".into()))
        }
    }

    fn limiter(amount: u64, limit: u64) -> WindowedRateLimiter<FixedRules> {
        WindowedRateLimiter::new(
            FixedRules { amount, limit },
            Arc::new(MemoryCounterStore::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_scenario() {
        let limiter = limiter(40, 100);

        let first = limiter.check("a").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 60);

        let second = limiter.check("a").await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 20);

        let third = limiter.check("a").await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.reset_after, Duration::from_secs(15));

        tokio::time::advance(Duration::from_secs(16)).await;

        let after_reset = limiter.check("a").await.unwrap();
        assert!(after_reset.allowed);
        assert_eq!(after_reset.remaining, 60);
    }

    #[tokio::test]
    async fn test_admits_up_to_exact_limit() {
        let limiter = limiter(1, 5);

        for i in 1..=5 {
            let admission = limiter.check("a").await.unwrap();
            assert!(admission.allowed, "Request {} should be allowed", i);
            assert_eq!(admission.remaining, 5 - i);
        }

        assert!(!limiter.check("a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_amount_over_limit_never_allowed() {
        let limiter = limiter(101, 100);
        assert!(!limiter.check("a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_denied_checks_still_count() {
        let limiter = limiter(40, 100);
        for _ in 0..3 {
            limiter.check("a").await.unwrap();
        }
        assert_eq!(limiter.current("a").await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(60, 100);
        assert!(limiter.check("a").await.unwrap().allowed);
        assert!(limiter.check("b").await.unwrap().allowed);
        assert!(!limiter.check("a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_closed() {
        let limiter =
            WindowedRateLimiter::new(FixedRules { amount: 1, limit: 10 }, Arc::new(DownStore));

        let result = limiter.check_with_policy("a", FailurePolicy::FailClosed).await;
        assert!(matches!(result, Err(QuotaError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_open() {
        let limiter =
            WindowedRateLimiter::new(FixedRules { amount: 1, limit: 10 }, Arc::new(DownStore));

        let admission = limiter
            .check_with_policy("a", FailurePolicy::FailOpen)
            .await
            .unwrap();
        assert!(admission.allowed);
        assert_eq!(admission.remaining, 10);
    }
}
