//! Shared compute budget for upstream requests.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::scope::{local_address, KeyScope};
use super::window::{Admission, FailurePolicy, LimitRules, WindowedRateLimiter};
use crate::config::{ComputeConfig, StoreConfig};
use crate::error::Result;
use crate::store::CounterStore;

/// Resource name under which compute counters are kept.
const RESOURCE: &str = "compute";

/// A planned upstream request and what it costs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRequest {
    /// Budget the request draws from, e.g. an upstream API family
    pub key: String,
    /// Application-assigned compute cost
    pub amount: u64,
}

impl ComputeRequest {
    pub fn new(key: impl Into<String>, amount: u64) -> Self {
        Self {
            key: key.into(),
            amount,
        }
    }
}

/// Limit rules for the compute budget.
#[derive(Debug, Clone)]
pub struct ComputeRules {
    scope: KeyScope,
    window: Duration,
    limit: u64,
}

impl LimitRules for ComputeRules {
    type Request = ComputeRequest;

    fn key(&self, request: &ComputeRequest) -> String {
        self.scope.key(RESOURCE, &request.key)
    }

    fn amount(&self, request: &ComputeRequest) -> u64 {
        request.amount
    }

    fn window(&self) -> Duration {
        self.window
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}

/// Admits upstream requests against a windowed compute budget.
///
/// With a distributed store the budget is scoped to this host's address, so
/// every host keeps its own budget in the shared store.
pub struct ComputeLimiter {
    limiter: WindowedRateLimiter<ComputeRules>,
    policy: FailurePolicy,
}

impl ComputeLimiter {
    /// Create a compute limiter over `store`, which must be the store
    /// `store_config` describes.
    pub fn new(
        config: &ComputeConfig,
        store_config: &StoreConfig,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        let scope = if store_config.backend.is_distributed() {
            let address = store_config.advertise_addr.unwrap_or_else(local_address);
            KeyScope::host(address.to_string())
        } else {
            KeyScope::local()
        };

        info!(
            backend = %store_config.backend,
            identity = scope.identity().unwrap_or("-"),
            window_secs = config.window_secs,
            limit = config.limit,
            failure_policy = ?store_config.failure_policy,
            "Created compute limiter"
        );

        let rules = ComputeRules {
            scope,
            window: config.window(),
            limit: config.limit,
        };

        Self {
            limiter: WindowedRateLimiter::new(rules, store),
            policy: store_config.failure_policy,
        }
    }

    /// Decide whether `request` may proceed now, charging its cost.
    pub async fn admit(&self, request: &ComputeRequest) -> Result<Admission> {
        self.limiter.check_with_policy(request, self.policy).await
    }

    /// Charge cost discovered after a request completed. Returns the budget left.
    pub async fn consume(&self, request: &ComputeRequest) -> Result<u64> {
        self.limiter.record(request).await
    }

    /// Cost charged to `key` in the live window.
    pub async fn usage(&self, key: &str) -> Result<u64> {
        self.limiter.current(&ComputeRequest::new(key, 0)).await
    }

    pub fn limit(&self) -> u64 {
        self.limiter.rules().limit
    }

    pub fn window(&self) -> Duration {
        self.limiter.rules().window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCounterStore, StoreBackend};

    fn memory_limiter(limit: u64) -> (ComputeLimiter, Arc<MemoryCounterStore>) {
        let store = Arc::new(MemoryCounterStore::new());
        let config = ComputeConfig {
            window_secs: 15,
            limit,
        };
        let limiter = ComputeLimiter::new(&config, &StoreConfig::default(), store.clone());
        (limiter, store)
    }

    #[test]
    fn test_rules_key_scoping() {
        let request = ComputeRequest::new("repos", 3);

        let local = ComputeRules {
            scope: KeyScope::local(),
            window: Duration::from_secs(15),
            limit: 15000,
        };
        assert_eq!(local.key(&request), "compute:repos");
        assert_eq!(local.amount(&request), 3);

        let distributed = ComputeRules {
            scope: KeyScope::host("192.168.0.9"),
            ..local
        };
        assert_eq!(distributed.key(&request), "192.168.0.9:compute:repos");
    }

    #[test]
    fn test_defaults_from_config() {
        let (limiter, _) = memory_limiter(ComputeConfig::default().limit);
        assert_eq!(limiter.limit(), 15000);
        assert_eq!(limiter.window(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_admit_charges_cost() {
        let (limiter, store) = memory_limiter(100);
        let request = ComputeRequest::new("repos", 40);

        assert!(limiter.admit(&request).await.unwrap().allowed);
        assert!(limiter.admit(&request).await.unwrap().allowed);
        let denied = limiter.admit(&request).await.unwrap();
        assert!(!denied.allowed);

        assert_eq!(store.current("compute:repos").await.unwrap(), 120);
        assert_eq!(limiter.usage("repos").await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_consume_adds_to_budget() {
        let (limiter, _) = memory_limiter(100);

        let remaining = limiter.consume(&ComputeRequest::new("repos", 30)).await.unwrap();
        assert_eq!(remaining, 70);

        let admission = limiter.admit(&ComputeRequest::new("repos", 80)).await.unwrap();
        assert!(!admission.allowed);
    }

    #[tokio::test]
    async fn test_distributed_scope_uses_advertise_addr() {
        let store = Arc::new(MemoryCounterStore::new());
        let store_config = StoreConfig {
            backend: StoreBackend::Redis,
            advertise_addr: Some("10.9.8.7".parse().unwrap()),
            ..StoreConfig::default()
        };
        let limiter = ComputeLimiter::new(&ComputeConfig::default(), &store_config, store.clone());

        limiter.admit(&ComputeRequest::new("search", 5)).await.unwrap();
        assert_eq!(store.current("10.9.8.7:compute:search").await.unwrap(), 5);
    }
}
