//! The admission entry point used by the crawl pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::Response;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::calibration::{BaselineCalibrator, BaselineReader};
use crate::config::QuotaConfig;
use crate::error::Result;
use crate::executor::RequestExecutor;
use crate::ratelimit::{Admission, ComputeLimiter, ComputeRequest};
use crate::store::{build_store, MemoryCounterStore};
use crate::tokens::{LimitedTokenFactory, Token, TokenPool};

/// Header carrying the upstream's remaining quota for the credential used.
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Header carrying the epoch second at which that quota resets.
const RESET_HEADER: &str = "x-ratelimit-reset";
/// Bench length when the upstream reports no reset time.
const DEFAULT_BENCH: Duration = Duration::from_secs(60);

/// What happened to a request sent through [`QuotaGate::execute`].
#[derive(Debug)]
pub enum GateOutcome {
    /// The compute budget refused the request; nothing was sent.
    Deferred {
        remaining: u64,
        retry_after: Duration,
    },
    /// The request was sent; the transport outcome is untouched.
    Completed {
        token: Token,
        response: reqwest::Result<Response>,
    },
}

/// Compute limiter, token factory, executor and calibrator wired over one
/// counter store.
pub struct QuotaGate {
    compute: ComputeLimiter,
    tokens: LimitedTokenFactory,
    executor: RequestExecutor,
    calibrator: Arc<BaselineCalibrator>,
    memory_store: Option<Arc<MemoryCounterStore>>,
    sweep_interval: Duration,
}

impl QuotaGate {
    /// Build every component from `config`.
    ///
    /// Fails with `NoTokensConfigured` when no credentials are configured.
    pub fn from_config(config: &QuotaConfig) -> Result<Self> {
        let (store, memory_store) = build_store(&config.store)?;

        let compute = ComputeLimiter::new(&config.compute, &config.store, store.clone());
        let pool = TokenPool::from_config(&config.tokens)?;
        let tokens =
            LimitedTokenFactory::new(pool, &config.tokens, config.store.failure_policy, store);
        let executor = RequestExecutor::new(&config.executor)?;
        let calibrator = Arc::new(BaselineCalibrator::from_config(&config.calibration)?);

        info!(backend = %config.store.backend, "Quota gate ready");

        Ok(Self {
            compute,
            tokens,
            executor,
            calibrator,
            memory_store,
            sweep_interval: config.store.sweep_interval(),
        })
    }

    /// Start the periodic calibrator and, for the in-memory store, the
    /// counter sweeper. Both stop when `shutdown` fires.
    pub fn start(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.calibrator.clone().spawn(shutdown.clone())];
        if let Some(store) = &self.memory_store {
            handles.push(store.clone().spawn_sweeper(self.sweep_interval, shutdown.clone()));
        }
        handles
    }

    /// Check out a credential within its own quota.
    pub async fn acquire_token(&self) -> Result<Token> {
        self.tokens.acquire().await
    }

    /// Decide whether `request` may proceed against the compute budget.
    pub async fn admit(&self, request: &ComputeRequest) -> Result<Admission> {
        self.compute.admit(request).await
    }

    /// Admit `request`, and if admitted acquire a token and send a `GET` to `url`.
    ///
    /// A deferred request never checks out a token, so it costs no credential
    /// quota. Upstream quota headers on the response are fed back to the
    /// token factory; the response itself is returned unchanged.
    pub async fn execute(&self, url: &str, request: &ComputeRequest) -> Result<GateOutcome> {
        let admission = self.compute.admit(request).await?;
        if !admission.allowed {
            debug!(
                key = %request.key,
                amount = request.amount,
                "Request deferred by compute budget"
            );
            return Ok(GateOutcome::Deferred {
                remaining: admission.remaining,
                retry_after: admission.reset_after,
            });
        }

        let token = self.tokens.acquire().await?;
        let response = self.executor.execute(url, Some(&token)).await;
        if let Ok(response) = &response {
            if let Some((remaining, reset_after)) = upstream_quota(response.headers()) {
                self.tokens.report_remaining(&token, remaining, reset_after);
            }
        }

        Ok(GateOutcome::Completed { token, response })
    }

    /// The latest latency baseline for backoff and pacing.
    pub fn baseline(&self) -> BaselineReader {
        self.calibrator.reader()
    }

    pub fn calibrator(&self) -> &Arc<BaselineCalibrator> {
        &self.calibrator
    }

    pub fn compute(&self) -> &ComputeLimiter {
        &self.compute
    }

    pub fn tokens(&self) -> &LimitedTokenFactory {
        &self.tokens
    }
}

/// The upstream's remaining count and time to reset, if it sent them.
fn upstream_quota(headers: &HeaderMap) -> Option<(u64, Duration)> {
    let remaining = headers
        .get(REMAINING_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;

    let reset_after = headers
        .get(RESET_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map(|epoch| Duration::from_secs((epoch - Utc::now().timestamp()).max(0) as u64))
        .unwrap_or(DEFAULT_BENCH);

    Some((remaining, reset_after))
}
