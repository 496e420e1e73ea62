//! Token issuance gated by each token's own quota.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::pool::{Token, TokenPool};
use crate::config::TokenConfig;
use crate::error::{QuotaError, Result};
use crate::ratelimit::{FailurePolicy, KeyScope, LimitRules, WindowedRateLimiter};
use crate::store::CounterStore;

/// Resource name under which per-token counters are kept.
const RESOURCE: &str = "token";

/// What `acquire` does once every token is over its quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Wait for the earliest token to free up, bounded by the configured max wait
    #[default]
    Wait,
    /// Return `AllTokensExhausted` immediately
    Fail,
}

/// Limit rules for per-token checkouts.
///
/// Keys are not host-scoped: a credential's upstream quota is the same
/// whichever host spends it.
#[derive(Debug, Clone)]
pub struct TokenRules {
    scope: KeyScope,
    window: Duration,
    limit: u64,
}

impl LimitRules for TokenRules {
    type Request = Token;

    fn key(&self, token: &Token) -> String {
        self.scope.key(RESOURCE, token.fingerprint())
    }

    fn amount(&self, _token: &Token) -> u64 {
        1
    }

    fn window(&self) -> Duration {
        self.window
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}

/// Result of one pass over the pool.
enum Scan {
    Issued(Token),
    Exhausted { retry_after: Option<Duration> },
}

/// Issues tokens from a [`TokenPool`], skipping any that are over their own
/// windowed quota or that the upstream reported as nearly spent.
///
/// `acquire` alternates between scanning one full rotation and, when every
/// token was refused, blocking until the earliest window or bench ends or
/// [`wake`](Self::wake) is called. Dropping the `acquire` future at any
/// point leaves the pool consistent.
pub struct LimitedTokenFactory {
    pool: TokenPool,
    limiter: WindowedRateLimiter<TokenRules>,
    policy: ExhaustionPolicy,
    failure_policy: FailurePolicy,
    max_wait: Duration,
    min_backoff: Duration,
    min_remaining: u64,
    /// Fingerprint to the instant the token may be issued again.
    benched: DashMap<String, Instant>,
    wake: Notify,
}

impl LimitedTokenFactory {
    pub fn new(
        pool: TokenPool,
        config: &TokenConfig,
        failure_policy: FailurePolicy,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        info!(
            tokens = pool.len(),
            window_secs = config.window_secs,
            limit = config.limit,
            exhaustion = ?config.exhaustion,
            "Created limited token factory"
        );

        let rules = TokenRules {
            scope: KeyScope::local(),
            window: config.window(),
            limit: config.limit,
        };

        Self {
            pool,
            limiter: WindowedRateLimiter::new(rules, store),
            policy: config.exhaustion,
            failure_policy,
            max_wait: config.max_wait(),
            min_backoff: config.min_backoff(),
            min_remaining: config.min_remaining,
            benched: DashMap::new(),
            wake: Notify::new(),
        }
    }

    /// Check out a token that is within its own quota.
    pub async fn acquire(&self) -> Result<Token> {
        let started = Instant::now();

        loop {
            // Registered before scanning so a wake that lands mid-scan is kept.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retry_after = match self.scan().await? {
                Scan::Issued(token) => return Ok(token),
                Scan::Exhausted { retry_after } => retry_after,
            };

            let waited = started.elapsed();
            if self.policy == ExhaustionPolicy::Fail || waited >= self.max_wait {
                warn!(
                    tokens = self.pool.len(),
                    waited_ms = waited.as_millis() as u64,
                    retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                    "All tokens exhausted"
                );
                return Err(QuotaError::AllTokensExhausted { retry_after });
            }

            let delay = with_jitter(retry_after.unwrap_or(self.min_backoff).max(self.min_backoff))
                .min(self.max_wait - waited);

            debug!(delay_ms = delay.as_millis() as u64, "All tokens exhausted, waiting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = notified => {
                    trace!("Token factory woken early");
                }
            }
        }
    }

    async fn scan(&self) -> Result<Scan> {
        let mut shortest: Option<Duration> = None;

        for _ in 0..self.pool.len() {
            let token = self.pool.next();

            let wait = match self.bench_remaining(&token) {
                Some(wait) => {
                    trace!(token = %token, "Token benched, skipping");
                    wait
                }
                None => {
                    let admission = self
                        .limiter
                        .check_with_policy(&token, self.failure_policy)
                        .await?;
                    if admission.allowed {
                        trace!(token = %token, remaining = admission.remaining, "Issued token");
                        return Ok(Scan::Issued(token));
                    }
                    admission.reset_after
                }
            };

            shortest = Some(shortest.map_or(wait, |current| current.min(wait)));
        }

        Ok(Scan::Exhausted {
            retry_after: shortest,
        })
    }

    fn bench_remaining(&self, token: &Token) -> Option<Duration> {
        let now = Instant::now();
        let until = self.benched.get(token.fingerprint()).map(|entry| *entry)?;
        if until > now {
            Some(until - now)
        } else {
            self.benched
                .remove_if(token.fingerprint(), |_, until| *until <= now);
            None
        }
    }

    /// Feed back the upstream's own "remaining" count for `token`.
    ///
    /// At or below the configured floor the token is benched until
    /// `reset_after` has elapsed; above it any bench is lifted.
    pub fn report_remaining(&self, token: &Token, remaining: u64, reset_after: Duration) {
        if remaining <= self.min_remaining {
            info!(
                token = %token,
                remaining,
                reset_after_secs = reset_after.as_secs(),
                "Benching token until upstream quota resets"
            );
            self.benched
                .insert(token.fingerprint().to_string(), Instant::now() + reset_after);
        } else if self.benched.remove(token.fingerprint()).is_some() {
            debug!(token = %token, remaining, "Token back in rotation");
            self.wake();
        }
    }

    /// Send every blocked `acquire` back to scanning.
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Checkouts recorded for `token` in its live window.
    pub async fn usage(&self, token: &Token) -> Result<u64> {
        self.limiter.current(token).await
    }

    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }
}

/// Add up to 10% random delay so blocked callers do not rescan in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64) / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
