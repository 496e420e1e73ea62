//! Configuration management for Quotakeeper.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{QuotaError, Result};
use crate::ratelimit::FailurePolicy;
use crate::store::StoreBackend;
use crate::tokens::{ExhaustionPolicy, Rotation};

/// Prefix for environment variable overrides, e.g. `QUOTAKEEPER__COMPUTE__LIMIT`.
const ENV_PREFIX: &str = "QUOTAKEEPER";

/// Main configuration for the quota admission subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Shared compute budget
    #[serde(default)]
    pub compute: ComputeConfig,

    /// Upstream credentials and their per-token quota
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Latency baseline calibration
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Outbound HTTP transport
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend holds the counters
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL (distributed backend only)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on a single store round trip in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How often the in-memory store drops expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// What to do when the store cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Address used to scope distributed keys to this host.
    /// Detected from the routable interface when unset.
    #[serde(default)]
    pub advertise_addr: Option<IpAddr>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            operation_timeout_ms: default_operation_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            failure_policy: FailurePolicy::default(),
            advertise_addr: None,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_operation_timeout() -> u64 {
    500
}

fn default_sweep_interval() -> u64 {
    30
}

/// Shared compute budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Window length in seconds
    #[serde(default = "default_compute_window")]
    pub window_secs: u64,

    /// Total compute cost admitted per window
    #[serde(default = "default_compute_limit")]
    pub limit: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            window_secs: default_compute_window(),
            limit: default_compute_limit(),
        }
    }
}

impl ComputeConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_compute_window() -> u64 {
    15
}

fn default_compute_limit() -> u64 {
    15000
}

/// Upstream credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// The credentials, in rotation order
    #[serde(default)]
    pub credentials: Vec<String>,

    /// How the pool picks the next credential
    #[serde(default)]
    pub rotation: Rotation,

    /// Per-token window length in seconds
    #[serde(default = "default_token_window")]
    pub window_secs: u64,

    /// Checkouts allowed per token per window
    #[serde(default = "default_token_limit")]
    pub limit: u64,

    /// Behaviour when every token is over its quota
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,

    /// Longest a waiting `acquire` may stay blocked, in milliseconds
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,

    /// Shortest pause between rescans while blocked, in milliseconds
    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,

    /// Upstream "remaining" value at or below which a token is benched
    #[serde(default)]
    pub min_remaining: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            rotation: Rotation::default(),
            window_secs: default_token_window(),
            limit: default_token_limit(),
            exhaustion: ExhaustionPolicy::default(),
            max_wait_ms: default_max_wait(),
            min_backoff_ms: default_min_backoff(),
            min_remaining: 0,
        }
    }
}

impl TokenConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }
}

fn default_token_window() -> u64 {
    3600
}

fn default_token_limit() -> u64 {
    5000
}

fn default_max_wait() -> u64 {
    30_000
}

fn default_min_backoff() -> u64 {
    250
}

/// Latency baseline calibration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Cheap, stable upstream endpoint used only for timing
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Probes per cycle
    #[serde(default = "default_probe_count")]
    pub probe_count: usize,

    /// Delay between probe launches in milliseconds
    #[serde(default = "default_probe_delay")]
    pub probe_delay_ms: u64,

    /// Timeout for a single probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Seconds between calibration cycles
    #[serde(default = "default_calibration_interval")]
    pub interval_secs: u64,

    /// User agent sent with probes
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            probe_url: default_probe_url(),
            probe_count: default_probe_count(),
            probe_delay_ms: default_probe_delay(),
            probe_timeout_ms: default_probe_timeout(),
            interval_secs: default_calibration_interval(),
            user_agent: default_user_agent(),
        }
    }
}

impl CalibrationConfig {
    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_probe_url() -> String {
    "https://api.github.com/rate_limit".to_string()
}

fn default_probe_count() -> usize {
    4
}

fn default_probe_delay() -> u64 {
    50
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_calibration_interval() -> u64 {
    300
}

fn default_user_agent() -> String {
    concat!("quotakeeper/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Outbound transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Whole-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_ms: default_request_timeout(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_request_timeout() -> u64 {
    30_000
}

impl QuotaConfig {
    /// Load configuration from an optional file, then apply
    /// `QUOTAKEEPER__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("tokens.credentials")
                .try_parsing(true),
        );

        let config: QuotaConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a limiter or the calibrator meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.compute.window_secs == 0 {
            return Err(QuotaError::Config("compute.window_secs must be positive".into()));
        }
        if self.compute.limit == 0 {
            return Err(QuotaError::Config("compute.limit must be positive".into()));
        }
        if self.tokens.window_secs == 0 {
            return Err(QuotaError::Config("tokens.window_secs must be positive".into()));
        }
        if self.tokens.limit == 0 {
            return Err(QuotaError::Config("tokens.limit must be positive".into()));
        }
        if self.calibration.probe_count == 0 {
            return Err(QuotaError::Config("calibration.probe_count must be positive".into()));
        }
        if self.calibration.interval_secs == 0 {
            return Err(QuotaError::Config("calibration.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QuotaConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.compute.window(), Duration::from_secs(15));
        assert_eq!(config.compute.limit, 15000);
        assert_eq!(config.calibration.probe_count, 4);
        assert_eq!(config.calibration.probe_delay(), Duration::from_millis(50));
        assert!(config.tokens.credentials.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://cache:6379/
  failure_policy: fail_open
  advertise_addr: 10.1.2.3
compute:
  limit: 100
tokens:
  credentials: [aaa, bbb]
  rotation: least_recently_used
  exhaustion: fail
"#;
        let config = QuotaConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379/");
        assert_eq!(config.store.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.store.advertise_addr, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(config.compute.limit, 100);
        assert_eq!(config.compute.window_secs, 15);
        assert_eq!(config.tokens.credentials, vec!["aaa", "bbb"]);
        assert_eq!(config.tokens.rotation, Rotation::LeastRecentlyUsed);
        assert_eq!(config.tokens.exhaustion, ExhaustionPolicy::Fail);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = r#"
compute:
  limit: 0
"#;
        let result = QuotaConfig::from_yaml(yaml);
        assert!(matches!(result, Err(QuotaError::Config(_))));
    }

    #[test]
    fn test_load_without_file() {
        let config = QuotaConfig::load(None).unwrap();
        assert_eq!(config.compute.limit, 15000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = QuotaConfig::load(Some(Path::new("/nonexistent/quotakeeper.yaml")));
        assert!(matches!(result, Err(QuotaError::Config(_))));
    }
}
