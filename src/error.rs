//! Error types for the quota admission subsystem.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Quotakeeper operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or did not answer in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The credential list was empty
    #[error("No upstream tokens configured")]
    NoTokensConfigured,

    /// Every token in the pool is currently over its own quota
    #[error("All tokens exhausted, retry after {retry_after:?}")]
    AllTokensExhausted {
        /// Shortest time until one of the tokens frees up, if known
        retry_after: Option<Duration>,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        QuotaError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for Quotakeeper operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
