//! Upstream credentials and their rotation.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::TokenConfig;
use crate::error::{QuotaError, Result};

/// Hex characters of the SHA-256 digest kept as a token's identity.
const FINGERPRINT_LEN: usize = 16;

/// An opaque upstream credential.
///
/// The secret is only reachable through [`Token::expose`]; `Debug` and
/// counter keys use a fingerprint instead.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token {
    secret: Arc<str>,
    fingerprint: Arc<str>,
}

impl Token {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret: String = secret.into();
        let digest = format!("{:x}", Sha256::digest(secret.as_bytes()));
        Self {
            fingerprint: Arc::from(&digest[..FINGERPRINT_LEN]),
            secret: Arc::from(secret),
        }
    }

    /// The credential itself, for the Authorization header.
    pub fn expose(&self) -> &str {
        &self.secret
    }

    /// Stable identity safe to log and to use in counter keys.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Token").field(&self.fingerprint).finish()
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint)
    }
}

/// How the pool chooses the next token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// Cycle through tokens in configuration order
    #[default]
    RoundRobin,
    /// Pick the token that has gone longest without being issued
    LeastRecentlyUsed,
}

#[derive(Debug)]
struct RotationState {
    cursor: usize,
    /// Checkout sequence number per token; zero means never issued.
    last_issued: Vec<u64>,
    sequence: u64,
}

/// An ordered set of credentials issued in rotation.
#[derive(Debug)]
pub struct TokenPool {
    tokens: Vec<Token>,
    rotation: Rotation,
    state: Mutex<RotationState>,
}

impl TokenPool {
    /// Create a pool. Fails with `NoTokensConfigured` when `tokens` is empty.
    pub fn new(tokens: Vec<Token>, rotation: Rotation) -> Result<Self> {
        if tokens.is_empty() {
            return Err(QuotaError::NoTokensConfigured);
        }

        let state = RotationState {
            cursor: 0,
            last_issued: vec![0; tokens.len()],
            sequence: 0,
        };

        Ok(Self {
            tokens,
            rotation,
            state: Mutex::new(state),
        })
    }

    /// Create a pool from the configured credentials, ignoring blank entries.
    pub fn from_config(config: &TokenConfig) -> Result<Self> {
        let tokens: Vec<Token> = config
            .credentials
            .iter()
            .map(|secret| secret.trim())
            .filter(|secret| !secret.is_empty())
            .map(Token::new)
            .collect();

        info!(
            count = tokens.len(),
            rotation = ?config.rotation,
            "Loaded upstream tokens"
        );

        Self::new(tokens, config.rotation)
    }

    /// Issue the next token according to the rotation policy.
    pub fn next(&self) -> Token {
        let mut state = self.state.lock();
        let index = match self.rotation {
            Rotation::RoundRobin => {
                let index = state.cursor % self.tokens.len();
                state.cursor = (index + 1) % self.tokens.len();
                index
            }
            Rotation::LeastRecentlyUsed => state
                .last_issued
                .iter()
                .enumerate()
                .min_by_key(|(_, issued)| **issued)
                .map(|(index, _)| index)
                .unwrap_or(0),
        };

        state.sequence += 1;
        state.last_issued[index] = state.sequence;
        self.tokens[index].clone()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(secrets: &[&str], rotation: Rotation) -> TokenPool {
        TokenPool::new(secrets.iter().map(|s| Token::new(*s)).collect(), rotation).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = TokenPool::new(Vec::new(), Rotation::RoundRobin);
        assert!(matches!(result, Err(QuotaError::NoTokensConfigured)));
    }

    #[test]
    fn test_blank_credentials_ignored() {
        let config = TokenConfig {
            credentials: vec!["  ".to_string(), String::new()],
            ..TokenConfig::default()
        };
        assert!(matches!(
            TokenPool::from_config(&config),
            Err(QuotaError::NoTokensConfigured)
        ));

        let config = TokenConfig {
            credentials: vec![" abc ".to_string(), String::new()],
            ..TokenConfig::default()
        };
        let pool = TokenPool::from_config(&config).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.tokens()[0].expose(), "abc");
    }

    #[test]
    fn test_round_robin() {
        let pool = pool(&["a", "b", "c"], Rotation::RoundRobin);
        let issued: Vec<String> = (0..6).map(|_| pool.next().expose().to_string()).collect();
        assert_eq!(issued, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_least_recently_used() {
        let pool = pool(&["a", "b", "c"], Rotation::LeastRecentlyUsed);
        assert_eq!(pool.next().expose(), "a");
        assert_eq!(pool.next().expose(), "b");
        assert_eq!(pool.next().expose(), "c");
        assert_eq!(pool.next().expose(), "a");
    }

    #[test]
    fn test_fingerprint_hides_secret() {
        let token = Token::new("ghp_supersecret");
        assert_eq!(token.fingerprint().len(), FINGERPRINT_LEN);
        assert!(!format!("{:?}", token).contains("supersecret"));
        assert!(!token.to_string().contains("supersecret"));
        assert_eq!(token.fingerprint(), Token::new("ghp_supersecret").fingerprint());
        assert_ne!(token.fingerprint(), Token::new("ghp_other").fingerprint());
    }
}
