//! Outbound request transport.
//!
//! The executor only performs network calls. It never retries, delays or
//! backs off on throttling responses; admission and pacing belong to the
//! limiters and the token factory.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response};
use tracing::trace;

use crate::config::ExecutorConfig;
use crate::error::{QuotaError, Result};
use crate::tokens::Token;

/// Thin wrapper around a [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    client: Client,
}

impl RequestExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| QuotaError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Issue a `GET` for `url`, authenticated with `token` when given.
    ///
    /// The outcome is returned as-is: HTTP error statuses arrive as an `Ok`
    /// response and transport failures as the `reqwest::Error`.
    pub async fn execute(&self, url: &str, token: Option<&Token>) -> reqwest::Result<Response> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("token {}", token.expose()));
        }

        let response = request.send().await?;
        trace!(url = %url, status = response.status().as_u16(), "Upstream request completed");
        Ok(response)
    }
}
