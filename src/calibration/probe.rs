//! Latency probes against the upstream.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

/// Errors a single probe can end with.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Probe failed: {0}")]
    Other(String),
}

/// One round-trip measurement against the upstream.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Issue one probe and return its round-trip time.
    async fn probe(&self) -> Result<Duration, ProbeError>;
}

/// Times a `GET` against a cheap upstream endpoint.
///
/// Any HTTP response counts as a sample; only transport failures do not.
/// The body is read to completion and discarded.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, user_agent: &str) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        response.bytes().await?;
        let elapsed = started.elapsed();

        trace!(
            url = %self.url,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Probe completed"
        );
        Ok(elapsed)
    }
}
