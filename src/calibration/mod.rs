//! Upstream latency baseline.
//!
//! A calibration cycle launches a small burst of probes at fixed offsets,
//! waits for all of them to settle, and publishes the floor of the mean
//! latency of the ones that succeeded. Backoff and pacing code elsewhere
//! reads the published estimate through a [`BaselineReader`].

mod probe;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::error::{QuotaError, Result};

pub use probe::{HttpProbe, Probe, ProbeError};

/// The rolling latency baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaselineEstimate {
    /// Mean round trip of the successful probes, floored, in milliseconds
    pub millis: u64,
    /// How many probes contributed
    pub samples: usize,
    /// When the cycle that produced this estimate finished
    pub measured_at: DateTime<Utc>,
}

impl BaselineEstimate {
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }
}

/// Read side of the published baseline. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BaselineReader {
    receiver: watch::Receiver<Option<BaselineEstimate>>,
}

impl BaselineReader {
    /// The latest estimate, or `None` before the first successful cycle.
    pub fn current(&self) -> Option<BaselineEstimate> {
        self.receiver.borrow().clone()
    }

    /// Wait until a new estimate is published.
    pub async fn changed(&mut self) -> Option<BaselineEstimate> {
        self.receiver.changed().await.ok()?;
        self.receiver.borrow_and_update().clone()
    }
}

/// Floor of the mean of the successful samples in milliseconds, or `None`
/// when none succeeded.
pub fn aggregate(samples: &[Option<Duration>]) -> Option<u64> {
    let successes: Vec<u128> = samples
        .iter()
        .flatten()
        .map(|latency| latency.as_millis())
        .collect();

    if successes.is_empty() {
        return None;
    }

    let total: u128 = successes.iter().sum();
    Some((total / successes.len() as u128) as u64)
}

/// Periodically measures upstream latency and publishes the baseline.
pub struct BaselineCalibrator {
    probe: Arc<dyn Probe>,
    probe_count: usize,
    probe_delay: Duration,
    probe_timeout: Duration,
    interval: Duration,
    publisher: watch::Sender<Option<BaselineEstimate>>,
}

impl BaselineCalibrator {
    pub fn new(probe: Arc<dyn Probe>, config: &CalibrationConfig) -> Self {
        let (publisher, _) = watch::channel(None);
        Self {
            probe,
            probe_count: config.probe_count,
            probe_delay: config.probe_delay(),
            probe_timeout: config.probe_timeout(),
            interval: config.interval(),
            publisher,
        }
    }

    /// Calibrator probing `config.probe_url` over HTTP.
    pub fn from_config(config: &CalibrationConfig) -> Result<Self> {
        let probe = HttpProbe::new(config.probe_url.clone(), &config.user_agent)
            .map_err(|e| QuotaError::Config(format!("Failed to build probe client: {}", e)))?;
        Ok(Self::new(Arc::new(probe), config))
    }

    pub fn reader(&self) -> BaselineReader {
        BaselineReader {
            receiver: self.publisher.subscribe(),
        }
    }

    pub fn current(&self) -> Option<BaselineEstimate> {
        self.publisher.borrow().clone()
    }

    /// Launch the probes at fixed offsets and collect every outcome.
    ///
    /// Probes still in flight are aborted if the returned future is dropped.
    async fn sample(&self) -> Vec<Option<Duration>> {
        let mut tasks = JoinSet::new();
        for index in 0..self.probe_count {
            let probe = self.probe.clone();
            let offset = self.probe_delay * index as u32;
            let timeout = self.probe_timeout;
            tasks.spawn(async move {
                tokio::time::sleep(offset).await;
                let latency = match tokio::time::timeout(timeout, probe.probe()).await {
                    Ok(Ok(latency)) => Some(latency),
                    Ok(Err(e)) => {
                        debug!(probe = index, error = %e, "Baseline probe failed");
                        None
                    }
                    Err(_) => {
                        debug!(
                            probe = index,
                            timeout_ms = timeout.as_millis() as u64,
                            "Baseline probe timed out"
                        );
                        None
                    }
                };
                (index, latency)
            });
        }

        let mut samples = vec![None; self.probe_count];
        while let Some(outcome) = tasks.join_next().await {
            match outcome {
                Ok((index, latency)) => samples[index] = latency,
                Err(e) => debug!(error = %e, "Baseline probe task aborted"),
            }
        }
        samples
    }

    /// Run one calibration cycle and return the estimate now in effect.
    ///
    /// When every probe fails the previous estimate stays published.
    pub async fn calibrate(&self) -> Option<BaselineEstimate> {
        let samples = self.sample().await;
        let succeeded = samples.iter().filter(|s| s.is_some()).count();

        match aggregate(&samples) {
            Some(millis) => {
                let estimate = BaselineEstimate {
                    millis,
                    samples: succeeded,
                    measured_at: Utc::now(),
                };
                info!(
                    baseline_ms = millis,
                    samples = succeeded,
                    probes = self.probe_count,
                    "New upstream request baseline"
                );
                self.publisher.send_replace(Some(estimate.clone()));
                Some(estimate)
            }
            None => {
                let previous = self.current();
                warn!(
                    probes = self.probe_count,
                    previous_ms = previous.as_ref().map(|e| e.millis),
                    "All baseline probes failed, keeping previous estimate"
                );
                previous
            }
        }
    }

    /// Recalibrate every interval, starting now, until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                probes = self.probe_count,
                "Starting baseline calibrator"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = self.calibrate() => {}
                        }
                    }
                }
            }
            info!("Baseline calibrator stopped");
        })
    }
}
