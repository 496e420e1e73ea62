//! Quotakeeper - Quota Admission for Crawlers
//!
//! This crate decides, for every request a crawler sends to a rate-limited
//! upstream API, whether it may proceed now, how much of a shared compute
//! budget it consumes, and which credential it should use. Counters live in
//! process memory or in Redis so a fleet of crawlers can share one budget,
//! and a background calibrator keeps a rolling upstream latency baseline
//! for pacing and backoff.

pub mod calibration;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod ratelimit;
pub mod store;
pub mod tokens;

pub use gate::{GateOutcome, QuotaGate};
