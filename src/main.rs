use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotakeeper::calibration::BaselineCalibrator;
use quotakeeper::config::QuotaConfig;
use quotakeeper::ratelimit::{ComputeLimiter, ComputeRequest};
use quotakeeper::store::build_store;
use quotakeeper::QuotaGate;

#[derive(Debug, Parser)]
#[command(name = "quotakeeper", version, about = "Quota admission for rate-limited upstream APIs")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one calibration cycle and print the baseline
    Calibrate,
    /// Keep the baseline calibrated and counters swept until shutdown
    Run,
    /// Check one request against the compute budget
    Admit {
        /// Budget key
        #[arg(long)]
        key: String,
        /// Compute cost
        #[arg(long, default_value_t = 1)]
        amount: u64,
    },
    /// Check out one token and print its fingerprint
    Token,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = QuotaConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Calibrate => {
            let calibrator = BaselineCalibrator::from_config(&config.calibration)?;
            match calibrator.calibrate().await {
                Some(estimate) => println!("{}", serde_json::to_string_pretty(&estimate)?),
                None => anyhow::bail!(
                    "No baseline probe succeeded against {}",
                    config.calibration.probe_url
                ),
            }
        }
        Command::Run => {
            let gate = QuotaGate::from_config(&config).context("Failed to build quota gate")?;
            let shutdown = CancellationToken::new();
            let handles = gate.start(&shutdown);

            info!("Quotakeeper running");
            shutdown_signal().await;
            shutdown.cancel();

            for handle in handles {
                handle.await?;
            }
            info!("Quotakeeper stopped");
        }
        Command::Admit { key, amount } => {
            let (store, _) = build_store(&config.store)?;
            let limiter = ComputeLimiter::new(&config.compute, &config.store, store);
            let admission = limiter.admit(&ComputeRequest::new(key, amount)).await?;
            println!(
                "{}",
                serde_json::json!({
                    "allowed": admission.allowed,
                    "remaining": admission.remaining,
                    "reset_after_ms": admission.reset_after.as_millis() as u64,
                })
            );
        }
        Command::Token => {
            let gate = QuotaGate::from_config(&config).context("Failed to build quota gate")?;
            let token = gate.acquire_token().await?;
            println!("{}", token.fingerprint());
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
