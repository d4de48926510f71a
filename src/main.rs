//! custody-sweeper daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!        RPC node(s)
//!            │
//!  ┌─────────┼──────────────────────────────────────────────────────┐
//!  │         ▼                                                      │
//!  │  BlockPoller ──block #──▶ DepositObserver ──SweepJob──┐         │
//!  │                               │                       ▼         │
//!  │  BackupScanner ───────SweepJob┼──────────────▶ SweepCoordinator │
//!  │                               │                 │         │     │
//!  │                               ▼                 ▼         ▼     │
//!  │                         deposits table    SweepEngine  GasTopUp │
//!  │                                                 │         │     │
//!  │                                                 ▼         ▼     │
//!  │                                            TxSubmitter (nonces) │
//!  │                                                                 │
//!  │  failures ─▶ IncidentManager ─▶ RetryScheduler ─▶ re-enqueue    │
//!  └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use custody_sweeper::config::load_config;
use custody_sweeper::lifecycle::{drain, wait_for_signal, Components, Secrets, Shutdown};
use custody_sweeper::observability::{logging, metrics};

/// Time allowed for tasks to stop after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "custody-sweeper")]
#[command(about = "Custodial deposit observer and sweeper", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/sweeper.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "custody-sweeper starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let secrets = Secrets::from_env(&config.custody).context("reading custody secrets")?;
    let components = Components::build(config, &secrets)
        .await
        .context("initializing components")?;
    drop(secrets);

    let shutdown = Shutdown::new();
    let tasks = components.spawn(&shutdown);
    tracing::info!(tasks = tasks.len(), "Pipeline running");

    wait_for_signal(&shutdown).await;
    drain(tasks, SHUTDOWN_DEADLINE).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
