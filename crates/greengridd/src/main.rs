//! greengridd — the GreenGrid daemon.
//!
//! Single binary that assembles the broker subsystems and runs the
//! monitoring cycle on a fixed interval:
//! - State store (redb)
//! - Tiered broker (compliance + pricing + placement + slices + migration)
//! - Anomaly monitor
//!
//! An external ingester writes grid snapshots and health reports into the
//! same store; request handlers submit workloads. greengridd is the
//! cron-equivalent that keeps the fleet adapted.
//!
//! # Usage
//!
//! ```text
//! greengridd run --data-dir /var/lib/greengrid --config greengrid.toml
//! greengridd run --data-dir /tmp/gg --once
//! ```

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use greengrid_broker::Broker;
use greengrid_monitor::Monitor;
use greengrid_state::StateStore;

mod config;

use config::GreengridConfig;

#[derive(Parser)]
#[command(name = "greengridd", about = "GreenGrid compute broker daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring loop.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/greengrid")]
        data_dir: PathBuf,

        /// Optional TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the cycle interval in seconds.
        #[arg(long)]
        cycle_interval: Option<u64>,

        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,greengridd=debug,greengrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            config,
            cycle_interval,
            once,
        } => run(data_dir, config, cycle_interval, once).await,
    }
}

async fn run(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    cycle_interval: Option<u64>,
    once: bool,
) -> anyhow::Result<()> {
    info!("GreenGrid daemon starting");

    let mut config = match &config_path {
        Some(path) => GreengridConfig::from_file(path)?,
        None => GreengridConfig::default(),
    };
    if let Some(interval) = cycle_interval {
        config.monitor.cycle_interval_secs = interval;
    }

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("greengrid.redb");

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let broker = Broker::new(state.clone(), config.broker.clone());
    info!("broker initialized");

    let monitor = Monitor::new(state, broker, config.monitor.clone());
    info!(
        interval_secs = config.monitor.cycle_interval_secs,
        "monitor initialized"
    );

    if once {
        let report = monitor.run_cycle(epoch_secs());
        info!(?report, "single cycle complete");
        return Ok(());
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_handle = tokio::spawn(async move {
        monitor.run(shutdown_rx).await;
    });

    // Graceful shutdown on Ctrl-C.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = monitor_handle.await;

    info!("GreenGrid daemon stopped");
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
