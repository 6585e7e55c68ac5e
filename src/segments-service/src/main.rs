//! Segments service: user segment membership with expiring memberships,
//! random cohort assignment and an append-only operation history.
//!
//! Main entry point that wires the store, background sweeper and HTTP API.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use segments_api::{ApiServer, AppState};
use segments_core::config::AppConfig;
use segments_core::SystemClock;
use segments_membership::{run_sweep_scheduler, ExpirationSweeper, Store};
use segments_reports::LocalReportStore;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "segments-service")]
#[command(about = "User segment membership service")]
#[command(version)]
struct Cli {
    /// Configuration file (any format the `config` crate understands)
    #[arg(long, env = "SEGMENTS_CONFIG")]
    config: Option<String>,

    /// Bind address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long)]
    http_port: Option<u16>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    database: Option<String>,

    /// Do not run the background expiration sweeper
    #[arg(long, default_value_t = false)]
    no_sweeper: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "segments_service=info,segments_membership=info,segments_api=info,tower_http=info"
                    .into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Segments service starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(host) = cli.host {
        config.api.host = host;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    if cli.no_sweeper {
        config.sweeper.enabled = false;
    }

    info!(
        host = %config.api.host,
        http_port = config.api.http_port,
        database = %config.database.path,
        sweeper = config.sweeper.enabled,
        "Configuration loaded"
    );

    let store = Arc::new(Store::open(&config.database, Arc::new(SystemClock))?);
    let sweeper = Arc::new(ExpirationSweeper::new(store.clone()));

    let reports = LocalReportStore::from_config(&config.reports);
    if let Err(e) = reports.prepare() {
        warn!(error = %e, "Report export directory unavailable, report links disabled");
    }

    let state = AppState::new(store, sweeper.clone(), Arc::new(reports));
    let api_server = ApiServer::new(config.clone(), state);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let (stop_sweeper, stop_rx) = mpsc::channel(1);
    let scheduler = if config.sweeper.enabled {
        let every = Duration::from_secs(config.sweeper.interval_secs.max(1));
        Some(tokio::spawn(run_sweep_scheduler(sweeper, every, stop_rx)))
    } else {
        info!("Expiration sweeper disabled");
        None
    };

    info!("Segments service is ready to serve traffic");

    let served = api_server.start_http(shutdown_signal()).await;

    let _ = stop_sweeper.send(()).await;
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            error!(error = %e, "Sweep scheduler terminated abnormally");
        }
    }

    info!("Segments service stopped");
    served
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}
