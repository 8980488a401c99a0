//! delved — the Delve daemon.
//!
//! Single binary running the telemetry API and the scheduler control loop
//! against one embedded state store.
//!
//! # Usage
//!
//! ```text
//! delved run --port 8080 --data-dir /var/lib/delve --config delve.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use delve_core::DelveConfig;
use delve_health::TcpProber;
use delve_state::StateStore;
use delved::Daemon;

#[derive(Parser)]
#[command(name = "delved", about = "Delve dungeon pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API and run the scheduler.
    Run {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/delve")]
        data_dir: PathBuf,

        /// TOML config file. `DELVE_*` environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            port,
            data_dir,
            config,
            log_json,
        } => {
            init_tracing(log_json);
            run(port, data_dir, config).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,delved=debug,delve=debug".parse().unwrap());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(port: u16, data_dir: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Delve daemon starting");

    let config = DelveConfig::load(config_path.as_deref())?;
    info!(
        pool = %config.pool_pattern,
        mode = ?config.run_mode,
        reservation_grace_secs = config.reservation_grace_secs(),
        "configuration loaded"
    );

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("delve.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let prober = Arc::new(TcpProber::new(config.probe.port, config.probe.timeout()));
    let daemon = Daemon::assemble(state, config, prober)?;

    // ── Control loop ───────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = daemon.control_loop();
    let control_handle = tokio::spawn(control.run(shutdown_rx));

    // ── API server ─────────────────────────────────────────────

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, daemon.router())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = control_handle.await;
    info!("Delve daemon stopped");
    Ok(())
}
