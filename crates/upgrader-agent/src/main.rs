//! Daemon entry point.
//!
//! The agent's only CLI surface is "start": resolve configuration, establish
//! identity, spawn the transport driver and the dispatcher, then wait for a
//! shutdown signal. Exit code 0 means a graceful shutdown; 1 means a startup
//! failure or an unhandled error. A second signal during shutdown
//! short-circuits to immediate termination.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use upgrader::fetch::PackageFetcher;
use upgrader::{AgentConfig, DeviceProfile, Dispatcher, Transport};

/// How long a graceful shutdown may take before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "upgrader-agent", version)]
#[command(about = "Device-side upgrade agent: snapshot-backed deploys driven by a control plane")]
struct Cli {
    /// Control-plane endpoint (http(s) or ws(s)). Falls back to SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,

    /// Root of the agent's on-disk layout (downloads, deployed, backup, config).
    #[arg(long, env = "AGENT_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!(error = format!("{e:#}"), "agent exited with an error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let cfg = AgentConfig::from_env(&cli.data_dir, cli.server_url)?;
    cfg.ensure_directories()
        .context("failed to prepare the data directory layout")?;

    let device = DeviceProfile::initialize(&cfg).context("failed to establish device identity")?;
    info!(
        device_id = device.device_id,
        device_name = device.device_name,
        server = cfg.server.url,
        "upgrader agent starting"
    );

    let cfg = Arc::new(cfg);

    // Sweep downloads abandoned by earlier runs before going online.
    if let Ok(fetcher) = PackageFetcher::new(&cfg) {
        if let Err(e) = fetcher.cleanup_temp_files().await {
            warn!(error = format!("{e:#}"), "temp sweep failed");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let (transport, handle) = Transport::new(cfg.clone(), device.clone(), inbound_tx, shutdown_rx);
    let dispatcher = Arc::new(Dispatcher::new(cfg, device, handle)?);

    let transport_task = tokio::spawn(transport.run());
    let _dispatcher_task = tokio::spawn(dispatcher.run(inbound_rx));

    wait_for_signal().await;
    info!("shutdown signal received, going offline");
    shutdown_tx.send(true).ok();

    // The transport gets a bounded window to push the offline status; a
    // second signal skips straight to termination.
    tokio::select! {
        _ = transport_task => {}
        _ = wait_for_signal() => {
            warn!("second signal received, terminating immediately");
            std::process::exit(0);
        }
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!("graceful shutdown timed out");
        }
    }

    info!("agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
