//! rackd - rack controller maintenance daemon

use anyhow::{Context, Result};
use clap::Parser;
use rackd::cli::Cli;
use rackd::{Daemon, DaemonConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging first, so config errors are visible
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("[BOOT] rackd v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => DaemonConfig::load(path),
        None => DaemonConfig::load_default(),
    }
    .context("loading configuration")?;
    info!("[BOOT] Config loaded");

    let daemon = Daemon::new(config).context("starting rackd")?;

    if cli.once {
        return daemon.run_once(cli.service.as_deref()).await;
    }

    daemon.start()?;
    wait_for_shutdown().await?;
    daemon.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("[SHUTDOWN] Interrupt received");
        }
        _ = terminate.recv() => {
            info!("[SHUTDOWN] SIGTERM received");
        }
    }
    Ok(())
}
