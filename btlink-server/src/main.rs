//! `btlink-server`: control-frame-driven TCP egress, the Bluetooth-side
//! peer of `btlink-client`.

#[cfg(target_os = "linux")]
mod bt_listen;
mod egress;

use std::sync::Arc;

use anyhow::{Context, Result};
use btlink_core::MuxManager;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "btlink-server", about = "Control-frame-driven TCP egress over Bluetooth RFCOMM")]
struct Cli {
    /// Bluetooth adapter to register the SPP profile on (currently
    /// informational — `bluer` registers against the system default
    /// adapter; kept as a CLI surface for future multi-adapter support).
    #[arg(long, default_value = "hci0")]
    adapter: String,

    /// RFCOMM channel to advertise (spec.md §6 recommends channel 1).
    #[arg(long, default_value_t = 1)]
    channel: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!(adapter = %cli.adapter, channel = cli.channel, "starting btlink-server");

    run(cli).await
}

#[cfg(target_os = "linux")]
async fn run(cli: Cli) -> Result<()> {
    let connector = bt_listen::BtListenConnector::register(cli.channel)
        .await
        .context("registering SPP profile")?;
    let manager = MuxManager::new(btlink_core::ReconnectingLink::new(connector));
    let (_reader, _sweeper) = manager.spawn(Arc::new(egress::EgressHandler));

    info!("btlink-server running, waiting for inbound rfcomm connections");
    wait_for_shutdown().await;

    info!("shutting down, unregistering profile");
    manager.close_link().await;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_cli: Cli) -> Result<()> {
    anyhow::bail!("btlink-server's BlueZ D-Bus profile listener is Linux-only (spec.md §6)")
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
