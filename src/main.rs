//! `btlink-client`: TCP/SOCKS5 ingress, bridged across a Bluetooth
//! RFCOMM link to a `btlink-server` peer.

mod config;
mod error;
mod ingress;
mod listeners;
mod platform;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use btlink_core::{DiscardControlHandler, MuxManager, ReconnectingLink};
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, PortMapping};

#[derive(Parser)]
#[command(name = "btlink-client", about = "TCP/SOCKS5 ingress bridged over Bluetooth RFCOMM")]
struct Cli {
    /// Path to the JSON configuration document (spec.md §6).
    #[arg(long, default_value = "btlink-client.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Add a port-forward mapping to the config file and exit.
    AddMapping {
        local_port: u16,
        remote_addr: String,
    },
    /// Remove every mapping for `local_port` from the config file and exit.
    RemoveMapping {
        local_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::AddMapping { local_port, remote_addr }) => {
            edit_config(&cli.config, |cfg| {
                cfg.mappings.retain(|m| m.local_port != local_port);
                cfg.mappings.push(PortMapping { local_port, remote_addr });
            })?;
            return Ok(());
        }
        Some(Command::RemoveMapping { local_port }) => {
            edit_config(&cli.config, |cfg| {
                cfg.mappings.retain(|m| m.local_port != local_port);
            })?;
            return Ok(());
        }
        None => {}
    }

    run_service(cli.config).await
}

/// Load, mutate and persist the config document — used by the
/// mapping-management subcommands. The running service (`run_service`)
/// only ever reads it.
fn edit_config(path: &std::path::Path, f: impl FnOnce(&mut Config)) -> Result<()> {
    let mut cfg = Config::load(path);
    f(&mut cfg);
    let json = serde_json::to_string_pretty(&cfg).context("serializing config")?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

async fn run_service(config_path: PathBuf) -> Result<()> {
    let cfg = Config::load(&config_path);
    let mac = platform::parse_mac(&cfg.bluetooth_mac)
        .with_context(|| format!("invalid BluetoothMAC {:?} in config", cfg.bluetooth_mac))?;

    let manager = build_manager(mac);
    let (_reader, _sweeper) = manager.spawn(Arc::new(DiscardControlHandler));

    let registry = Arc::new(listeners::Registry::new());

    for (local_port, remote_addr) in cfg.resolved_mappings() {
        spawn_port_forward(&manager, &registry, local_port, remote_addr).await;
    }

    if !cfg.socks5_listen.is_empty() {
        match cfg.socks5_listen.parse::<SocketAddr>() {
            Ok(bind_addr) => spawn_socks5(&manager, &registry, bind_addr).await,
            Err(e) => warn!(addr = %cfg.socks5_listen, error = %e, "invalid socks5_listen address, skipping"),
        }
    }

    info!("btlink-client running, press Ctrl+C to stop");
    wait_for_shutdown().await;

    info!("shutting down");
    registry.stop_all().await;
    manager.close_link().await;
    Ok(())
}

#[cfg(target_os = "linux")]
fn build_manager(mac: [u8; 6]) -> Arc<MuxManager<platform::linux::LinuxRfcommConnector>> {
    MuxManager::new(ReconnectingLink::new(platform::linux::LinuxRfcommConnector::new(mac)))
}

#[cfg(target_os = "windows")]
fn build_manager(mac: [u8; 6]) -> Arc<MuxManager<platform::windows::WindowsRfcommConnector>> {
    MuxManager::new(ReconnectingLink::new(platform::windows::WindowsRfcommConnector::new(mac)))
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn build_manager(mac: [u8; 6]) -> Arc<MuxManager<platform::android::AndroidRfcommConnector>> {
    MuxManager::new(ReconnectingLink::new(platform::android::AndroidRfcommConnector::new(mac)))
}

async fn spawn_port_forward<C: btlink_core::LinkConnector>(
    manager: &Arc<MuxManager<C>>,
    registry: &Arc<listeners::Registry>,
    local_port: u16,
    remote_addr: SocketAddr,
) {
    let bind_addr = format!("0.0.0.0:{local_port}");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let manager = manager.clone();
    let handle = tokio::spawn(async move {
        ingress::port_forward::run(manager, local_port, remote_addr, shutdown_rx).await;
    });
    registry.register(bind_addr, handle, shutdown_tx).await;
}

async fn spawn_socks5<C: btlink_core::LinkConnector>(
    manager: &Arc<MuxManager<C>>,
    registry: &Arc<listeners::Registry>,
    bind_addr: SocketAddr,
) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let manager = manager.clone();
    let handle = tokio::spawn(async move {
        ingress::socks5::run(manager, bind_addr, shutdown_rx).await;
    });
    registry.register(bind_addr.to_string(), handle, shutdown_tx).await;
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
