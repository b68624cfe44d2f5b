//! Fixed-target port forwarding: spec.md §4.5 "Port-forward listener".

use std::net::SocketAddr;
use std::sync::Arc;

use btlink_core::{LinkConnector, MuxManager};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::bridge;

/// Bind `local_port` and forward every accepted connection to
/// `remote_addr` over a freshly opened stream on `manager`. Runs until
/// `shutdown` fires or the listener socket errors out.
pub async fn run<C: LinkConnector>(
    manager: Arc<MuxManager<C>>,
    local_port: u16,
    remote_addr: SocketAddr,
    mut shutdown: oneshot::Receiver<()>,
) {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], local_port).into();
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(port = local_port, error = %e, "failed to bind port-forward listener");
            return;
        }
    };
    info!(port = local_port, remote = %remote_addr, "port-forward listener started");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(port = local_port, "port-forward listener stopping");
                return;
            }
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(port = local_port, error = %e, "accept failed");
                        continue;
                    }
                };
                let manager = manager.clone();
                tokio::spawn(async move {
                    match manager.open_stream(remote_addr).await {
                        Ok(vc) => {
                            info!(port = local_port, %peer, remote = %remote_addr, "forwarding connection");
                            bridge(tcp, vc).await;
                        }
                        Err(e) => {
                            warn!(port = local_port, %peer, error = %e, "open_stream failed, closing accepted connection");
                            drop(tcp);
                        }
                    }
                });
            }
        }
    }
}
