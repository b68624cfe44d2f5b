//! Server egress: spec.md §4.6. Driven entirely by inbound control
//! frames — dial the requested TCP target, register the resulting
//! socket under the advertised id, and run a reverse-bridge task
//! copying TCP bytes into outbound frames. Grounded on the teacher's
//! `relay-node::handle_connection` bidirectional copy shape
//! (`relay-node/src/main.rs`), generalized from a fixed forward target
//! to the control-frame-supplied one.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use btlink_core::frame::MAX_PAYLOAD;
use btlink_core::{ControlHandler, LinkConnector, MuxManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Read chunk size used by the reverse bridge (spec.md §4.6: "chunks ≤ 4
/// KiB"). Each read is split into `write_frame` calls no larger than
/// [`MAX_PAYLOAD`] (2 KiB), since one `VirtualConnection::write` call
/// produces exactly one frame and frames cap payloads at `MAX_PAYLOAD`.
const REVERSE_BRIDGE_CHUNK: usize = 4096;

pub struct EgressHandler;

#[async_trait]
impl<C: LinkConnector> ControlHandler<C> for EgressHandler {
    async fn on_open(&self, manager: &Arc<MuxManager<C>>, new_id: u16, target: SocketAddr) {
        let tcp = match TcpStream::connect(target).await {
            Ok(tcp) => tcp,
            Err(e) => {
                warn!(stream = new_id, %target, error = %e, "dial failed, dropping stream silently");
                return;
            }
        };
        info!(stream = new_id, %target, "egress connection established");

        let vc = manager.bind_stream(new_id).await;
        tokio::spawn(async move {
            bridge(tcp, vc).await;
        });
    }
}

async fn bridge<C: LinkConnector>(tcp: TcpStream, vc: Arc<btlink_core::VirtualConnection<C>>) {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    let reverse_bridge = {
        let vc = vc.clone();
        async move {
            let mut buf = vec![0u8; REVERSE_BRIDGE_CHUNK];
            loop {
                let n = match tcp_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let mut failed = false;
                for sub in buf[..n].chunks(MAX_PAYLOAD as usize) {
                    if vc.write(sub).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
        }
    };

    let forward = {
        let vc = vc.clone();
        async move {
            let mut buf = vec![0u8; REVERSE_BRIDGE_CHUNK];
            loop {
                let n = match vc.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if tcp_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = reverse_bridge => {}
        _ = forward => {}
    }
    vc.close().await;
}
