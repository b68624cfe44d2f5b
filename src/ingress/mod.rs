//! Client ingress: TCP connections in, Virtual Connections out.
//!
//! Both listeners below (`port_forward`, `socks5`) end identically, per
//! spec.md §4.5: once a target address is known and `open_stream`
//! succeeds, glue the accepted TCP socket to the new Virtual Connection
//! with two copy tasks and let either side's EOF/error end both. That
//! shared tail is `bridge`, generalized from the teacher's
//! `relay-node/src/main.rs::handle_connection` TCP-to-TCP copy (here
//! one side is a `VirtualConnection` instead of a second `TcpStream`).

pub mod port_forward;
pub mod socks5;

use std::sync::Arc;

use btlink_core::{LinkConnector, VirtualConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Chunk size used when copying from the TCP side into the Virtual
/// Connection; must not exceed `btlink_core::frame::MAX_PAYLOAD`.
const COPY_CHUNK: usize = 2048;

/// Glue `tcp` to `vc` byte-for-byte in both directions. Returns once
/// either direction ends (EOF or error); the other direction is then
/// cancelled and both sides are closed.
pub async fn bridge<C: LinkConnector>(tcp: TcpStream, vc: Arc<VirtualConnection<C>>) {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    let to_remote = {
        let vc = vc.clone();
        async move {
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = match tcp_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if vc.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    };

    let from_remote = {
        let vc = vc.clone();
        async move {
            let mut buf = vec![0u8; 4096];
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
        _ = to_remote => debug!("bridge ended: tcp->stream side closed"),
        _ = from_remote => debug!("bridge ended: stream->tcp side closed"),
    }
    vc.close().await;
}
