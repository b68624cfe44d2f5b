//! The Physical Link: an auto-reconnecting byte pipe to the Bluetooth peer.
//!
//! [`ReconnectingLink`] hides reconnection from its callers entirely —
//! `read_frame`/`write_frame` never return an I/O error. A failing
//! operation instead loops internally, tearing down the dead socket and
//! retrying the platform connect operation with a 1s backoff, then
//! resumes once reconnected. This is the "blocking retry" policy
//! selected in `SPEC_FULL.md` §9 over the alternative (surface the
//! error on first failure, defer reconnect to the next call) — mixing
//! the two produces spurious EOFs in the reader loop.
//!
//! Concrete platform connectors (`LinkConnector` implementations) live
//! in the binaries that use this crate; this module only depends on the
//! `LinkConnector` trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::frame;

/// Delay between failed reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A leaf operation that establishes a fresh byte-stream to the
/// Bluetooth peer. Implementations are platform-specific (Windows raw
/// Winsock `SOCKADDR_BTH`, Linux raw `AF_BLUETOOTH`/`BTPROTO_RFCOMM`,
/// Android TUN, or a BlueZ D-Bus profile accept on the server side) and
/// live outside this crate — this trait is the seam.
#[async_trait]
pub trait LinkConnector: Send + Sync + 'static {
    /// The concrete stream type this connector produces.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Attempt to establish one connection. Returning `Err` does not
    /// stop the reconnect loop; it only schedules the next attempt
    /// after the backoff delay.
    async fn connect(&self) -> Result<Self::Stream, LinkError>;
}

/// An auto-reconnecting byte pipe. See the module docs for the retry
/// contract.
pub struct ReconnectingLink<C: LinkConnector> {
    connector: C,
    read_half: Mutex<Option<ReadHalf<C::Stream>>>,
    write_half: Mutex<Option<WriteHalf<C::Stream>>>,
    reconnect_lock: Mutex<()>,
    connected: AtomicBool,
}

impl<C: LinkConnector> ReconnectingLink<C> {
    /// Construct a link that is not yet connected; the first
    /// `read_frame`/`write_frame` call triggers the initial connect.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            read_half: Mutex::new(None),
            write_half: Mutex::new(None),
            reconnect_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
        }
    }

    /// Read exactly one frame, retrying across reconnects until one
    /// arrives. Never returns an I/O error to the caller.
    pub async fn read_frame(&self) -> (u16, Bytes) {
        loop {
            self.ensure_connected().await;
            let result = {
                let mut guard = self.read_half.lock().await;
                match guard.as_mut() {
                    Some(half) => frame::read_frame(half).await,
                    None => continue,
                }
            };
            match result {
                Ok(v) => return v,
                Err(e) => {
                    warn!(error = %e, "physical link read failed, reconnecting");
                    self.drop_connection().await;
                }
            }
        }
    }

    /// Write one frame, retrying across reconnects until it lands.
    /// Never returns an I/O error to the caller — per `SPEC_FULL.md`
    /// §4/§5, in-flight payloads on a dead physical connection are
    /// allowed to be lost (this write simply restarts against the new
    /// connection rather than resuming mid-payload).
    pub async fn write_frame(&self, id: u16, payload: &[u8]) -> usize {
        loop {
            self.ensure_connected().await;
            let result = {
                let mut guard = self.write_half.lock().await;
                match guard.as_mut() {
                    Some(half) => frame::write_frame(half, id, payload).await,
                    None => continue,
                }
            };
            match result {
                Ok(n) => return n,
                Err(e) => {
                    warn!(error = %e, "physical link write failed, reconnecting");
                    self.drop_connection().await;
                }
            }
        }
    }

    /// Tear down the current connection (if any) and drop any queued
    /// reconnect state. Used at manager shutdown.
    pub async fn close(&self) {
        self.drop_connection().await;
    }

    async fn ensure_connected(&self) {
        if self.connected.load(Ordering::Acquire) {
            return;
        }
        self.reconnect().await;
    }

    async fn drop_connection(&self) {
        self.connected.store(false, Ordering::Release);
        *self.read_half.lock().await = None;
        *self.write_half.lock().await = None;
    }

    /// Reconnect procedure (SPEC_FULL.md §4.1): acquire the reconnect
    /// lock (mutually exclusive with itself); if another task already
    /// reconnected while we waited, return immediately; otherwise loop
    /// the platform connect operation with a 1s backoff until it
    /// succeeds.
    async fn reconnect(&self) {
        let _guard = self.reconnect_lock.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return;
        }
        loop {
            match self.connector.connect().await {
                Ok(stream) => {
                    let (r, w) = split(stream);
                    *self.read_half.lock().await = Some(r);
                    *self.write_half.lock().await = Some(w);
                    self.connected.store(true, Ordering::Release);
                    info!("physical link (re)connected");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed, retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    /// A connector that hands out one end of an in-memory duplex pipe
    /// on each successful connect, and can be told to fail N times
    /// first (simulating S6: read error, reconnect, resume).
    struct FlakyConnector {
        fail_times: std::sync::atomic::AtomicUsize,
        peer: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl LinkConnector for FlakyConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<Self::Stream, LinkError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(LinkError::Closed);
            }
            let (a, b) = tokio::io::duplex(4096);
            *self.peer.lock().await = Some(b);
            Ok(a)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_transient_failures_and_resumes_framing() {
        let connector = Arc::new(FlakyConnector {
            fail_times: std::sync::atomic::AtomicUsize::new(2),
            peer: Mutex::new(None),
        });
        let link = Arc::new(ReconnectingLink::new(FlakyConnectorHandle(connector.clone())));

        // Drive the connect loop forward; first two attempts fail, third
        // succeeds immediately (no real backoff needed since the test
        // connector fails synchronously and cheaply).
        let write_link = link.clone();
        let writer = tokio::spawn(async move {
            write_link.write_frame(7, b"hi").await;
        });

        // Wait until the underlying duplex exists, then read off the peer.
        let peer = loop {
            if let Some(p) = connector.peer.lock().await.take() {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        writer.await.unwrap();

        let mut peer = peer;
        let (id, payload) = frame::read_frame(&mut peer).await.unwrap();
        assert_eq!(id, 7);
        assert_eq!(&payload[..], b"hi");
    }

    struct FlakyConnectorHandle(Arc<FlakyConnector>);

    #[async_trait]
    impl LinkConnector for FlakyConnectorHandle {
        type Stream = DuplexStream;
        async fn connect(&self) -> Result<Self::Stream, LinkError> {
            self.0.connect().await
        }
    }
}
