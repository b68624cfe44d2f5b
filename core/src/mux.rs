//! The Mux Manager: ties the Physical Link, the Frame Codec and the
//! stream table together into one multiplexing engine shared by both
//! `btlink-client` and `btlink-server`.
//!
//! The two binaries differ only in what they do when a control frame
//! arrives: the client does not expect one and discards it; the server
//! dials the requested target and bridges it. That difference is
//! injected via [`ControlHandler`] rather than forked into two
//! managers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::MuxError;
use crate::frame::{self, control, CONTROL_STREAM_ID};
use crate::link::{LinkConnector, ReconnectingLink};
use crate::stream::VirtualConnection;
use crate::table::StreamTable;

/// How long the reader task waits for a slow consumer before dropping an
/// inbound payload (SPEC_FULL.md §4.3 / spec.md §5: "StreamBacklog").
const INBOUND_OFFER_DEADLINE: Duration = Duration::from_millis(200);

/// How often the idle sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long a stream may sit idle before the sweeper closes it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Reacts to an inbound control frame (a peer-initiated "open this
/// stream id for this target" request). The client side's handler is a
/// no-op; the server side's (in `btlink-server`) dials `target` and
/// bridges the resulting TCP connection to the new id.
#[async_trait]
pub trait ControlHandler<C: LinkConnector>: Send + Sync + 'static {
    async fn on_open(&self, manager: &Arc<MuxManager<C>>, new_id: u16, target: SocketAddr);
}

/// A control handler that silently discards every open request — the
/// client's role, since spec.md only has the server originate id
/// assignment at the client's request, never the reverse.
pub struct DiscardControlHandler;

#[async_trait]
impl<C: LinkConnector> ControlHandler<C> for DiscardControlHandler {
    async fn on_open(&self, _manager: &Arc<MuxManager<C>>, new_id: u16, target: SocketAddr) {
        warn!(id = new_id, %target, "unexpected control frame on client side, discarding");
    }
}

pub struct MuxManager<C: LinkConnector> {
    link: ReconnectingLink<C>,
    table: StreamTable,
    next_id: AtomicU16,
}

impl<C: LinkConnector> MuxManager<C> {
    pub fn new(link: ReconnectingLink<C>) -> Arc<Self> {
        Arc::new(Self {
            link,
            table: StreamTable::new(),
            next_id: AtomicU16::new(1), // 0 is the reserved control id
        })
    }

    pub(crate) fn link(&self) -> &ReconnectingLink<C> {
        &self.link
    }

    pub(crate) fn table(&self) -> &StreamTable {
        &self.table
    }

    /// Open a new outbound stream to `target`: allocate an id, register
    /// it locally, then tell the peer about it with a control frame.
    /// Returns `None` if every id is currently live (spec.md §5: "bail
    /// if all 65,535 slots are live").
    pub async fn open_stream(self: &Arc<Self>, target: SocketAddr) -> Result<Arc<VirtualConnection<C>>, MuxError> {
        let id = self.allocate_id().await.ok_or(MuxError::IdsExhausted)?;
        let vc = self.bind_stream(id).await;
        let payload = control::encode(id, target);
        self.link.write_frame(CONTROL_STREAM_ID, &payload).await;
        Ok(vc)
    }

    /// Register a table entry for `id` and wrap it in a
    /// [`VirtualConnection`]. Used both by `open_stream` (client side,
    /// id chosen locally) and by a server's [`ControlHandler`] (id
    /// chosen by the peer).
    pub async fn bind_stream(self: &Arc<Self>, id: u16) -> Arc<VirtualConnection<C>> {
        let rx = self.table.insert(id).await;
        Arc::new(VirtualConnection::new(id, self.clone(), rx))
    }

    async fn allocate_id(&self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            let candidate = if candidate == CONTROL_STREAM_ID {
                self.next_id.fetch_add(1, Ordering::Relaxed)
            } else {
                candidate
            };
            if !self.table.contains(candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    /// Spawn the reader task and the idle sweeper task. Both run for the
    /// lifetime of the manager; callers keep the returned handles to
    /// await or abort them at shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        control_handler: Arc<dyn ControlHandler<C>>,
    ) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let reader = {
            let manager = self.clone();
            tokio::spawn(async move { manager.run_reader(control_handler).await })
        };
        let sweeper = {
            let manager = self.clone();
            tokio::spawn(async move { manager.run_sweeper().await })
        };
        (reader, sweeper)
    }

    async fn run_reader(self: Arc<Self>, control_handler: Arc<dyn ControlHandler<C>>) {
        loop {
            let (id, payload) = self.link.read_frame().await;

            if id == CONTROL_STREAM_ID {
                match control::decode(&payload) {
                    Some((new_id, target)) => {
                        control_handler.on_open(&self, new_id, target).await;
                    }
                    None => {
                        warn!(len = payload.len(), "malformed control frame, discarding");
                    }
                }
                continue;
            }

            match self.table.offer(id, payload, INBOUND_OFFER_DEADLINE).await {
                Some(true) => {}
                Some(false) => warn!(stream = id, "inbound backlog exceeded 200ms, dropping payload"),
                None => { /* unknown id: peer referencing a closed/unknown stream, drop silently */ }
            }
        }
    }

    async fn run_sweeper(self: Arc<Self>) {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            let swept = self.table.sweep_idle(IDLE_TIMEOUT).await;
            for id in swept {
                info!(stream = id, "closed idle stream");
            }
        }
    }

    /// Tear down the Physical Link. Existing `VirtualConnection`s are
    /// left to discover this independently (reads will simply never
    /// progress further; callers are expected to close explicitly).
    pub async fn close_link(&self) {
        self.link.close().await;
    }
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    struct PairConnector {
        peer: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl LinkConnector for Arc<PairConnector> {
        type Stream = DuplexStream;
        async fn connect(&self) -> Result<Self::Stream, crate::error::LinkError> {
            let (a, b) = tokio::io::duplex(8192);
            *self.peer.lock().await = Some(b);
            Ok(a)
        }
    }

    struct RecordingHandler {
        seen: StdMutex<Vec<(u16, SocketAddr)>>,
    }

    #[async_trait]
    impl ControlHandler<Arc<PairConnector>> for RecordingHandler {
        async fn on_open(&self, manager: &Arc<MuxManager<Arc<PairConnector>>>, new_id: u16, target: SocketAddr) {
            self.seen.lock().unwrap().push((new_id, target));
            manager.bind_stream(new_id).await;
        }
    }

    #[tokio::test]
    async fn open_stream_allocates_skips_zero_and_sends_control_frame() {
        let connector = Arc::new(PairConnector { peer: Mutex::new(None) });
        let manager = MuxManager::new(ReconnectingLink::new(connector));

        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let vc = manager.open_stream(target).await.unwrap();
        assert_ne!(vc.id(), CONTROL_STREAM_ID);
    }

    #[tokio::test]
    async fn reader_dispatches_control_frame_to_handler() {
        let connector = Arc::new(PairConnector { peer: Mutex::new(None) });
        let manager = MuxManager::new(ReconnectingLink::new(connector.clone()));
        let handler = Arc::new(RecordingHandler { seen: StdMutex::new(Vec::new()) });

        // Force the initial connect so the peer duplex half exists.
        manager.link().write_frame(CONTROL_STREAM_ID, b"").await;
        let mut peer = loop {
            if let Some(p) = connector.peer.lock().await.take() {
                break p;
            }
        };

        let (_reader, _sweeper) = manager.spawn(handler.clone());

        let target: SocketAddr = "10.0.0.5:443".parse().unwrap();
        let payload = control::encode(5, target);
        frame::write_frame(&mut peer, CONTROL_STREAM_ID, &payload).await.unwrap();

        // Give the reader task a moment to dispatch.
        for _ in 0..200 {
            if !handler.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(5, target)]);
        assert!(manager.table().contains(5).await);
    }

    #[tokio::test]
    async fn reader_drops_payload_for_unknown_id_without_panicking() {
        let connector = Arc::new(PairConnector { peer: Mutex::new(None) });
        let manager = MuxManager::new(ReconnectingLink::new(connector.clone()));
        let handler = Arc::new(DiscardControlHandler);

        manager.link().write_frame(CONTROL_STREAM_ID, b"").await;
        let mut peer = loop {
            if let Some(p) = connector.peer.lock().await.take() {
                break p;
            }
        };

        let (_reader, _sweeper) = manager.spawn(handler);
        frame::write_frame(&mut peer, 999, b"orphaned").await.unwrap();
        tokio::task::yield_now().await;
        assert!(!manager.table().contains(999).await);
    }
}
