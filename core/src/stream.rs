//! The Virtual Connection: a byte-stream view onto one multiplexed id.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::frame::MAX_PAYLOAD;
use crate::link::LinkConnector;
use crate::mux::MuxManager;

/// One multiplexed logical stream. Holds a non-owning back-reference to
/// the [`MuxManager`] that created it (SPEC_FULL.md §9: the manager owns
/// the table entry; this type just borrows the ids and the link).
pub struct VirtualConnection<C: LinkConnector> {
    id: u16,
    manager: Arc<MuxManager<C>>,
    inbound: Mutex<tokio::sync::mpsc::Receiver<Bytes>>,
    leftover: Mutex<Option<Bytes>>,
    closed: AtomicBool,
}

impl<C: LinkConnector> VirtualConnection<C> {
    pub(crate) fn new(
        id: u16,
        manager: Arc<MuxManager<C>>,
        inbound: tokio::sync::mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            id,
            manager,
            inbound: Mutex::new(inbound),
            leftover: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Write `buf` as a single frame. Per SPEC_FULL.md §4.4, one `write`
    /// call is one frame on the wire — callers that produce buffers
    /// larger than [`MAX_PAYLOAD`] must chunk before calling this (the
    /// ingress/egress bridges in `btlink-client`/`btlink-server` read at
    /// a chunk size at or below the limit).
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > MAX_PAYLOAD as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload exceeds MAX_PAYLOAD; caller must chunk",
            ));
        }
        let n = self.manager.link().write_frame(self.id, buf).await;
        self.manager.table().touch(self.id).await;
        Ok(n.saturating_sub(4))
    }

    /// Read up to `buf.len()` bytes. Buffers any leftover tail from a
    /// frame that didn't fit in a previous call's `buf`. Returns `Ok(0)`
    /// once the inbound queue has been closed (by `close`, by idle
    /// sweep, or by link teardown) — this is this type's EOF.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut leftover = self.leftover.lock().await;
        let chunk = if let Some(pending) = leftover.take() {
            pending
        } else {
            drop(leftover);
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(chunk) => chunk,
                None => return Ok(0),
            }
        };

        if chunk.len() <= buf.len() {
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        } else {
            buf.copy_from_slice(&chunk[..buf.len()]);
            let rest = chunk.slice(buf.len()..);
            *self.leftover.lock().await = Some(rest);
            Ok(buf.len())
        }
    }

    /// Tear down this stream's table entry. Idempotent: a second call is
    /// a no-op. Does not affect the Physical Link or other streams.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.table().remove(self.id).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ReconnectingLink;
    use crate::mux::{ControlHandler, MuxManager};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::io::DuplexStream;

    struct NullConnector;

    #[async_trait]
    impl LinkConnector for NullConnector {
        type Stream = DuplexStream;
        async fn connect(&self) -> Result<Self::Stream, crate::error::LinkError> {
            let (a, _b) = tokio::io::duplex(4096);
            Ok(a)
        }
    }

    struct NoopHandler;
    #[async_trait]
    impl ControlHandler<NullConnector> for NoopHandler {
        async fn on_open(&self, _manager: &Arc<MuxManager<NullConnector>>, _new_id: u16, _target: SocketAddr) {}
    }

    fn new_manager() -> Arc<MuxManager<NullConnector>> {
        MuxManager::new(ReconnectingLink::new(NullConnector))
    }

    #[tokio::test]
    async fn read_splits_across_short_buffers_then_eof() {
        let manager = new_manager();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let vc = VirtualConnection::new(1, manager, rx);

        tx.send(Bytes::from_static(b"hello")).await.unwrap();
        drop(tx); // close the queue once drained

        let mut small = [0u8; 3];
        let n = vc.read(&mut small).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&small[..3], b"hel");

        let mut rest = [0u8; 16];
        let n = vc.read(&mut rest).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&rest[..2], b"lo");

        let n = vc.read(&mut rest).await.unwrap();
        assert_eq!(n, 0, "closed queue reads as EOF");
    }

    #[tokio::test]
    async fn write_rejects_oversized_payload() {
        let manager = new_manager();
        let (_tx, rx) = tokio::sync::mpsc::channel(8);
        let vc = VirtualConnection::new(1, manager, rx);
        let big = vec![0u8; MAX_PAYLOAD as usize + 1];
        assert!(vc.write(&big).await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let manager = new_manager();
        manager.table().insert(1).await;
        let (_tx, rx) = tokio::sync::mpsc::channel(8);
        let vc = VirtualConnection::new(1, manager.clone(), rx);
        vc.close().await;
        assert!(vc.is_closed());
        vc.close().await; // must not panic
        assert!(!manager.table().contains(1).await);
    }
}
