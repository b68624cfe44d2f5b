//! The listener registry: bind address -> running listener task.
//!
//! spec.md §9 "Global listener registry" explicitly prefers explicit
//! ownership over a hidden process-wide map; this follows the shape of
//! the teacher's `SessionManager`
//! (`server/src/session/manager.rs`) — a `RwLock<HashMap<..>>` owned by
//! one long-lived struct — generalized from device-id-keyed sessions to
//! bind-address-keyed listener tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct ListenerEntry {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Tracks every listener a `ClientService` has started, keyed by its
/// bind address, so it can be stopped individually (spec.md §4.5 "Stop
/// semantics").
#[derive(Default)]
pub struct Registry {
    listeners: Arc<RwLock<HashMap<String, ListenerEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running listener under `bind_addr`. Replacing an
    /// existing entry for the same address stops the old one first.
    pub async fn register(&self, bind_addr: String, handle: JoinHandle<()>, shutdown: oneshot::Sender<()>) {
        let entry = ListenerEntry { handle, shutdown };
        let mut listeners = self.listeners.write().await;
        if let Some(old) = listeners.insert(bind_addr.clone(), entry) {
            let _ = old.shutdown.send(());
            old.handle.abort();
        }
        info!(bind = %bind_addr, "listener registered");
    }

    /// Stop the listener bound to `bind_addr`, if any. Closing the
    /// listener socket fails its pending `accept` and unwinds the task;
    /// already-accepted connections are left to finish on their own
    /// (spec.md §4.5).
    pub async fn stop(&self, bind_addr: &str) -> bool {
        let entry = self.listeners.write().await.remove(bind_addr);
        match entry {
            Some(entry) => {
                let _ = entry.shutdown.send(());
                info!(bind = %bind_addr, "listener stop requested");
                true
            }
            None => {
                warn!(bind = %bind_addr, "stop requested for unknown listener");
                false
            }
        }
    }

    /// Stop every registered listener (process shutdown).
    pub async fn stop_all(&self) {
        let mut listeners = self.listeners.write().await;
        for (bind_addr, entry) in listeners.drain() {
            let _ = entry.shutdown.send(());
            info!(bind = %bind_addr, "listener stopped");
        }
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_stop_removes_entry() {
        let registry = Registry::new();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _ = rx.await;
        });
        registry.register("127.0.0.1:9000".to_string(), handle, tx).await;
        assert_eq!(registry.len().await, 1);

        assert!(registry.stop("127.0.0.1:9000").await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn stop_unknown_address_returns_false() {
        let registry = Registry::new();
        assert!(!registry.stop("127.0.0.1:1").await);
    }
}
