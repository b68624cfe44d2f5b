//! `btlink-core`: the multiplexing engine shared by `btlink-client` and
//! `btlink-server` — framing, the auto-reconnecting Physical Link, the
//! stream table, and the Mux Manager that ties them together.
//!
//! Platform-specific Bluetooth socket acquisition is deliberately kept
//! outside this crate: consumers provide a [`link::LinkConnector`] and
//! everything above it (framing, multiplexing, idle sweeping) is
//! platform-agnostic.

pub mod error;
pub mod frame;
pub mod link;
pub mod mux;
pub mod stream;
pub mod table;

pub use error::{FrameError, LinkError, MuxError};
pub use link::{LinkConnector, ReconnectingLink};
pub use mux::{ControlHandler, DiscardControlHandler, MuxManager};
pub use stream::VirtualConnection;
