//! Bluetooth listen side (Linux only): register an SPP profile over the
//! system message bus, per spec.md §6 "Bluetooth listen (server side,
//! Linux)". Grounded on `bluez-bluer/bluer-tools/src/rfcat.rs`'s
//! `ListenOpts`/`Profile`/`Role::Server` registration shape and the
//! teacher's `relay-node` RFCOMM listener for the accept-loop idiom.

use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, Role};
use bluer::Uuid;
use btlink_core::{LinkConnector, LinkError};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::info;

/// Serial Port Profile UUID (spec.md §6).
pub const SPP_UUID: Uuid = uuid_from_str("00001101-0000-1000-8000-00805f9b34fb");

const fn uuid_from_str(_s: &str) -> Uuid {
    // `Uuid::parse_str` is not const; the SPP UUID is fixed, so its
    // bytes are written out directly instead.
    Uuid::from_bytes([
        0x00, 0x00, 0x11, 0x01, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
    ])
}

/// Registers the SPP profile once at construction and hands out
/// accepted connections as they arrive. As a [`LinkConnector`], each
/// "reconnect" is simply waiting for the next inbound connection —
/// [`btlink_core::ReconnectingLink`]'s retry loop needs no server-side
/// special casing at all.
pub struct BtListenConnector {
    handle: Mutex<ProfileHandle>,
}

impl BtListenConnector {
    pub async fn register(channel: u16) -> bluer::Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let profile = Profile {
            uuid: SPP_UUID,
            name: Some("btlink".to_string()),
            role: Some(Role::Server),
            channel: Some(channel),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
        };
        let handle = session.register_profile(profile).await?;
        info!(channel, "registered SPP profile over D-Bus");
        Ok(Self { handle: Mutex::new(handle) })
    }
}

#[async_trait]
impl LinkConnector for BtListenConnector {
    type Stream = bluer::rfcomm::Stream;

    async fn connect(&self) -> Result<Self::Stream, LinkError> {
        let mut handle = self.handle.lock().await;
        let request = handle.next().await.ok_or(LinkError::Closed)?;
        info!(device = %request.device(), "inbound rfcomm connection accepted");
        request.accept().map_err(|e| LinkError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }
}
