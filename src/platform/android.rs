//! Android is out of scope (SPEC_FULL.md Non-goals): the real
//! implementation there runs over a TUN interface and a userspace
//! network stack (gVisor), a fundamentally different integration than
//! a direct RFCOMM socket. This stub exists so the crate still builds
//! on other unix-like targets picked up by the fallback `cfg`, and
//! fails loudly rather than silently if ever reached.

use async_trait::async_trait;
use btlink_core::{LinkConnector, LinkError};
use tokio::io::DuplexStream;

pub struct AndroidRfcommConnector;

impl AndroidRfcommConnector {
    pub fn new(_mac: [u8; 6]) -> Self {
        Self
    }
}

#[async_trait]
impl LinkConnector for AndroidRfcommConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<Self::Stream, LinkError> {
        Err(LinkError::UnsupportedPlatform)
    }
}
