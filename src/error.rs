//! Error types specific to the `btlink-client` binary.

use thiserror::Error;

/// Errors from the SOCKS5 listener's handshake (spec.md §7 "ProtocolError").
#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("unsupported version {0}, expected 5")]
    UnsupportedVersion(u8),

    #[error("unsupported command {0}, only CONNECT (1) is supported")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
