//! Error types for the multiplexing engine.

use thiserror::Error;

/// Errors surfaced by the Physical Link.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bluetooth transport unsupported on this platform")]
    UnsupportedPlatform,

    #[error("connect timed out")]
    Timeout,

    #[error("link closed")]
    Closed,
}

/// Errors from the Frame Codec.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("declared payload length {0} exceeds MAX_PAYLOAD ({max})", max = crate::frame::MAX_PAYLOAD)]
    PayloadTooLarge(u16),
}

/// Errors from Mux Manager operations.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("could not parse target address")]
    BadAddress,

    #[error("no free stream ids available")]
    IdsExhausted,

    #[error("failed to send control frame: {0}")]
    SendFailed(#[from] FrameError),

    #[error("link is shutting down")]
    Closed,
}
