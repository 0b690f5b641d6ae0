//! Domain-specific error types for the lux tunnel stack.
//!
//! All fallible operations return `Result<T, LuxError>`.
//! No panics on invalid input; every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the lux protocol stack.
#[derive(Debug, Error)]
pub enum LuxError {
    // ── Codec Errors ─────────────────────────────────────────────
    /// No fiducial quadruple was found in the captured image.
    #[error("no frame signal: fiducial markers not found")]
    NoSignal,

    /// A Reed-Solomon block had more errors than the code can correct.
    #[error("uncorrectable block at byte offset {0}")]
    Uncorrectable(usize),

    /// The decoded frame failed CRC-32 validation.
    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    /// The decoded frame header is not a format we understand.
    #[error("invalid frame header: {0}")]
    InvalidFrameHeader(&'static str),

    /// The payload exceeds what a single frame can carry.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Packet Errors ────────────────────────────────────────────
    /// A packet byte buffer was malformed.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    /// The type code did not map to any known packet.
    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// A JSON packet body failed to serialize or deserialize.
    #[error("packet body error: {0}")]
    Body(#[from] serde_json::Error),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A state machine was driven through an invalid transition.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The SOCKS5 handshake failed.
    #[error("socks5: {0}")]
    Socks(&'static str),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The capture or camera primitive failed.
    #[error("video device error: {0}")]
    Video(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for LuxError {
    fn from(s: String) -> Self {
        LuxError::Other(s)
    }
}

impl From<&str> for LuxError {
    fn from(s: &str) -> Self {
        LuxError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LuxError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LuxError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for LuxError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LuxError::Timeout(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = LuxError::NoSignal;
        assert!(e.to_string().contains("fiducial"));

        let e = LuxError::PayloadTooLarge {
            size: 9000,
            max: 7575,
        };
        assert!(e.to_string().contains("9000"));
        assert!(e.to_string().contains("7575"));
    }

    #[test]
    fn from_string() {
        let e: LuxError = "something broke".into();
        assert!(matches!(e, LuxError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: LuxError = io_err.into();
        assert!(matches!(e, LuxError::Io(_)));
    }
}
