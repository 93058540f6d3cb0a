//! Domain-specific error types for the tether protocol.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! No panics on invalid input — every error is typed and recoverable.

use thiserror::Error;

/// The canonical error type for the tether protocol.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// A frame violated the wire format.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The identification payload did not carry exactly four fields.
    #[error("malformed auth frame")]
    MalformedAuth,

    /// The byte stream ended in the middle of a frame.
    #[error("stream ended mid-frame")]
    UnexpectedEof,

    // ── Setup Errors ─────────────────────────────────────────────
    /// Invalid configuration value, reported synchronously at setup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The peer address failed the whitelist/blacklist check.
    #[error("connection refused by address policy")]
    PolicyDenied,

    /// TLS handshake or certificate failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The peer did not identify itself within the grace period.
    #[error("no auth frame received within the identification timeout")]
    IdentificationTimeout,

    /// A state transition or operation was attempted in a session
    /// state that does not permit it.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Send Errors ──────────────────────────────────────────────
    /// The bounded send queue is at its configured depth.
    #[error("send queue full")]
    Backpressure,

    /// A send was attempted on a session that cannot accept frames.
    #[error("session is not connected")]
    NotConnected,

    // ── Payload Errors ───────────────────────────────────────────
    /// An object payload could not be decoded. Benign: surfaced as an
    /// event with a null object, never closes the connection.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TetherError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TetherError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for TetherError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        TetherError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = TetherError::UnsupportedVersion(9);
        assert!(e.to_string().contains('9'));

        let e = TetherError::MalformedFrame("unknown message type");
        assert!(e.to_string().contains("unknown message type"));

        let e = TetherError::Config("buffer size below 256".into());
        assert!(e.to_string().contains("256"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: TetherError = io_err.into();
        assert!(matches!(e, TetherError::Io(_)));
    }

    #[test]
    fn from_channel_send() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(1);
        drop(rx);
        let send_err = match tx.try_send(1).unwrap_err() {
            tokio::sync::mpsc::error::TrySendError::Closed(v) => {
                tokio::sync::mpsc::error::SendError(v)
            }
            other => panic!("unexpected error: {other:?}"),
        };
        let e: TetherError = send_err.into();
        assert!(matches!(e, TetherError::ChannelClosed));
    }
}
