//! Error type shared by endpoints, the multiplexer and WebSocket sessions.

use std::io;

use tether_core::{FrameError, HandshakeError};
use thiserror::Error;

/// Errors surfaced by connection I/O and protocol handling.
///
/// Transport errors (`ConnectionBroken`, the time-outs, `Io`) end the
/// connection they occurred on; `ResourceTemporarilyUnavailable` is a retry
/// signal for zero-timeout polls; protocol errors are fatal for their
/// connection only.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer closed the connection, or the endpoint was closed locally.
    #[error("connection broken")]
    ConnectionBroken,

    #[error("read timed out")]
    ReadTimedOut,

    #[error("write timed out")]
    WriteTimedOut,

    /// A non-blocking attempt found nothing to do.
    #[error("resource temporarily unavailable")]
    ResourceTemporarilyUnavailable,

    /// An operation needed an endpoint but none was attached.
    #[error("no endpoint attached")]
    NullEndpoint,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The postponed session outlived its postpone timeout.
    #[error("session expired")]
    SessionExpired,

    #[error("session not found")]
    SessionNotFound,

    /// Every multiplexer thread is at capacity and no more may be started.
    #[error("too many sockets registered with the multiplexer")]
    TooManySockets,

    /// A message arrived in a shape the protocol forbids (bad fragment order,
    /// text that is not UTF-8).
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },

    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Whether the error means the connection is gone for good.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionBroken | Self::Io(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimedOut | Self::WriteTimedOut)
    }

    /// Maps an I/O error from a socket read to the endpoint taxonomy.
    pub(crate) fn from_read(err: io::Error, polling: bool) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut if polling => {
                Self::ResourceTemporarilyUnavailable
            }
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::ReadTimedOut,
            kind if is_disconnect(kind) => Self::ConnectionBroken,
            _ => Self::Io(err),
        }
    }

    /// Maps an I/O error from a socket write to the endpoint taxonomy.
    pub(crate) fn from_write(err: io::Error, polling: bool) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut if polling => {
                Self::ResourceTemporarilyUnavailable
            }
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::WriteTimedOut,
            kind if is_disconnect(kind) => Self::ConnectionBroken,
            _ => Self::Io(err),
        }
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_maps_to_timeout_or_retry() {
        let err = || io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(NetError::from_read(err(), false), NetError::ReadTimedOut));
        assert!(matches!(
            NetError::from_read(err(), true),
            NetError::ResourceTemporarilyUnavailable
        ));
        assert!(matches!(NetError::from_write(err(), false), NetError::WriteTimedOut));
    }

    #[test]
    fn test_reset_maps_to_connection_broken() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(NetError::from_read(err, false), NetError::ConnectionBroken));
    }

    #[test]
    fn test_other_errors_are_kept() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let mapped = NetError::from_write(err, false);
        assert!(matches!(mapped, NetError::Io(_)));
        assert!(mapped.is_connection_lost());
    }
}
