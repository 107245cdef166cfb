//! Connection-local error types.
//!
//! Every variant is terminal for the connection it occurred on and is never
//! reported to a peer. Nothing here propagates across connections.

use std::io;
use std::net::{IpAddr, SocketAddr};

/// Why a handshake did not produce a username.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeFailure {
    #[error("timed out waiting for username")]
    Timeout,
    #[error("read error: {0}")]
    Io(#[source] io::Error),
    #[error("username is empty")]
    EmptyUsername,
}

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Source address is at its connection ceiling
    #[error("address {address} already has {active} active connections")]
    AdmissionRejected { address: IpAddr, active: usize },

    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeFailure),

    /// I/O error or peer close while reading a marker, size or payload
    #[error("frame read failed: {0}")]
    FrameReadFailed(#[from] io::Error),

    #[error("invalid frame size {size} (max {max})")]
    InvalidFrameSize { size: u32, max: u32 },

    /// No marker found within the resync budget
    #[error("no frame marker found after skipping {scanned} bytes")]
    ResyncLimitExceeded { scanned: usize },

    #[error("connection idle for longer than the read timeout")]
    IdleTimeout,

    #[error("forward to {address} failed: {reason}")]
    ForwardWriteFailed { address: SocketAddr, reason: String },
}

impl RelayError {
    /// Whether the peer went away cleanly rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RelayError::FrameReadFailed(e) if e.kind() == io::ErrorKind::UnexpectedEof
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RelayError::InvalidFrameSize { size: 0, max: 101_000 };
        assert_eq!(err.to_string(), "invalid frame size 0 (max 101000)");

        let err = RelayError::from(HandshakeFailure::EmptyUsername);
        assert_eq!(err.to_string(), "handshake failed: username is empty");
    }

    #[test]
    fn test_is_disconnect() {
        let eof = RelayError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(eof.is_disconnect());

        let reset = RelayError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.is_disconnect());
        assert!(!RelayError::IdleTimeout.is_disconnect());
    }
}
