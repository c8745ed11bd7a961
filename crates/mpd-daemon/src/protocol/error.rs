//! Protocol error types for ring and console connections.
//!
//! [`ProtocolError`] covers everything that can go wrong between accepting a
//! socket and dispatching its lines: line framing, the challenge/response
//! handshake, and the connection itself going away.

use std::io;
use std::time::Duration;

use mpd_core::wire::WireError;
use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// How long either side of a handshake waits for the next line.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line exceeded the maximum line length.
    #[error("line exceeds maximum length")]
    LineTooLong,

    /// A line could not be parsed.
    #[error("malformed line: {0}")]
    Wire(#[from] WireError),

    /// The handshake did not complete.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The peer answered the challenge with the wrong digest.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Waiting for the peer timed out.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// How long we waited.
        timeout: Duration,
    },

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Creates a handshake failure.
    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub const fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Returns `true` if the connection can keep being used after this error.
    ///
    /// Only a malformed line is recoverable; everything else means the
    /// stream is desynchronized or gone.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Wire(_))
    }
}

impl From<LinesCodecError> for ProtocolError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong,
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_map_to_variants() {
        assert!(matches!(
            ProtocolError::from(LinesCodecError::MaxLineLengthExceeded),
            ProtocolError::LineTooLong
        ));
        let io = LinesCodecError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(ProtocolError::from(io), ProtocolError::Io(_)));
    }

    #[test]
    fn only_wire_errors_are_recoverable() {
        assert!(ProtocolError::Wire(WireError::Empty).is_recoverable());
        assert!(!ProtocolError::ConnectionClosed.is_recoverable());
        assert!(!ProtocolError::AuthenticationFailed.is_recoverable());
    }

    #[test]
    fn error_display() {
        let err = ProtocolError::handshake_failed("bad type line");
        assert_eq!(err.to_string(), "handshake failed: bad type line");
    }
}
