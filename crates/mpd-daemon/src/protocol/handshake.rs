//! Challenge/response handshake.
//!
//! Every connection, ring neighbor or console, authenticates the same way
//! before any command is read:
//!
//! ```text
//! Connector                                 Acceptor
//!   |                                          |
//!   |  <-- "<challenge>" ----------------------|
//!   |                                          |
//!   |  -- "<hex sha256(phrase||challenge)>" -->|
//!   |                                          |
//!   |  <-- "SUCCESS" | "FAIL" -----------------|
//!   |                                          |
//!   |  -- "console" | "left H" | "right H" --->|
//!   |                                          |
//! ```
//!
//! The connection-type line fixes the connection's role for the rest of its
//! life. These state machines hold no I/O; the async drivers live in
//! [`super::connection_handler`].

use std::fmt;

use mpd_core::auth;
use mpd_core::wire::{WireError, reply};

use super::error::{ProtocolError, ProtocolResult};

/// What a connection announced itself as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    /// A control client.
    Console,
    /// The sender becomes the receiver's left neighbor.
    Left(String),
    /// The sender becomes the receiver's right neighbor.
    Right(String),
}

impl ConnectionType {
    /// Parses a connection-type line.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidConnectionType`] for anything other than
    /// `console`, `left <host>` or `right <host>`.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let invalid = || WireError::InvalidConnectionType {
            line: line.to_string(),
        };
        let mut parts = line.split_whitespace();
        let kind = parts.next().ok_or_else(invalid)?.to_ascii_lowercase();
        let host = parts.next();
        if parts.next().is_some() {
            return Err(invalid());
        }
        match (kind.as_str(), host) {
            ("console", None) => Ok(Self::Console),
            ("left", Some(host)) => Ok(Self::Left(host.to_string())),
            ("right", Some(host)) => Ok(Self::Right(host.to_string())),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => f.write_str("console"),
            Self::Left(host) => write!(f, "left {host}"),
            Self::Right(host) => write!(f, "right {host}"),
        }
    }
}

/// Handshake progress, shared by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Connector: waiting for the challenge.
    AwaitingChallenge,
    /// Acceptor: challenge sent, waiting for the digest.
    AwaitingResponse,
    /// Connector: digest sent, waiting for `SUCCESS`/`FAIL`.
    AwaitingVerdict,
    /// Acceptor: authenticated, waiting for the connection-type line.
    AwaitingType,
    /// Handshake completed successfully.
    Completed,
    /// Handshake failed.
    Failed,
}

/// Accepting side of the handshake.
#[derive(Debug)]
pub struct ServerHandshake {
    phrase: String,
    challenge: String,
    state: HandshakeState,
    connection_type: Option<ConnectionType>,
}

impl ServerHandshake {
    /// Creates a handshake with a fresh random challenge.
    #[must_use]
    pub fn new(phrase: impl Into<String>) -> Self {
        Self::with_challenge(phrase, auth::generate_challenge())
    }

    /// Creates a handshake with a fixed challenge.
    #[must_use]
    pub fn with_challenge(phrase: impl Into<String>, challenge: impl Into<String>) -> Self {
        Self {
            phrase: phrase.into(),
            challenge: challenge.into(),
            state: HandshakeState::AwaitingResponse,
            connection_type: None,
        }
    }

    /// The challenge line to send first.
    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// Checks the peer's digest and returns the verdict line to send.
    ///
    /// A wrong digest yields `FAIL` and moves to [`HandshakeState::Failed`];
    /// the caller closes the connection after writing it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no response is expected in the current state.
    pub fn process_response(&mut self, response: &str) -> ProtocolResult<&'static str> {
        if self.state != HandshakeState::AwaitingResponse {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed("unexpected challenge response"));
        }
        if auth::verify(&self.phrase, &self.challenge, response) {
            self.state = HandshakeState::AwaitingType;
            Ok(reply::SUCCESS)
        } else {
            self.state = HandshakeState::Failed;
            Ok(reply::FAIL)
        }
    }

    /// Reads the connection-type line and completes the handshake.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the peer has not authenticated or the line is not a
    /// connection type.
    pub fn process_type(&mut self, line: &str) -> ProtocolResult<ConnectionType> {
        if self.state != HandshakeState::AwaitingType {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed(
                "connection type before authentication",
            ));
        }
        match ConnectionType::parse(line) {
            Ok(connection_type) => {
                self.state = HandshakeState::Completed;
                self.connection_type = Some(connection_type.clone());
                Ok(connection_type)
            },
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e.into())
            },
        }
    }

    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// The negotiated connection type, once completed.
    #[must_use]
    pub const fn connection_type(&self) -> Option<&ConnectionType> {
        self.connection_type.as_ref()
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.state, HandshakeState::Completed)
    }
}

/// Connecting side of the handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    phrase: String,
    connection_type: ConnectionType,
    state: HandshakeState,
}

impl ClientHandshake {
    #[must_use]
    pub fn new(phrase: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            phrase: phrase.into(),
            connection_type,
            state: HandshakeState::AwaitingChallenge,
        }
    }

    /// Computes the digest line for the received challenge.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a challenge was already answered.
    pub fn respond(&mut self, challenge: &str) -> ProtocolResult<String> {
        if self.state != HandshakeState::AwaitingChallenge {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed("unexpected challenge"));
        }
        self.state = HandshakeState::AwaitingVerdict;
        Ok(auth::digest(&self.phrase, challenge.trim()))
    }

    /// Processes the acceptor's verdict and returns the connection-type line
    /// to send.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::AuthenticationFailed`] on `FAIL`, or a
    /// handshake failure for any other line.
    pub fn process_verdict(&mut self, verdict: &str) -> ProtocolResult<String> {
        if self.state != HandshakeState::AwaitingVerdict {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed("unexpected verdict"));
        }
        match verdict.trim() {
            reply::SUCCESS => {
                self.state = HandshakeState::Completed;
                Ok(self.connection_type.to_string())
            },
            reply::FAIL => {
                self.state = HandshakeState::Failed;
                Err(ProtocolError::AuthenticationFailed)
            },
            other => {
                self.state = HandshakeState::Failed;
                Err(ProtocolError::handshake_failed(format!(
                    "unexpected verdict: {other}"
                )))
            },
        }
    }

    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.state, HandshakeState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_type_parse() {
        assert_eq!(ConnectionType::parse("console").unwrap(), ConnectionType::Console);
        assert_eq!(
            ConnectionType::parse("left nodeA").unwrap(),
            ConnectionType::Left("nodeA".into())
        );
        assert_eq!(
            ConnectionType::parse("RIGHT 10.0.0.2:9000").unwrap(),
            ConnectionType::Right("10.0.0.2:9000".into())
        );
        assert!(ConnectionType::parse("left").is_err());
        assert!(ConnectionType::parse("console extra").is_err());
        assert!(ConnectionType::parse("up nodeA").is_err());
        assert_eq!(ConnectionType::Left("a".into()).to_string(), "left a");
    }

    #[test]
    fn test_full_handshake() {
        let mut server = ServerHandshake::new("behappy");
        let mut client = ClientHandshake::new("behappy", ConnectionType::Right("n1".into()));

        let digest = client.respond(server.challenge()).unwrap();
        assert_eq!(server.process_response(&digest).unwrap(), "SUCCESS");
        let type_line = client.process_verdict("SUCCESS").unwrap();
        assert_eq!(type_line, "right n1");
        assert!(client.is_completed());

        let connection_type = server.process_type(&type_line).unwrap();
        assert_eq!(connection_type, ConnectionType::Right("n1".into()));
        assert!(server.is_completed());
        assert_eq!(server.connection_type(), Some(&connection_type));
    }

    #[test]
    fn test_wrong_phrase_fails() {
        let mut server = ServerHandshake::with_challenge("behappy", "42");
        let mut client = ClientHandshake::new("sad", ConnectionType::Console);

        let digest = client.respond("42").unwrap();
        assert_eq!(server.process_response(&digest).unwrap(), "FAIL");
        assert_eq!(server.state(), HandshakeState::Failed);
        assert!(matches!(
            client.process_verdict("FAIL"),
            Err(ProtocolError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_type_before_auth_rejected() {
        let mut server = ServerHandshake::new("behappy");
        assert!(server.process_type("console").is_err());
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_bad_type_line_fails() {
        let mut server = ServerHandshake::with_challenge("p", "1");
        let digest = auth::digest("p", "1");
        server.process_response(&digest).unwrap();
        assert!(matches!(
            server.process_type("sideways"),
            Err(ProtocolError::Wire(WireError::InvalidConnectionType { .. }))
        ));
    }
}
