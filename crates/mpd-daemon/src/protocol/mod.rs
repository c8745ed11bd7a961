//! Ring and console connections.
//!
//! # Modules
//!
//! - [`handshake`]: challenge/response state machines and connection types
//! - [`connection_handler`]: async handshake drivers over line-framed streams
//! - [`connection`]: connection contexts, their reader/writer tasks and the
//!   registry that owns them
//! - [`dispatch`]: per-line command routing
//! - [`error`]: protocol error types

pub mod connection;
pub mod connection_handler;
pub mod dispatch;
pub mod error;
pub mod handshake;

pub use connection::{ConnId, ConnectionRegistry, Context, Role, spawn_connection};
pub use connection_handler::{
    HandshakeResult, LineFramed, accept_handshake, connect, connect_handshake, expect_line, framed,
};
pub use error::{HANDSHAKE_TIMEOUT, ProtocolError, ProtocolResult};
pub use handshake::{ClientHandshake, ConnectionType, HandshakeState, ServerHandshake};
