//! mpd-daemon - ring process-manager daemon library
//!
//! Each daemon holds an authenticated link to its left and right neighbors
//! and any number of console connections. Requests aimed at another node
//! travel rightward around the ring until they reach it or return home.
//!
//! Everything runs as tasks on the caller's tokio runtime; the `mpd` binary
//! builds one before anything else runs.
//!
//! # Modules
//!
//! - [`protocol`]: handshake, connection contexts and command dispatch
//! - [`ring`]: ring identity, neighbor links, insert and extract
//! - [`server`]: listener, start-up and shutdown sequence
//! - [`state`]: shared daemon state

mod handlers;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod state;

pub use server::{DaemonOptions, RunningDaemon, ServerError, Stopped, start};
pub use state::{DaemonState, SharedState};
