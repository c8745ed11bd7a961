//! mpd-core - building blocks for the mpd process-manager ring.
//!
//! Everything here is independent of the network layer that strings the
//! daemons together. The daemon crate wires these pieces to live
//! connections:
//!
//! - [`wire`]: the `verb key=value` line grammar
//! - [`sink`]: reply handles that outlive the request that created them
//! - [`auth`]: challenge/response authentication state machines
//! - [`config`]: the persisted key/value configuration store
//! - [`launch`]: launch records and deferred replies
//! - [`barrier`]: named counting barriers
//! - [`db`]: named string-to-string collections with cursors
//! - [`process`]: spawning and supervising launched processes
//! - [`forwarder`]: many-to-one stdout/stderr relays

pub mod auth;
pub mod barrier;
pub mod config;
pub mod db;
pub mod forwarder;
pub mod launch;
pub mod process;
pub mod sink;
pub mod wire;

/// Protocol version string reported by `mpich version`.
pub const MPICH_VERSION: &str = "1.2.5";

/// Daemon version string reported by `version`.
pub const MPD_VERSION: &str = concat!("mpd ", env!("CARGO_PKG_VERSION"));
