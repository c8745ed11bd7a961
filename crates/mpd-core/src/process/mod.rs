//! Launching and supervising processes.
//!
//! A `launch` line is turned into a [`LaunchSpec`], started by
//! [`spawner::spawn`] and then watched by the [`ProcessSupervisor`] until it
//! exits. Results flow back through a [`LaunchReporter`], which the daemon
//! points either at its own launch tracker or at the ring.

use std::path::PathBuf;

use thiserror::Error;

use crate::wire::{Command, keys};

pub mod spawner;
mod supervisor;

pub use supervisor::{LaunchReporter, ProcessSupervisor};

/// Errors raised while preparing or starting a process.
///
/// The `Display` text is what consoles see through `geterror`.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The launch line had no `c=` command.
    #[error("no command specified")]
    MissingCommand,

    /// The node requires credentials and none were supplied.
    #[error("launch without credentials not permitted on this node")]
    CredentialsRequired,

    /// The account does not exist on this node.
    #[error("unknown account: {account}")]
    UnknownAccount {
        /// Requested account.
        account: String,
    },

    /// The account is not the one the daemon runs as.
    #[error("cannot run as {account}: launches run under the daemon's own account")]
    AccountRefused {
        /// Requested account.
        account: String,
    },

    /// The account could not be looked up.
    #[error("unable to look up {account}: {reason}")]
    Logon {
        /// Requested account.
        account: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// Failed to spawn the process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
}

/// Where a launched process's standard streams are connected.
///
/// Each target is a `host:port` endpoint. When `merged` is set, stdout and
/// stderr share one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioTargets {
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub merged: bool,
}

impl StdioTargets {
    /// Reads `0=`, `1=`, `2=`, `12=` and `012=` from a launch line.
    #[must_use]
    pub fn from_command(command: &Command) -> Self {
        let get = |key: &str| command.get(key).filter(|v| !v.is_empty()).map(String::from);
        if let Some(all) = get("012") {
            return Self {
                stdin: Some(all.clone()),
                stdout: Some(all.clone()),
                stderr: Some(all),
                merged: true,
            };
        }
        if let Some(out) = get("12") {
            return Self {
                stdin: get("0"),
                stdout: Some(out.clone()),
                stderr: Some(out),
                merged: true,
            };
        }
        Self {
            stdin: get("0"),
            stdout: get("1"),
            stderr: get("2"),
            merged: false,
        }
    }
}

/// Everything needed to start one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Command line, run through the shell.
    pub command: String,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub dir: Option<PathBuf>,
    /// Account to run as. Must be the daemon's own.
    pub account: Option<String>,
    pub stdio: StdioTargets,
    /// MPI rank, shown by `ps`.
    pub rank: Option<String>,
    /// Scheduling priority offset (nice increment).
    pub priority: Option<i32>,
}

impl LaunchSpec {
    /// A spec that runs `command` with no redirection.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Builds a spec from the keys of a `launch` line.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::MissingCommand`] without `c=`.
    pub fn from_command(command: &Command) -> Result<Self, ProcessError> {
        let program = command
            .get("c")
            .filter(|c| !c.trim().is_empty())
            .ok_or(ProcessError::MissingCommand)?;

        Ok(Self {
            command: program.to_string(),
            env: command.get("e").map(parse_env).unwrap_or_default(),
            dir: command.get("d").filter(|d| !d.is_empty()).map(PathBuf::from),
            account: command.get(keys::ACCOUNT).filter(|a| !a.is_empty()).map(String::from),
            stdio: StdioTargets::from_command(command),
            rank: command.get("r").map(String::from),
            priority: command.get_parsed("k"),
        })
    }
}

/// Splits `A=1 B=2` into pairs. Tokens without `=` are skipped.
fn parse_env(env: &str) -> Vec<(String, String)> {
    env.split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// One running process as `ps` reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub launch_id: u64,
    pub rank: String,
    pub command: String,
}

impl ProcessInfo {
    /// Formats the entry as `host:pid:rank:id:command`.
    #[must_use]
    pub fn ps_entry(&self, host: &str) -> String {
        format!(
            "{host}:{}:{}:{}:{}",
            self.pid, self.rank, self.launch_id, self.command
        )
    }
}
