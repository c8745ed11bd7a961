//! Console connection to a running daemon.
//!
//! A console sends one request line at a time and reads back however many
//! reply lines that verb produces. Verbs that are fire-and-forget produce
//! none; `next N` produces one line per host.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mpd_core::wire::{Command, WireError, quote};
use mpd_daemon::protocol::{ConnectionType, LineFramed, ProtocolError, connect};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Default time to wait for each reply line.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error type for console operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach mpd at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: ProtocolError,
    },

    #[error("malformed request: {0}")]
    Request(#[from] WireError),

    #[error("connection to mpd lost: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("mpd closed the connection")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Number of reply lines `command` produces.
#[must_use]
pub fn expected_replies(command: &Command) -> usize {
    match command.verb() {
        "kill" | "killall" | "exitall" | "shutdown" | "done" | "killforwarders" => 0,
        "next" => command
            .arg_or(0, "count")
            .and_then(|n| n.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1),
        _ => 1,
    }
}

/// Joins shell words into one request line, re-quoting values the shell
/// already unquoted.
#[must_use]
pub fn join_words(words: &[String]) -> String {
    words
        .iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() && !key.contains(' ') => {
                format!("{key}={}", quote(value))
            },
            _ => quote(word),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// An authenticated console connection.
pub struct ConsoleClient {
    framed: LineFramed<TcpStream>,
    timeout: Duration,
}

impl ConsoleClient {
    /// Connects to `host:port` and authenticates as a console.
    pub async fn connect(
        host: &str,
        port: u16,
        phrase: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let framed = connect(&addr, phrase, ConnectionType::Console)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        debug!(%addr, "console connected");
        Ok(Self { framed, timeout })
    }

    /// Sends `line` and collects its replies.
    pub async fn request(&mut self, line: &str) -> Result<Vec<String>, ClientError> {
        let command = Command::parse(line)?;
        self.framed
            .send(command.to_line())
            .await
            .map_err(ProtocolError::from)?;

        let mut replies = Vec::new();
        for _ in 0..expected_replies(&command) {
            replies.push(self.recv().await?);
        }
        Ok(replies)
    }

    async fn recv(&mut self) -> Result<String, ClientError> {
        match tokio::time::timeout(self.timeout, self.framed.next()).await {
            Ok(Some(Ok(line))) => Ok(line),
            Ok(Some(Err(e))) => Err(ProtocolError::from(e).into()),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }

    /// Says goodbye so the daemon closes its side cleanly. The daemon may
    /// already be gone after `shutdown` or `exitall`.
    pub async fn close(mut self) {
        if let Err(e) = self.framed.send("done").await {
            debug!(error = %e, "connection already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replies(line: &str) -> usize {
        expected_replies(&Command::parse(line).unwrap())
    }

    #[test]
    fn test_expected_replies() {
        assert_eq!(replies("kill 3"), 0);
        assert_eq!(replies("exitall"), 0);
        assert_eq!(replies("next 4"), 4);
        assert_eq!(replies("next count=2"), 2);
        assert_eq!(replies("next bogus"), 1);
        assert_eq!(replies("hosts"), 1);
        assert_eq!(replies("launch c=/bin/true"), 1);
    }

    #[test]
    fn test_join_words_requotes_values() {
        let words = ["launch", "c=/bin/echo hi", "h=n2"].map(String::from);
        assert_eq!(join_words(&words), "launch c='/bin/echo hi' h=n2");
    }

    #[test]
    fn test_join_words_plain() {
        let words = ["getexitcodewait", "7"].map(String::from);
        assert_eq!(join_words(&words), "getexitcodewait 7");
    }
}
