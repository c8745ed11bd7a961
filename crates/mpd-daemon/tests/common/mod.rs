//! Shared helpers for daemon integration tests.
//!
//! Every daemon binds an ephemeral port on 127.0.0.1 and keeps its
//! configuration in memory, so tests can run side by side.

#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mpd_core::config::{ConfigStore, MpdConfig};
use mpd_daemon::protocol::{ConnectionType, LineFramed, connect};
use mpd_daemon::{DaemonOptions, RunningDaemon};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const PHRASE: &str = "integration";

/// Maximum time to wait for any single reply.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> ConfigStore {
    ConfigStore::in_memory(MpdConfig {
        host: Some("127.0.0.1".to_string()),
        port: 0,
        phrase: PHRASE.to_string(),
        ..MpdConfig::default()
    })
}

pub async fn start_node() -> RunningDaemon {
    mpd_daemon::start(DaemonOptions::new(config()))
        .await
        .expect("daemon should start")
}

/// Starts a node and inserts it next to `existing`.
pub async fn join_node(existing: &RunningDaemon) -> RunningDaemon {
    let options = DaemonOptions::new(config()).with_insert(existing.host());
    mpd_daemon::start(options)
        .await
        .expect("daemon should join the ring")
}

pub struct Console {
    framed: LineFramed<TcpStream>,
}

impl Console {
    pub async fn open(daemon: &RunningDaemon) -> Self {
        let addr = format!("127.0.0.1:{}", daemon.local_addr().port());
        let framed = connect(&addr, PHRASE, ConnectionType::Console)
            .await
            .expect("console should authenticate");
        Self { framed }
    }

    pub async fn send(&mut self, line: &str) {
        self.framed.send(line).await.expect("send should succeed");
    }

    pub async fn recv(&mut self) -> String {
        timeout(TEST_TIMEOUT, self.framed.next())
            .await
            .expect("reply should arrive in time")
            .expect("connection should stay open")
            .expect("reply should be a valid line")
    }

    /// Waits briefly and returns `None` if nothing arrives.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<String> {
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(line))) => Some(line),
            _ => None,
        }
    }

    pub async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await
    }
}

/// Polls `hosts` until the ring seen from `daemon` has `expected` members.
pub async fn wait_for_ring(daemon: &RunningDaemon, expected: usize) -> String {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        // A fresh console each round so a reply lost mid-relink cannot stall
        // the next one.
        let mut console = Console::open(daemon).await;
        console.send("hosts").await;
        let hosts = console
            .try_recv(Duration::from_secs(1))
            .await
            .unwrap_or_default();
        let members = hosts
            .strip_prefix("result=")
            .map_or(0, |list| list.split(',').count());
        if members == expected {
            return hosts;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ring never reached {expected} members, last saw {hosts}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
