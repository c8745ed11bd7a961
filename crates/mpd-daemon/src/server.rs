//! Listener and daemon lifecycle.
//!
//! [`start`] binds the ring port, closes the local ring into a self-loop,
//! starts accepting, and then joins an existing ring if asked to. Shutdown
//! stops accepting, terminates every child process, aborts forwarders and
//! flushes every connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mpd_core::config::ConfigStore;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::protocol::{
    ConnectionType, HandshakeResult, Role, accept_handshake, framed, spawn_connection,
};
use crate::ring::{self, RingError, RingIdentity};
use crate::state::{DaemonState, SharedState};

/// Grace period between SIGTERM and SIGKILL for children at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long queued replies get to flush at shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that stop the daemon from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot determine host name: {0}")]
    HostName(String),

    #[error("cannot join ring at {host}: {source}")]
    Insert {
        host: String,
        #[source]
        source: RingError,
    },

    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Start-up options not held in the configuration store.
#[derive(Debug)]
pub struct DaemonOptions {
    pub config: ConfigStore,
    /// Node to insert next to once listening.
    pub insert: Option<String>,
    pub shutdown_grace: Duration,
}

impl DaemonOptions {
    #[must_use]
    pub fn new(config: ConfigStore) -> Self {
        Self {
            config,
            insert: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    #[must_use]
    pub fn with_insert(mut self, host: impl Into<String>) -> Self {
        self.insert = Some(host.into());
        self
    }
}

/// How a daemon ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    Exit,
    /// A console asked for `restart`.
    Restart,
}

/// A daemon that is accepting connections.
#[derive(Debug)]
pub struct RunningDaemon {
    state: SharedState,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningDaemon {
    #[must_use]
    pub const fn state(&self) -> &SharedState {
        &self.state
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Name this node goes by on the ring.
    #[must_use]
    pub fn host(&self) -> &str {
        self.state.identity.host()
    }

    pub fn shutdown(&self) {
        self.state.request_shutdown();
    }

    /// Waits for the listener and the shutdown sequence to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener task panicked.
    pub async fn wait(self) -> Result<Stopped, ServerError> {
        self.task.await?;
        if self.state.is_restart_requested() {
            Ok(Stopped::Restart)
        } else {
            Ok(Stopped::Exit)
        }
    }
}

/// Binds, self-loops, starts accepting and joins the ring.
///
/// With `port = 0` an ephemeral port is bound and the node is named
/// `host:port`, so several daemons can share one machine.
///
/// # Errors
///
/// Returns an error if the port cannot be bound, the host name cannot be
/// determined, or an explicit insert fails.
pub async fn start(options: DaemonOptions) -> Result<RunningDaemon, ServerError> {
    let DaemonOptions {
        config,
        insert,
        shutdown_grace,
    } = options;
    let snapshot = config.snapshot();

    let listener = TcpListener::bind(("0.0.0.0", snapshot.port))
        .await
        .map_err(|source| ServerError::Bind {
            port: snapshot.port,
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
        port: snapshot.port,
        source,
    })?;

    let base = match snapshot.host {
        Some(host) => host,
        None => nix::unistd::gethostname()
            .map_err(|e| ServerError::HostName(e.to_string()))?
            .into_string()
            .map_err(|name| ServerError::HostName(format!("{name:?} is not UTF-8")))?,
    };
    let host = if snapshot.port == 0 {
        format!("{base}:{}", local_addr.port())
    } else {
        base.clone()
    };
    let ip = resolve_ip(&base, local_addr.port()).await;
    let identity = RingIdentity::new(host, ip, local_addr.port());
    info!(host = identity.host(), ?ip, %local_addr, "mpd listening");

    let state: SharedState = Arc::new(DaemonState::new(identity, config));
    ring::self_loop(&state).await;
    let task = tokio::spawn(serve(Arc::clone(&state), listener, shutdown_grace));
    let daemon = RunningDaemon {
        state,
        local_addr,
        task,
    };

    if let Some(host) = insert {
        if let Err(source) = ring::insert(&daemon.state, &host).await {
            daemon.shutdown();
            if let Err(e) = daemon.task.await {
                warn!(error = %e, "listener task failed during abort");
            }
            return Err(ServerError::Insert { host, source });
        }
    } else if let Some(right) = snapshot
        .right_host
        .filter(|right| !daemon.state.identity.matches(right))
    {
        match ring::insert(&daemon.state, &right).await {
            Ok(()) => info!(host = %right, "rejoined ring"),
            Err(e) => warn!(host = %right, error = %e, "cannot rejoin ring, running solo"),
        }
    }
    Ok(daemon)
}

async fn resolve_ip(host: &str, port: u16) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
        Err(e) => {
            warn!(host, error = %e, "cannot resolve own host name");
            None
        },
    }
}

async fn serve(state: SharedState, listener: TcpListener, shutdown_grace: Duration) {
    let shutdown = state.shutdown_token();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_inbound(Arc::clone(&state), stream, peer));
                },
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                },
            },
        }
    }
    drop(listener);
    info!("shutting down");
    ring::extract(&state, false).await;

    if !state.supervisor.shutdown_all(shutdown_grace).await {
        warn!("some processes did not exit");
    }
    let aborted = state.forwarders.abort_all();
    if aborted > 0 {
        info!(aborted, "forwarders aborted");
    }
    state.registry.close_all(FLUSH_TIMEOUT).await;
    info!("mpd stopped");
}

async fn handle_inbound(state: SharedState, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, error = %e, "set_nodelay failed");
    }
    let mut framed = framed(stream);
    let phrase = state.config.phrase();
    match accept_handshake(&mut framed, &phrase).await {
        Ok(HandshakeResult::Success(ConnectionType::Console)) => {
            spawn_connection(&state, framed, Role::Console, peer.to_string());
        },
        Ok(HandshakeResult::Success(ConnectionType::Left(host))) => {
            // Installed once the peer sends `new left`.
            spawn_connection(&state, framed, Role::Left, host);
        },
        Ok(HandshakeResult::Success(ConnectionType::Right(host))) => {
            let context = spawn_connection(&state, framed, Role::Right, host.as_str());
            state.ring.install_right(context);
            ring::record_neighbors(&state);
            info!(right = %host, "right neighbor connected");
        },
        Ok(HandshakeResult::Failed | HandshakeResult::ConnectionClosed) => {},
        Err(e) => warn!(%peer, error = %e, "handshake failed"),
    }
}
