//! Connection contexts and the registry that owns them.
//!
//! Every authenticated socket becomes a [`Context`] with a fixed [`Role`].
//! A context runs two tasks:
//!
//! - a reader that dispatches one line at a time, so lines from one peer are
//!   handled in arrival order;
//! - a writer that drains an unbounded queue, so a second outbound line is
//!   queued behind the first and never interleaved with it.
//!
//! Closing a context stops the reader and lets the writer flush whatever is
//! already queued before it shuts the socket.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mpd_core::sink::ReplySink;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::connection_handler::LineFramed;
use super::dispatch::dispatch;
use super::error::{ProtocolError, ProtocolResult};
use crate::state::SharedState;

/// Identifies one connection within this daemon. Carried on the ring as
/// `sock=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Role fixed by the connection-type line of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A control client.
    Console,
    /// Link to the left neighbor: ring traffic arrives here.
    Left,
    /// Link to the right neighbor: ring traffic leaves here.
    Right,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Console => "console",
            Self::Left => "left",
            Self::Right => "right",
        })
    }
}

/// One authenticated connection.
#[derive(Debug)]
pub struct Context {
    id: ConnId,
    role: Role,
    peer: String,
    outbound: mpsc::UnboundedSender<String>,
    closing: CancellationToken,
}

impl Context {
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Host name the peer announced (ring links) or its socket address
    /// (consoles).
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queues one line. Returns `false` if the connection is closing.
    pub fn send(&self, line: impl Into<String>) -> bool {
        !self.closing.is_cancelled() && self.outbound.send(line.into()).is_ok()
    }

    /// Queues a reply to this connection's own request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] if the connection is
    /// closing.
    pub fn reply(&self, line: impl Into<String>) -> ProtocolResult<()> {
        if self.send(line) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Handle for answering this connection later.
    #[must_use]
    pub fn sink(&self) -> ReplySink {
        ReplySink::new(self.id.as_u64(), self.outbound.clone())
    }

    /// Stops reading and closes the socket once queued lines are written.
    pub fn close(&self) {
        self.closing.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }
}

/// All live connections, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    contexts: Mutex<HashMap<ConnId, Arc<Context>>>,
    next_id: AtomicU64,
    writers: TaskTracker,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, role: Role, peer: String) -> (Arc<Context>, mpsc::UnboundedReceiver<String>) {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (outbound, rx) = mpsc::unbounded_channel();
        let context = Arc::new(Context {
            id,
            role,
            peer,
            outbound,
            closing: CancellationToken::new(),
        });
        self.contexts
            .lock()
            .expect("lock poisoned")
            .insert(id, Arc::clone(&context));
        (context, rx)
    }

    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<Arc<Context>> {
        self.contexts.lock().expect("lock poisoned").get(&id).cloned()
    }

    /// Looks up a connection by the textual `sock=` value.
    #[must_use]
    pub fn lookup(&self, sock: &str) -> Option<Arc<Context>> {
        sock.parse().ok().and_then(|id| self.get(id))
    }

    pub fn remove(&self, id: ConnId) -> Option<Arc<Context>> {
        self.contexts.lock().expect("lock poisoned").remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.lock().expect("lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every connection and waits up to `limit` for their writers to
    /// flush.
    pub async fn close_all(&self, limit: std::time::Duration) {
        let contexts: Vec<Arc<Context>> = self
            .contexts
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        for context in &contexts {
            context.close();
        }
        self.writers.close();
        if tokio::time::timeout(limit, self.writers.wait()).await.is_err() {
            warn!("connection writers did not finish flushing");
        }
    }
}

/// Registers a context for an authenticated stream and starts its reader and
/// writer tasks.
pub fn spawn_connection<S>(
    state: &SharedState,
    framed: LineFramed<S>,
    role: Role,
    peer: impl Into<String>,
) -> Arc<Context>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (context, rx) = state.registry.register(role, peer.into());
    debug!(conn = %context.id(), %role, peer = context.peer(), "connection registered");

    let (sink, stream) = framed.split();
    state
        .registry
        .writers
        .spawn(write_loop(Arc::clone(&context), sink, rx));
    tokio::spawn(read_loop(Arc::clone(state), Arc::clone(&context), stream));
    context
}

async fn read_loop<S>(state: SharedState, context: Arc<Context>, mut stream: SplitStream<LineFramed<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            () = context.closed() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = dispatch(&state, &context, &line).await {
                    if e.is_recoverable() {
                        warn!(conn = %context.id(), error = %e, "ignoring line");
                    } else {
                        debug!(conn = %context.id(), error = %e, "ending connection");
                        break;
                    }
                }
            },
            Some(Err(e)) => {
                warn!(conn = %context.id(), role = %context.role(), error = %ProtocolError::from(e), "read failed");
                break;
            },
            None => {
                debug!(conn = %context.id(), role = %context.role(), "peer closed connection");
                break;
            },
        }
    }
    context.close();
    state.connection_closed(&context);
}

async fn write_loop<S>(
    context: Arc<Context>,
    mut sink: SplitSink<LineFramed<S>, String>,
    mut rx: mpsc::UnboundedReceiver<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            line = rx.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = sink.send(line).await {
                    warn!(conn = %context.id(), error = %ProtocolError::from(e), "write failed");
                    break;
                }
            },
            () = context.closed() => {
                while let Ok(line) = rx.try_recv() {
                    if sink.send(line).await.is_err() {
                        break;
                    }
                }
                break;
            },
        }
    }
    context.close();
    if let Err(e) = sink.close().await {
        debug!(conn = %context.id(), error = %ProtocolError::from(e), "closing socket");
    }
}
