//! Ring membership.
//!
//! Each daemon knows two neighbors. Lines flow rightward: a daemon reads ring
//! traffic from its left link and writes it to its right link. A solo daemon
//! points both links at an in-process loopback pair, so forwarding always has
//! somewhere to go.
//!
//! Re-linking uses three messages:
//!
//! - `new left` is sent by an inserting node on its fresh connection; the
//!   receiver answers with its previous left neighbor and adopts the sender
//!   as its new left.
//! - `connect left <host>` tells a node to dial `host` and become its right
//!   neighbor, closing the ring around a gap or a splice.
//! - `done bounce` tells a node to drop its right link without forwarding
//!   anything further.
//!
//! Pointer swaps happen under [`RingManager`]'s own lock. Insert, extract and
//! `connect left` additionally hold an async re-link lock so that two ring
//! changes on the same node never interleave.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use futures::SinkExt;
use thiserror::Error;
use tokio::io::duplex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info, warn};

use crate::protocol::{
    ConnId, Context, ConnectionType, ProtocolError, Role, connect, expect_line, framed,
    spawn_connection,
};
use crate::state::SharedState;

/// Sent by an inserting node on its new connection.
pub const NEW_LEFT: &str = "new left";

/// Soft close of a right link.
pub const DONE_BOUNCE: &str = "done bounce";

/// Buffer size of each direction of the loopback pair.
const LOOPBACK_BUFFER: usize = 64 * 1024;

/// Most lines held while waiting for a replacement right link.
pub const MAX_PENDING: usize = 1024;

/// Ring membership errors.
#[derive(Debug, Error)]
pub enum RingError {
    /// Connecting to or talking with a neighbor failed.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// A node cannot be inserted next to itself.
    #[error("cannot insert into self ({host})")]
    SelfInsert {
        /// The rejected host.
        host: String,
    },

    /// The neighbor answered `new left` with something unusable.
    #[error("unexpected reply to new left: {line:?}")]
    UnexpectedReply {
        /// The reply received.
        line: String,
    },
}

/// How this node is named on the ring.
#[derive(Debug, Clone)]
pub struct RingIdentity {
    host: String,
    ip: Option<IpAddr>,
    port: u16,
}

impl RingIdentity {
    #[must_use]
    pub fn new(host: impl Into<String>, ip: Option<IpAddr>, port: u16) -> Self {
        Self {
            host: host.into(),
            ip,
            port,
        }
    }

    /// The name carried as `src=` and reported by `hosts`.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` if `name` refers to this node.
    ///
    /// Host names compare case-insensitively; an IP literal matches the
    /// resolved local address. A name with an explicit port only matches if
    /// the port is ours too.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let (bare, port) = split_host_port(name.trim());
        if bare.is_empty() || port.is_some_and(|port| port != self.port) {
            return false;
        }
        let (own, _) = split_host_port(&self.host);
        bare.eq_ignore_ascii_case(own)
            || self
                .ip
                .is_some_and(|ip| bare.parse::<IpAddr>().is_ok_and(|other| other == ip))
    }

    /// Socket address string for dialing `name`, defaulting to our port.
    #[must_use]
    pub fn dial_addr(&self, name: &str) -> String {
        let name = name.trim();
        match split_host_port(name) {
            (_, Some(_)) => name.to_string(),
            (bare, None) if bare.parse::<std::net::Ipv6Addr>().is_ok() => {
                format!("[{bare}]:{}", self.port)
            },
            (bare, None) => format!("{bare}:{}", self.port),
        }
    }
}

/// The port `name` carries, if any.
#[must_use]
pub fn explicit_port(name: &str) -> Option<u16> {
    split_host_port(name.trim()).1
}

/// Splits `host:port`, `[v6]:port`, or a bare host or IPv6 literal.
fn split_host_port(name: &str) -> (&str, Option<u16>) {
    if let Some(rest) = name.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':').and_then(|p| p.parse().ok()));
        }
    }
    match name.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (name, None),
        },
        _ => (name, None),
    }
}

#[derive(Debug, Default)]
struct RingLinks {
    left: Option<Arc<Context>>,
    right: Option<Arc<Context>>,
    loopback: Option<(ConnId, ConnId)>,
    pending: VecDeque<String>,
    /// Set when the right link was bounced and a neighbor is about to dial
    /// in; only then are lines held.
    awaiting_right: bool,
}

/// The two neighbor links and the queue of lines waiting for a right link.
#[derive(Debug, Default)]
pub struct RingManager {
    links: Mutex<RingLinks>,
    relink: AsyncMutex<()>,
}

impl RingManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `line` to the right neighbor.
    ///
    /// Without a usable right link the line is held only while a bounced
    /// link is being replaced, up to [`MAX_PENDING`] lines. Otherwise it is
    /// dropped.
    pub fn forward(&self, line: impl Into<String>) {
        let line = line.into();
        let mut links = self.links.lock().expect("lock poisoned");
        if let Some(right) = &links.right {
            if right.send(line.clone()) {
                return;
            }
            debug!(conn = %right.id(), "right link closing");
        }
        if links.awaiting_right && links.pending.len() < MAX_PENDING {
            links.pending.push_back(line);
        } else {
            warn!(pending = links.pending.len(), "no right neighbor, dropping ring line");
        }
    }

    /// Makes `context` the right link, flushing queued lines to it. The
    /// previous right link is closed after its queued lines are written.
    pub fn install_right(&self, context: Arc<Context>) {
        let previous = {
            let mut links = self.links.lock().expect("lock poisoned");
            while let Some(line) = links.pending.pop_front() {
                if !context.send(line.clone()) {
                    links.pending.push_front(line);
                    break;
                }
            }
            links.loopback = None;
            links.awaiting_right = false;
            links.right.replace(context)
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Makes `context` the left link. The previous left link stays open; its
    /// writer on the other side closes it.
    pub fn install_left(&self, context: Arc<Context>) {
        let mut links = self.links.lock().expect("lock poisoned");
        links.loopback = None;
        links.left = Some(context);
    }

    fn install_loopback(&self, left: Arc<Context>, right: Arc<Context>) {
        let ids = (left.id(), right.id());
        self.install_left(left);
        self.install_right(right);
        self.links.lock().expect("lock poisoned").loopback = Some(ids);
    }

    /// Drops the right link if it is `id` and holds ring lines until its
    /// replacement arrives.
    pub fn detach_right_if(&self, id: ConnId) -> bool {
        let mut links = self.links.lock().expect("lock poisoned");
        if links.right.as_ref().is_some_and(|right| right.id() == id) {
            links.right = None;
            links.awaiting_right = true;
            true
        } else {
            false
        }
    }

    /// Forgets `id` if it is one of the links. Returns `true` if both links
    /// are now gone.
    ///
    /// A right link that closes without a bounce is a lost neighbor: held
    /// lines are discarded and later ones dropped.
    pub fn on_closed(&self, id: ConnId) -> bool {
        let mut links = self.links.lock().expect("lock poisoned");
        let mut changed = false;
        if links.left.as_ref().is_some_and(|left| left.id() == id) {
            links.left = None;
            changed = true;
        }
        if links.right.as_ref().is_some_and(|right| right.id() == id) {
            links.right = None;
            links.awaiting_right = false;
            let dropped = links.pending.len();
            links.pending.clear();
            warn!(conn = %id, dropped, "right neighbor lost");
            changed = true;
        }
        if changed {
            links.loopback = None;
        }
        changed && links.left.is_none() && links.right.is_none()
    }

    /// Returns `true` while both links are the loopback pair.
    #[must_use]
    pub fn is_alone(&self) -> bool {
        let links = self.links.lock().expect("lock poisoned");
        match (&links.left, &links.right, links.loopback) {
            (Some(left), Some(right), Some((l, r))) => left.id() == l && right.id() == r,
            _ => false,
        }
    }

    /// Returns `true` while neither link is installed.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        let links = self.links.lock().expect("lock poisoned");
        links.left.is_none() && links.right.is_none()
    }

    #[must_use]
    pub fn left_peer(&self) -> Option<String> {
        let links = self.links.lock().expect("lock poisoned");
        links.left.as_ref().map(|left| left.peer().to_string())
    }

    #[must_use]
    pub fn right_id(&self) -> Option<ConnId> {
        let links = self.links.lock().expect("lock poisoned");
        links.right.as_ref().map(|right| right.id())
    }

    #[must_use]
    pub fn right_peer(&self) -> Option<String> {
        let links = self.links.lock().expect("lock poisoned");
        links.right.as_ref().map(|right| right.peer().to_string())
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.links.lock().expect("lock poisoned").pending.len()
    }

    fn take_links(&self) -> (Option<Arc<Context>>, Option<Arc<Context>>) {
        let mut links = self.links.lock().expect("lock poisoned");
        links.loopback = None;
        (links.left.take(), links.right.take())
    }

    async fn lock_relink(&self) -> AsyncMutexGuard<'_, ()> {
        self.relink.lock().await
    }
}

/// `print` output: the local host, both neighbors and the queue length.
pub struct RingSummary<'a> {
    host: &'a str,
    left: Option<String>,
    right: Option<String>,
    pending: usize,
}

impl<'a> RingSummary<'a> {
    #[must_use]
    pub fn new(state: &'a SharedState) -> Self {
        Self {
            host: state.identity.host(),
            left: state.ring.left_peer(),
            right: state.ring.right_peer(),
            pending: state.ring.pending(),
        }
    }
}

impl fmt::Display for RingSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} left={} right={} pending={}",
            self.host,
            self.left.as_deref().unwrap_or("none"),
            self.right.as_deref().unwrap_or("none"),
            self.pending
        )
    }
}

/// Points both links at a fresh loopback pair.
pub async fn self_loop(state: &SharedState) {
    let _relink = state.ring.lock_relink().await;
    self_loop_locked(state);
}

fn self_loop_locked(state: &SharedState) {
    let (outbound, inbound) = duplex(LOOPBACK_BUFFER);
    let host = state.identity.host().to_string();
    let right = spawn_connection(state, framed(outbound), Role::Right, host.clone());
    let left = spawn_connection(state, framed(inbound), Role::Left, host);
    state.ring.install_loopback(left, right);
    record_neighbors(state);
    debug!("ring links point at self");
}

/// Rebuilds the loopback pair if both links were lost.
pub async fn recover(state: &SharedState) {
    let _relink = state.ring.lock_relink().await;
    if state.ring.is_detached() && !state.is_shutdown_requested() {
        warn!("lost both ring neighbors, running solo");
        self_loop_locked(state);
    }
}

/// Inserts this node immediately to the left of `host`.
///
/// # Errors
///
/// Returns an error if `host` is this node, or if connecting to it or to its
/// previous left neighbor fails.
pub async fn insert(state: &SharedState, host: &str) -> Result<(), RingError> {
    let _relink = state.ring.lock_relink().await;
    if state.identity.matches(host) {
        return Err(RingError::SelfInsert {
            host: host.to_string(),
        });
    }

    let local = state.identity.host().to_string();
    let mut link = connect(
        &state.identity.dial_addr(host),
        &state.config.phrase(),
        ConnectionType::Left(local),
    )
    .await?;
    link.send(NEW_LEFT).await.map_err(ProtocolError::from)?;
    let old_left = expect_line(&mut link).await?.trim().to_string();
    if old_left.is_empty() || old_left.contains(' ') {
        return Err(RingError::UnexpectedReply { line: old_left });
    }

    if state.ring.is_alone() {
        connect_left_locked(state, &old_left).await?;
    } else {
        state.ring.forward(format!("connect left {old_left}"));
    }

    let right = spawn_connection(state, link, Role::Right, host);
    state.ring.install_right(right);
    record_neighbors(state);
    info!(right = host, left = %old_left, "inserted into ring");
    Ok(())
}

/// Dials `host` as its right neighbor and adopts the link as our left.
///
/// # Errors
///
/// Returns an error if the connection or handshake fails.
pub async fn connect_left(state: &SharedState, host: &str) -> Result<(), RingError> {
    let _relink = state.ring.lock_relink().await;
    if state.is_shutdown_requested() {
        debug!(host, "shutting down, not relinking");
        return Ok(());
    }
    connect_left_locked(state, host).await
}

async fn connect_left_locked(state: &SharedState, host: &str) -> Result<(), RingError> {
    if state.identity.matches(host) {
        self_loop_locked(state);
        return Ok(());
    }
    let link = connect(
        &state.identity.dial_addr(host),
        &state.config.phrase(),
        ConnectionType::Right(state.identity.host().to_string()),
    )
    .await?;
    let left = spawn_connection(state, link, Role::Left, host);
    state.ring.install_left(left);
    record_neighbors(state);
    info!(left = host, "left neighbor connected");
    Ok(())
}

/// Handles `new left` arriving on a freshly accepted left connection: replies
/// with the previous left neighbor and adopts `context` in its place.
pub fn accept_new_left(state: &SharedState, context: &Arc<Context>) -> Result<(), ProtocolError> {
    let old_left = state
        .ring
        .left_peer()
        .unwrap_or_else(|| state.identity.host().to_string());
    context.reply(old_left.clone())?;
    state.ring.install_left(Arc::clone(context));
    record_neighbors(state);
    info!(left = context.peer(), previous = %old_left, "new left neighbor");
    Ok(())
}

/// Handles `done bounce` arriving on a right link.
pub fn bounce(state: &SharedState, context: &Context) {
    if state.ring.detach_right_if(context.id()) {
        debug!(conn = %context.id(), "right neighbor bounced");
    }
    context.close();
}

/// Removes this node from the ring, closing the gap behind it.
///
/// With `reconnect` the node keeps running solo; otherwise shutdown is
/// requested.
pub async fn extract(state: &SharedState, reconnect: bool) {
    let _relink = state.ring.lock_relink().await;
    if !state.ring.is_alone() && !state.ring.is_detached() {
        let (left, right) = state.ring.take_links();
        let old_left = left
            .as_ref()
            .map_or_else(|| state.identity.host().to_string(), |left| left.peer().to_string());
        if let Some(left) = left {
            left.send(DONE_BOUNCE);
            left.close();
        }
        if let Some(right) = right {
            right.send(format!("connect left {old_left}"));
            right.close();
        }
        info!(reconnect, "extracted from ring");
        if reconnect {
            self_loop_locked(state);
        }
    }
    if !reconnect {
        state.request_shutdown();
    }
}

/// Persists the current neighbors as `LeftHost`/`RightHost`.
pub fn record_neighbors(state: &SharedState) {
    let left = state.ring.left_peer();
    let right = state.ring.right_peer();
    let result = state.config.update(|config| {
        config.left_host = left;
        config.right_host = right;
        Ok(())
    });
    if let Err(e) = result {
        warn!(error = %e, "failed to persist ring neighbors");
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn identity() -> RingIdentity {
        RingIdentity::new("NodeA", Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), 8675)
    }

    #[test]
    fn test_matches_name_and_ip() {
        let id = identity();
        assert!(id.matches("nodea"));
        assert!(id.matches("NODEA:8675"));
        assert!(id.matches("10.0.0.1"));
        assert!(!id.matches("nodea:9000"));
        assert!(!id.matches("nodeb"));
        assert!(!id.matches(""));
    }

    #[test]
    fn test_matches_port_qualified_host() {
        let id = RingIdentity::new(
            "127.0.0.1:9001",
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            9001,
        );
        assert!(id.matches("127.0.0.1:9001"));
        assert!(!id.matches("127.0.0.1:9002"));
        assert!(id.matches("127.0.0.1"));
    }

    #[test]
    fn test_dial_addr() {
        let id = identity();
        assert_eq!(id.dial_addr("nodeb"), "nodeb:8675");
        assert_eq!(id.dial_addr("nodeb:9000"), "nodeb:9000");
        assert_eq!(id.dial_addr("::1"), "[::1]:8675");
        assert_eq!(id.dial_addr("[::1]:9000"), "[::1]:9000");
    }

    fn state() -> SharedState {
        Arc::new(crate::state::DaemonState::new(
            RingIdentity::new("127.0.0.1:1", Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), 1),
            mpd_core::config::ConfigStore::in_memory(mpd_core::config::MpdConfig::default()),
        ))
    }

    #[tokio::test]
    async fn test_forward_without_right_drops() {
        let state = state();
        state.ring.forward("hosts");
        assert_eq!(state.ring.pending(), 0);
    }

    #[tokio::test]
    async fn test_forward_holds_lines_after_bounce() {
        let state = state();
        self_loop(&state).await;
        let right = state.ring.right_id().unwrap();
        assert!(state.ring.detach_right_if(right));

        for i in 0..MAX_PENDING + 5 {
            state.ring.forward(format!("set k{i}=v"));
        }
        assert_eq!(state.ring.pending(), MAX_PENDING);

        self_loop(&state).await;
        assert_eq!(state.ring.pending(), 0);
    }

    #[tokio::test]
    async fn test_lost_right_discards_pending() {
        let state = state();
        self_loop(&state).await;
        let right = state.ring.right_id().unwrap();
        assert!(state.ring.detach_right_if(right));
        state.ring.forward("hosts");
        assert_eq!(state.ring.pending(), 1);

        self_loop(&state).await;
        let right = state.ring.right_id().unwrap();
        state.ring.on_closed(right);
        state.ring.forward("hosts");
        assert_eq!(state.ring.pending(), 0);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a:1"), ("a", Some(1)));
        assert_eq!(split_host_port("a"), ("a", None));
        assert_eq!(split_host_port("fe80::1"), ("fe80::1", None));
        assert_eq!(split_host_port("[fe80::1]:80"), ("fe80::1", Some(80)));
        assert_eq!(split_host_port("a:notaport"), ("a:notaport", None));
    }
}
