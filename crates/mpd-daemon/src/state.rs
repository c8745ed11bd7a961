//! Shared daemon state.
//!
//! Every collection carries its own lock and no code path holds two of them
//! at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mpd_core::barrier::BarrierCoordinator;
use mpd_core::config::ConfigStore;
use mpd_core::db::Database;
use mpd_core::forwarder::ForwarderRegistry;
use mpd_core::launch::LaunchTracker;
use mpd_core::process::ProcessSupervisor;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ConnectionRegistry, Context};
use crate::ring::{self, RingIdentity, RingManager};

/// Shared daemon state.
pub type SharedState = Arc<DaemonState>;

/// Everything a connection handler can reach.
#[derive(Debug)]
pub struct DaemonState {
    pub identity: RingIdentity,
    pub config: ConfigStore,
    pub registry: ConnectionRegistry,
    pub ring: RingManager,
    pub tracker: LaunchTracker,
    pub barriers: Arc<BarrierCoordinator>,
    pub db: Database,
    pub supervisor: Arc<ProcessSupervisor>,
    pub forwarders: ForwarderRegistry,
    shutdown: CancellationToken,
    restart: AtomicBool,
}

impl DaemonState {
    #[must_use]
    pub fn new(identity: RingIdentity, config: ConfigStore) -> Self {
        let barriers = Arc::new(BarrierCoordinator::new());
        Self {
            identity,
            config,
            registry: ConnectionRegistry::new(),
            ring: RingManager::new(),
            tracker: LaunchTracker::new().with_barriers(Arc::clone(&barriers)),
            barriers,
            db: Database::new(),
            supervisor: Arc::new(ProcessSupervisor::new()),
            forwarders: ForwarderRegistry::new(),
            shutdown: CancellationToken::new(),
            restart: AtomicBool::new(false),
        }
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Marks the coming shutdown as a restart: the binary re-executes itself
    /// once the daemon has stopped.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// Token cancelled when shutdown is requested.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// `stat` output.
    #[must_use]
    pub fn stat(&self) -> String {
        format!(
            "contexts={} launches={} processes={} forwarders={} barriers={} databases={}",
            self.registry.len(),
            self.tracker.len(),
            self.supervisor.running(),
            self.forwarders.len(),
            self.barriers.len(),
            self.db.len(),
        )
    }

    /// Unregisters a connection whose reader has stopped.
    pub(crate) fn connection_closed(self: &Arc<Self>, context: &Context) {
        self.registry.remove(context.id());
        if self.ring.on_closed(context.id()) && !self.is_shutdown_requested() {
            let state = Arc::clone(self);
            tokio::spawn(async move { ring::recover(&state).await });
        }
    }
}
