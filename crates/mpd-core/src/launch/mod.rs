//! Launch records and deferred replies.
//!
//! A `launch` request gets an id immediately; the pid, exit code and error
//! arrive later, either from the local supervisor or from the ring. Consoles
//! that ask for a value that does not exist yet (`getpid` while pending,
//! `getexitcodewait` while running) are parked on the record and answered by
//! whichever update settles the value.
//!
//! Status only moves forward:
//!
//! ```text
//! Pending --> Success --> Exited
//!    |  \________________/^
//!    +--> Fail
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::barrier::BarrierCoordinator;
use crate::sink::ReplySink;
use crate::wire::reply;

/// Launch id, unique per issuing daemon.
pub type LaunchId = u64;

/// Lifecycle of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    /// Request sent, no pid or error yet.
    Pending,
    /// The process is running.
    Success,
    /// The launch failed before a process existed.
    Fail,
    /// The process ran and exited.
    Exited,
}

/// Read-only view of a launch record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSnapshot {
    pub id: LaunchId,
    pub status: LaunchStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub timestamp: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct LaunchRecord {
    status: LaunchStatus,
    pid: Option<u32>,
    exit_code: Option<i32>,
    timestamp: Option<String>,
    error: Option<String>,
    pid_waiter: Option<ReplySink>,
    exit_waiter: Option<ReplySink>,
}

impl LaunchRecord {
    const fn new() -> Self {
        Self {
            status: LaunchStatus::Pending,
            pid: None,
            exit_code: None,
            timestamp: None,
            error: None,
            pid_waiter: None,
            exit_waiter: None,
        }
    }

    fn pid_reply(&self) -> String {
        self.pid
            .map_or_else(|| reply::UNKNOWN_PID.to_string(), |pid| pid.to_string())
    }

    fn snapshot(&self, id: LaunchId) -> LaunchSnapshot {
        LaunchSnapshot {
            id,
            status: self.status,
            pid: self.pid,
            exit_code: self.exit_code,
            timestamp: self.timestamp.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug)]
struct TrackerInner {
    next_id: LaunchId,
    records: BTreeMap<LaunchId, LaunchRecord>,
}

/// Replies to write once the tracker lock is released.
type Deliveries = Vec<(ReplySink, String)>;

fn deliver(deliveries: Deliveries) {
    for (sink, line) in deliveries {
        if !sink.send(line) {
            debug!(conn = sink.conn(), "deferred reply dropped, connection gone");
        }
    }
}

/// Table of launch records for one daemon.
#[derive(Debug)]
pub struct LaunchTracker {
    inner: Mutex<TrackerInner>,
    barriers: Option<Arc<BarrierCoordinator>>,
}

impl Default for LaunchTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                next_id: 1,
                records: BTreeMap::new(),
            }),
            barriers: None,
        }
    }

    /// Forwards non-zero exit codes to `barriers` as `INFO` lines.
    #[must_use]
    pub fn with_barriers(mut self, barriers: Arc<BarrierCoordinator>) -> Self {
        self.barriers = Some(barriers);
        self
    }

    /// Creates a pending record and returns its id.
    ///
    /// A `requested` id is honored when it is not already in use.
    pub fn create(&self, requested: Option<LaunchId>) -> LaunchId {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let id = match requested {
            Some(id) if !inner.records.contains_key(&id) => {
                inner.next_id = inner.next_id.max(id.saturating_add(1));
                id
            },
            _ => {
                while inner.records.contains_key(&inner.next_id) {
                    inner.next_id += 1;
                }
                let id = inner.next_id;
                inner.next_id += 1;
                id
            },
        };
        inner.records.insert(id, LaunchRecord::new());
        id
    }

    #[must_use]
    pub fn snapshot(&self, id: LaunchId) -> Option<LaunchSnapshot> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.records.get(&id).map(|r| r.snapshot(id))
    }

    /// Number of records, settled or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the pid of a started process and answers a parked `getpid`.
    pub fn save_pid(&self, id: LaunchId, pid: u32) -> bool {
        let mut deliveries = Deliveries::new();
        let saved = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            match inner.records.get_mut(&id) {
                Some(record) if record.status == LaunchStatus::Pending => {
                    record.status = LaunchStatus::Success;
                    record.pid = Some(pid);
                    if let Some(waiter) = record.pid_waiter.take() {
                        deliveries.push((waiter, pid.to_string()));
                    }
                    true
                },
                Some(record) => {
                    warn!(id, pid, status = ?record.status, "pid for launch that is not pending");
                    false
                },
                None => {
                    warn!(id, pid, "pid for unknown launch");
                    false
                },
            }
        };
        deliver(deliveries);
        saved
    }

    /// Records a launch error.
    ///
    /// A pending launch moves to `Fail` and every parked caller gets its
    /// failure reply. For a launch that already started the message is kept
    /// for `geterror` and the status is left alone.
    pub fn save_error(&self, id: LaunchId, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut deliveries = Deliveries::new();
        let failed = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(record) = inner.records.get_mut(&id) else {
                warn!(id, error = %message, "error for unknown launch");
                return false;
            };
            record.error = Some(message);
            if record.status == LaunchStatus::Pending {
                record.status = LaunchStatus::Fail;
                if let Some(waiter) = record.pid_waiter.take() {
                    deliveries.push((waiter, reply::UNKNOWN_PID.to_string()));
                }
                if let Some(waiter) = record.exit_waiter.take() {
                    deliveries.push((waiter, reply::FAIL.to_string()));
                }
                true
            } else {
                false
            }
        };
        deliver(deliveries);
        failed
    }

    /// Records the exit time string.
    pub fn save_timestamp(&self, id: LaunchId, timestamp: impl Into<String>) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.records.get_mut(&id).is_some_and(|record| {
            record.timestamp = Some(timestamp.into());
            true
        })
    }

    /// Records the exit code, answers a parked `getexitcodewait` and informs
    /// barrier waiters of a non-zero exit.
    pub fn save_exit_code(&self, id: LaunchId, exit_code: i32) -> bool {
        let mut deliveries = Deliveries::new();
        let saved = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            match inner.records.get_mut(&id) {
                Some(record)
                    if matches!(record.status, LaunchStatus::Pending | LaunchStatus::Success) =>
                {
                    record.status = LaunchStatus::Exited;
                    record.exit_code = Some(exit_code);
                    if let Some(waiter) = record.pid_waiter.take() {
                        deliveries.push((waiter, record.pid_reply()));
                    }
                    if let Some(waiter) = record.exit_waiter.take() {
                        deliveries.push((waiter, exit_code.to_string()));
                    }
                    true
                },
                Some(record) => {
                    warn!(id, exit_code, status = ?record.status, "exit code for settled launch");
                    false
                },
                None => {
                    warn!(id, exit_code, "exit code for unknown launch");
                    false
                },
            }
        };
        deliver(deliveries);
        if saved && exit_code != 0 {
            if let Some(barriers) = &self.barriers {
                barriers.inform(id, exit_code);
            }
        }
        saved
    }

    /// Answers `getpid`. Returns `None` when the reply was deferred.
    ///
    /// Only one caller can be parked per record; a second caller while the
    /// first is still waiting gets `-1`.
    pub fn query_pid(&self, id: LaunchId, requester: &ReplySink) -> Option<String> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let Some(record) = inner.records.get_mut(&id) else {
            return Some(reply::UNKNOWN_PID.to_string());
        };
        match record.status {
            LaunchStatus::Fail => Some(reply::UNKNOWN_PID.to_string()),
            LaunchStatus::Success | LaunchStatus::Exited => Some(record.pid_reply()),
            LaunchStatus::Pending if record.pid_waiter.is_some() => {
                Some(reply::UNKNOWN_PID.to_string())
            },
            LaunchStatus::Pending => {
                record.pid_waiter = Some(requester.clone());
                None
            },
        }
    }

    /// Answers `getexitcode` without waiting.
    #[must_use]
    pub fn query_exit_code(&self, id: LaunchId) -> String {
        let inner = self.inner.lock().expect("lock poisoned");
        match inner.records.get(&id) {
            None => reply::FAIL.to_string(),
            Some(record) => match (record.status, record.exit_code) {
                (LaunchStatus::Exited, Some(code)) => code.to_string(),
                (LaunchStatus::Fail, _) => reply::FAIL.to_string(),
                _ => reply::ACTIVE.to_string(),
            },
        }
    }

    /// Answers `getexitcodewait`. Returns `None` when the reply was deferred.
    pub fn query_exit_code_wait(&self, id: LaunchId, requester: &ReplySink) -> Option<String> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let Some(record) = inner.records.get_mut(&id) else {
            return Some(reply::FAIL.to_string());
        };
        match (record.status, record.exit_code) {
            (LaunchStatus::Exited, Some(code)) => Some(code.to_string()),
            (LaunchStatus::Fail | LaunchStatus::Exited, _) => Some(reply::FAIL.to_string()),
            _ if record.exit_waiter.is_some() => Some(reply::FAIL.to_string()),
            _ => {
                record.exit_waiter = Some(requester.clone());
                None
            },
        }
    }

    /// Answers `getexittime`.
    #[must_use]
    pub fn query_exit_time(&self, id: LaunchId) -> String {
        let inner = self.inner.lock().expect("lock poisoned");
        match inner.records.get(&id) {
            None => reply::FAIL.to_string(),
            Some(record) => match record.status {
                LaunchStatus::Fail => reply::FAIL.to_string(),
                LaunchStatus::Exited => record
                    .timestamp
                    .clone()
                    .unwrap_or_else(|| reply::FAIL.to_string()),
                LaunchStatus::Pending | LaunchStatus::Success => reply::ACTIVE.to_string(),
            },
        }
    }

    /// Answers `geterror`.
    #[must_use]
    pub fn query_error(&self, id: LaunchId) -> String {
        let inner = self.inner.lock().expect("lock poisoned");
        match inner.records.get(&id) {
            None => reply::FAIL.to_string(),
            Some(record) => record
                .error
                .clone()
                .unwrap_or_else(|| reply::NONE.to_string()),
        }
    }

    /// Drops a record. Parked callers get their failure reply.
    pub fn free(&self, id: LaunchId) -> bool {
        let removed = self.inner.lock().expect("lock poisoned").records.remove(&id);
        let Some(record) = removed else {
            return false;
        };
        let mut deliveries = Deliveries::new();
        if let Some(waiter) = record.pid_waiter {
            deliveries.push((waiter, reply::UNKNOWN_PID.to_string()));
        }
        if let Some(waiter) = record.exit_waiter {
            deliveries.push((waiter, reply::FAIL.to_string()));
        }
        deliver(deliveries);
        true
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn sink(conn: u64) -> (ReplySink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplySink::new(conn, tx), rx)
    }

    #[test]
    fn ids_are_monotonic_and_requested_ids_honored() {
        let tracker = LaunchTracker::new();
        assert_eq!(tracker.create(None), 1);
        assert_eq!(tracker.create(None), 2);
        assert_eq!(tracker.create(Some(10)), 10);
        assert_eq!(tracker.create(None), 11);
        // id 2 is taken, so a fresh one is allocated.
        assert_eq!(tracker.create(Some(2)), 12);
    }

    #[test]
    fn getpid_is_deferred_until_pid_arrives() {
        let tracker = LaunchTracker::new();
        let id = tracker.create(None);
        let (console, mut rx) = sink(1);

        assert_eq!(tracker.query_pid(id, &console), None);
        assert!(tracker.save_pid(id, 4242));
        assert_eq!(rx.try_recv().unwrap(), "4242");
        assert_eq!(tracker.query_pid(id, &console).as_deref(), Some("4242"));
    }

    #[test]
    fn second_getpid_waiter_gets_minus_one() {
        let tracker = LaunchTracker::new();
        let id = tracker.create(None);
        let (first, _rx1) = sink(1);
        let (second, _rx2) = sink(2);
        assert_eq!(tracker.query_pid(id, &first), None);
        assert_eq!(tracker.query_pid(id, &second).as_deref(), Some("-1"));
    }

    #[test]
    fn unknown_ids() {
        let tracker = LaunchTracker::new();
        let (console, _rx) = sink(1);
        assert_eq!(tracker.query_pid(99, &console).as_deref(), Some("-1"));
        assert_eq!(tracker.query_exit_code(99), "FAIL");
        assert_eq!(tracker.query_exit_code_wait(99, &console).as_deref(), Some("FAIL"));
        assert_eq!(tracker.query_exit_time(99), "FAIL");
        assert_eq!(tracker.query_error(99), "FAIL");
        assert!(!tracker.free(99));
    }

    #[test]
    fn failure_releases_all_waiters() {
        let tracker = LaunchTracker::new();
        let id = tracker.create(None);
        let (pid_waiter, mut pid_rx) = sink(1);
        let (exit_waiter, mut exit_rx) = sink(2);
        assert_eq!(tracker.query_pid(id, &pid_waiter), None);
        assert_eq!(tracker.query_exit_code_wait(id, &exit_waiter), None);

        assert!(tracker.save_error(id, "invalid host"));
        assert_eq!(pid_rx.try_recv().unwrap(), "-1");
        assert_eq!(exit_rx.try_recv().unwrap(), "FAIL");
        assert_eq!(tracker.query_error(id), "invalid host");
        assert_eq!(tracker.query_exit_code(id), "FAIL");
    }

    #[test]
    fn exit_code_lifecycle() {
        let tracker = LaunchTracker::new();
        let id = tracker.create(None);
        let (console, mut rx) = sink(1);

        assert_eq!(tracker.query_exit_code(id), "ACTIVE");
        tracker.save_pid(id, 7);
        assert_eq!(tracker.query_exit_code_wait(id, &console), None);
        assert_eq!(tracker.query_exit_time(id), "ACTIVE");

        tracker.save_timestamp(id, "2026-10-19 10:00:00");
        assert!(tracker.save_exit_code(id, 0));
        assert_eq!(rx.try_recv().unwrap(), "0");
        assert_eq!(tracker.query_exit_code(id), "0");
        assert_eq!(tracker.query_exit_time(id), "2026-10-19 10:00:00");
        assert_eq!(tracker.query_error(id), "none");

        // Status never moves backwards.
        assert!(!tracker.save_pid(id, 8));
        assert!(!tracker.save_exit_code(id, 1));
        assert_eq!(tracker.snapshot(id).unwrap().status, LaunchStatus::Exited);
    }

    #[test]
    fn error_after_start_keeps_status() {
        let tracker = LaunchTracker::new();
        let id = tracker.create(None);
        tracker.save_pid(id, 5);
        assert!(!tracker.save_error(id, "wait failed"));
        assert_eq!(tracker.snapshot(id).unwrap().status, LaunchStatus::Success);
        assert_eq!(tracker.query_error(id), "wait failed");
    }

    #[test]
    fn non_zero_exit_informs_barriers() {
        let barriers = Arc::new(BarrierCoordinator::new());
        let tracker = LaunchTracker::new().with_barriers(Arc::clone(&barriers));
        let (waiter, mut rx) = sink(1);
        barriers.arrive("b", 2, Some(waiter));

        let id = tracker.create(None);
        tracker.save_pid(id, 11);
        tracker.save_exit_code(id, 3);
        assert_eq!(rx.try_recv().unwrap(), format!("INFO - id={id} exitcode=3"));
    }

    #[test]
    fn free_answers_parked_callers() {
        let tracker = LaunchTracker::new();
        let id = tracker.create(None);
        let (console, mut rx) = sink(1);
        assert_eq!(tracker.query_exit_code_wait(id, &console), None);
        assert!(tracker.free(id));
        assert_eq!(rx.try_recv().unwrap(), "FAIL");
        assert_eq!(tracker.len(), 0);
    }
}
