//! Named counting barriers.
//!
//! Every node on the ring counts arrivals for a barrier name. Only the node a
//! console arrived on holds that console's reply handle; when the count is
//! reached, each node releases the waiters it holds and forgets the barrier.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::sink::ReplySink;
use crate::wire::reply;

/// Outcome of one arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArriveOutcome {
    /// The barrier still needs more arrivals.
    Waiting {
        /// Arrivals counted so far.
        arrived: usize,
        /// Arrivals required.
        count: usize,
    },
    /// The count was reached; `notified` local waiters received `SUCCESS`.
    Released {
        /// Number of waiters that were written to.
        notified: usize,
    },
}

#[derive(Debug)]
struct Barrier {
    count: usize,
    arrived: usize,
    waiters: Vec<ReplySink>,
}

/// Registry of in-progress barriers keyed by name.
#[derive(Debug, Default)]
pub struct BarrierCoordinator {
    barriers: Mutex<HashMap<String, Barrier>>,
}

impl BarrierCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one arrival at `name`.
    ///
    /// The most recent arrival sets the required count; a mismatch with the
    /// stored count is logged and the new count wins. A count of zero is
    /// treated as one.
    pub fn arrive(&self, name: &str, count: usize, waiter: Option<ReplySink>) -> ArriveOutcome {
        let count = count.max(1);
        let released = {
            let mut barriers = self.barriers.lock().expect("lock poisoned");
            let barrier = barriers.entry(name.to_string()).or_insert_with(|| Barrier {
                count,
                arrived: 0,
                waiters: Vec::new(),
            });
            if barrier.count != count {
                warn!(barrier = name, stored = barrier.count, count, "barrier count mismatch");
                barrier.count = count;
            }
            barrier.arrived += 1;
            if let Some(waiter) = waiter {
                barrier.waiters.push(waiter);
            }
            if barrier.arrived < barrier.count {
                return ArriveOutcome::Waiting {
                    arrived: barrier.arrived,
                    count: barrier.count,
                };
            }
            barriers.remove(name).map(|b| b.waiters).unwrap_or_default()
        };

        let notified = released
            .iter()
            .filter(|waiter| waiter.send(reply::SUCCESS))
            .count();
        debug!(barrier = name, notified, "barrier released");
        ArriveOutcome::Released { notified }
    }

    /// Tells every waiter on every barrier that launch `id` exited with
    /// `exit_code`. Counts are untouched. Returns the number of waiters
    /// written to.
    pub fn inform(&self, id: u64, exit_code: i32) -> usize {
        let waiters: Vec<ReplySink> = {
            let barriers = self.barriers.lock().expect("lock poisoned");
            barriers
                .values()
                .flat_map(|b| b.waiters.iter().cloned())
                .collect()
        };
        let line = format!("INFO - id={id} exitcode={exit_code}");
        waiters.iter().filter(|w| w.send(line.clone())).count()
    }

    /// Number of barriers with outstanding arrivals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.barriers.lock().expect("lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
    fn releases_exactly_at_count() {
        let coordinator = BarrierCoordinator::new();
        let (a, mut rx_a) = sink(1);
        let (b, mut rx_b) = sink(2);

        assert_eq!(
            coordinator.arrive("x", 3, Some(a)),
            ArriveOutcome::Waiting { arrived: 1, count: 3 }
        );
        assert_eq!(
            coordinator.arrive("x", 3, Some(b)),
            ArriveOutcome::Waiting { arrived: 2, count: 3 }
        );
        assert!(rx_a.try_recv().is_err());

        assert_eq!(
            coordinator.arrive("x", 3, None),
            ArriveOutcome::Released { notified: 2 }
        );
        assert_eq!(rx_a.try_recv().unwrap(), "SUCCESS");
        assert_eq!(rx_b.try_recv().unwrap(), "SUCCESS");
        assert!(coordinator.is_empty());
    }

    #[test]
    fn single_arrival_barrier_releases_immediately() {
        let coordinator = BarrierCoordinator::new();
        let (a, mut rx) = sink(1);
        assert_eq!(
            coordinator.arrive("solo", 1, Some(a)),
            ArriveOutcome::Released { notified: 1 }
        );
        assert_eq!(rx.try_recv().unwrap(), "SUCCESS");
    }

    #[test]
    fn mismatched_count_uses_latest() {
        let coordinator = BarrierCoordinator::new();
        let (a, mut rx_a) = sink(1);
        let (b, mut rx_b) = sink(2);

        assert_eq!(
            coordinator.arrive("x", 3, Some(a)),
            ArriveOutcome::Waiting { arrived: 1, count: 3 }
        );
        assert_eq!(
            coordinator.arrive("x", 2, Some(b)),
            ArriveOutcome::Released { notified: 2 }
        );
        assert_eq!(rx_a.try_recv().unwrap(), "SUCCESS");
        assert_eq!(rx_b.try_recv().unwrap(), "SUCCESS");
        assert!(coordinator.is_empty());
    }

    #[test]
    fn raised_count_keeps_waiting() {
        let coordinator = BarrierCoordinator::new();
        coordinator.arrive("y", 2, None);
        assert_eq!(
            coordinator.arrive("y", 4, None),
            ArriveOutcome::Waiting { arrived: 2, count: 4 }
        );
    }

    #[test]
    fn names_are_independent() {
        let coordinator = BarrierCoordinator::new();
        coordinator.arrive("a", 2, None);
        coordinator.arrive("b", 2, None);
        assert_eq!(coordinator.len(), 2);
        coordinator.arrive("a", 2, None);
        assert_eq!(coordinator.len(), 1);
    }

    #[test]
    fn inform_reaches_all_waiters_without_counting() {
        let coordinator = BarrierCoordinator::new();
        let (a, mut rx_a) = sink(1);
        let (b, mut rx_b) = sink(2);
        coordinator.arrive("p", 4, Some(a));
        coordinator.arrive("q", 4, Some(b));

        assert_eq!(coordinator.inform(7, 3), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "INFO - id=7 exitcode=3");
        assert_eq!(rx_b.try_recv().unwrap(), "INFO - id=7 exitcode=3");
        assert_eq!(
            coordinator.arrive("p", 4, None),
            ArriveOutcome::Waiting { arrived: 2, count: 4 }
        );
    }
}
