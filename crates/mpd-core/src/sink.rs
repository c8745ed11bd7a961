//! Reply handles.
//!
//! A [`ReplySink`] is a cloneable handle onto the outbound queue of one
//! connection. Launch records and barriers hold sinks so that a reply can be
//! written long after the request that asked for it was dispatched.

use tokio::sync::mpsc;

/// Handle that queues reply lines onto one connection's writer.
#[derive(Debug, Clone)]
pub struct ReplySink {
    conn: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl ReplySink {
    #[must_use]
    pub const fn new(conn: u64, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { conn, tx }
    }

    /// Id of the connection this sink writes to.
    #[must_use]
    pub const fn conn(&self) -> u64 {
        self.conn
    }

    /// Queues one line. Returns `false` if the connection is already gone.
    pub fn send(&self, line: impl Into<String>) -> bool {
        self.tx.send(line.into()).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_reports_closed_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ReplySink::new(3, tx);
        assert!(sink.send("SUCCESS"));
        assert_eq!(rx.try_recv().unwrap(), "SUCCESS");
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.send("late"));
        assert_eq!(sink.conn(), 3);
    }
}
