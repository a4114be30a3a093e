//! Request correlation for the relay.
//!
//! Every public request in flight through the tunnel owns an entry here,
//! keyed by its frame id and holding the oneshot sink that completes the
//! waiting HTTP response. Resolution removes the entry before completing
//! the sink, so an id can never be completed twice.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info};

use porthole_shared::protocol::ResponseFrame;
use porthole_shared::TunnelError;

/// Completion channel for one pending public response.
pub type PendingSink = oneshot::Sender<Result<ResponseFrame, TunnelError>>;

pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingSink>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
        }
    }

    /// Allocate the next request id. Monotonic from 0; never reused while
    /// a prior owner is still pending.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, id: u64, sink: PendingSink) -> Result<(), TunnelError> {
        use dashmap::mapref::entry::Entry;

        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(TunnelError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(sink);
                Ok(())
            }
        }
    }

    /// Complete the pending sink for `frame.id` with the frame. The entry is
    /// removed first; a second delivery for the same id finds nothing and is
    /// reported as `NotFound`. A sink whose receiver is already gone (public
    /// client disconnected) is dropped without a reply.
    pub fn resolve(&self, frame: ResponseFrame) -> Result<(), TunnelError> {
        let id = frame.id;
        match self.pending.remove(&id) {
            Some((_, sink)) => {
                if sink.send(Ok(frame)).is_err() {
                    debug!("Public client went away before response {} arrived", id);
                }
                Ok(())
            }
            None => Err(TunnelError::NotFound(id)),
        }
    }

    /// Drop a pending entry without completing it (send failure, timeout).
    pub fn discard(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Fail every pending sink with `UpstreamUnavailable`. Invoked on session
    /// teardown. Idempotent: each entry is removed exactly once, and a second
    /// call over an empty table does nothing.
    pub fn drain_and_fail(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for id in ids {
            if let Some((_, sink)) = self.pending.remove(&id) {
                let _ = sink.send(Err(TunnelError::UpstreamUnavailable(reason.to_string())));
                failed += 1;
            }
        }
        if failed > 0 {
            info!("Failed {} pending requests: {}", failed, reason);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u64, status: u16) -> ResponseFrame {
        ResponseFrame {
            id,
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let table = CorrelationTable::new();
        assert_eq!(table.next_id(), 0);
        assert_eq!(table.next_id(), 1);
        assert_eq!(table.next_id(), 2);
    }

    #[test]
    fn test_register_and_resolve() {
        let table = CorrelationTable::new();
        let (tx, mut rx) = oneshot::channel();
        table.register(0, tx).unwrap();

        table.resolve(frame(0, 200)).unwrap();
        let delivered = rx.try_recv().unwrap().unwrap();
        assert_eq!(delivered.status, 200);
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_id() {
        let table = CorrelationTable::new();
        assert!(matches!(
            table.resolve(frame(9, 200)),
            Err(TunnelError::NotFound(9))
        ));
    }

    #[test]
    fn test_double_resolution_rejected() {
        let table = CorrelationTable::new();
        let (tx, _rx) = oneshot::channel();
        table.register(4, tx).unwrap();

        table.resolve(frame(4, 200)).unwrap();
        assert!(matches!(
            table.resolve(frame(4, 200)),
            Err(TunnelError::NotFound(4))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = CorrelationTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        table.register(1, tx1).unwrap();
        assert!(matches!(
            table.register(1, tx2),
            Err(TunnelError::DuplicateId(1))
        ));
    }

    #[test]
    fn test_out_of_order_resolution_matches_by_id() {
        let table = CorrelationTable::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let id = table.next_id();
            let (tx, rx) = oneshot::channel();
            table.register(id, tx).unwrap();
            receivers.push((id, rx));
        }

        // Completion order differs from submission order.
        for id in [2, 0, 3, 1] {
            table.resolve(frame(id, 200 + id as u16)).unwrap();
        }

        for (id, mut rx) in receivers {
            let delivered = rx.try_recv().unwrap().unwrap();
            assert_eq!(delivered.id, id);
            assert_eq!(delivered.status, 200 + id as u16);
        }
    }

    #[test]
    fn test_drain_fails_every_pending_sink_once() {
        let table = CorrelationTable::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        table.register(0, tx1).unwrap();
        table.register(1, tx2).unwrap();

        table.drain_and_fail("tunnel agent disconnected");
        assert_eq!(table.pending_count(), 0);
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(TunnelError::UpstreamUnavailable(_))
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            Err(TunnelError::UpstreamUnavailable(_))
        ));

        // A second drain over the now-empty table is a no-op.
        table.drain_and_fail("tunnel agent disconnected");
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_drain_on_empty_table_is_noop() {
        let table = CorrelationTable::new();
        table.drain_and_fail("nothing pending");
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let table = CorrelationTable::new();
        let (tx, rx) = oneshot::channel();
        table.register(5, tx).unwrap();
        drop(rx);

        // Entry is released without anyone to notify.
        table.resolve(frame(5, 200)).unwrap();
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_each_get_own_response() {
        use std::sync::Arc;

        let table = Arc::new(CorrelationTable::new());
        let mut waiters = Vec::new();

        for _ in 0..16 {
            let id = table.next_id();
            let (tx, rx) = oneshot::channel();
            table.register(id, tx).unwrap();
            waiters.push(tokio::spawn(async move {
                let delivered = rx.await.unwrap().unwrap();
                assert_eq!(delivered.id, id);
                id
            }));
        }

        // Resolve from another task in reverse order.
        let resolver = Arc::clone(&table);
        tokio::spawn(async move {
            for id in (0..16).rev() {
                resolver.resolve(frame(id, 200)).unwrap();
            }
        });

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(table.pending_count(), 0);
    }
}
