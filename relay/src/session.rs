//! Active tunnel session tracking.
//!
//! The relay accepts at most one agent session at a time. The slot hands out
//! cheap cloneable handles whose channel feeds the socket task's single
//! writer, so concurrent request handlers never interleave bytes on the wire.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};

/// Handle to the live session. Sending enqueues an encoded frame for the
/// socket task that owns the WebSocket sink.
#[derive(Clone)]
pub struct SessionHandle {
    ordinal: u64,
    peer: String,
    tx: mpsc::Sender<Vec<u8>>,
}

impl SessionHandle {
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), mpsc::error::SendError<Vec<u8>>> {
        self.tx.send(frame).await
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

pub struct SessionSlot {
    active: RwLock<Option<SessionHandle>>,
    ordinals: AtomicU64,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
            ordinals: AtomicU64::new(0),
        }
    }

    /// Adopt a new session if the slot is empty. Returns `None` when a
    /// session is already active; the caller must refuse the connection and
    /// leave the existing session untouched.
    pub async fn try_adopt(
        &self,
        tx: mpsc::Sender<Vec<u8>>,
        peer: String,
    ) -> Option<SessionHandle> {
        let mut active = self.active.write().await;
        if active.is_some() {
            return None;
        }
        let handle = SessionHandle {
            ordinal: self.ordinals.fetch_add(1, Ordering::Relaxed),
            peer,
            tx,
        };
        *active = Some(handle.clone());
        Some(handle)
    }

    /// Clear the slot, but only if it still holds `handle`'s session. A
    /// stale release from an already-replaced session must not evict the
    /// current one.
    pub async fn release(&self, handle: &SessionHandle) {
        let mut active = self.active.write().await;
        if active.as_ref().is_some_and(|h| h.ordinal == handle.ordinal) {
            *active = None;
        }
    }

    pub async fn current(&self) -> Option<SessionHandle> {
        self.active.read().await.clone()
    }
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_adopt_refused_while_active() {
        let slot = SessionSlot::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        let first = slot.try_adopt(tx1, "10.0.0.1".into()).await;
        assert!(first.is_some());
        assert!(slot.try_adopt(tx2, "10.0.0.2".into()).await.is_none());

        // The original session is unaffected.
        assert_eq!(slot.current().await.unwrap().peer(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_release_then_adopt_succeeds() {
        let slot = SessionSlot::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        let first = slot.try_adopt(tx1, "a".into()).await.unwrap();
        slot.release(&first).await;
        assert!(slot.current().await.is_none());
        assert!(slot.try_adopt(tx2, "b".into()).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_release_does_not_evict_newer_session() {
        let slot = SessionSlot::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        let first = slot.try_adopt(tx1, "a".into()).await.unwrap();
        slot.release(&first).await;
        let _second = slot.try_adopt(tx2, "b".into()).await.unwrap();

        slot.release(&first).await;
        assert_eq!(slot.current().await.unwrap().peer(), "b");
    }

    #[tokio::test]
    async fn test_send_reaches_socket_task_channel() {
        let slot = SessionSlot::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = slot.try_adopt(tx, "a".into()).await.unwrap();

        handle.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }
}
