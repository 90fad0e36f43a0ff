//! Per-document fan-out with backpressure.
//!
//! Every connection in a room holds a receiver on one tokio broadcast
//! channel. Frames are encoded once and tagged with the sending connection
//! so receivers can skip their own traffic. A receiver that falls more than
//! `capacity` frames behind loses the oldest ones and is told how many.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use inkpad_core::Participant;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::protocol::Frame;

/// An encoded frame and the connection it came from.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Uuid,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_members: usize,
}

/// Broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: RwLock<HashMap<Uuid, Participant>>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_member(&self, conn: Uuid, participant: Participant) -> broadcast::Receiver<Arc<Envelope>> {
        self.members.write().await.insert(conn, participant);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, conn: &Uuid) -> Option<Participant> {
        self.members.write().await.remove(conn)
    }

    /// Encode `frame` once and fan it out. Returns the number of receivers.
    pub fn broadcast(&self, origin: Uuid, frame: &Frame) -> Result<usize, ProtocolError> {
        let bytes = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(Envelope { origin, bytes })))
    }

    /// Fan out an already-encoded envelope.
    pub fn broadcast_raw(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver lost.
    pub fn record_dropped(&self, frames: u64) {
        self.frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    /// Forget every member. Receivers already handed out stay subscribed.
    pub async fn clear_members(&self) {
        self.members.write().await.clear();
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Participant> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, conn: &Uuid) -> bool {
        self.members.read().await.contains_key(conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkpad_core::{DocumentId, Role};

    fn member(name: &str) -> Participant {
        Participant::ephemeral(name, Role::Editor)
    }

    fn changes(update: Vec<u8>) -> Frame {
        Frame::ReceiveChanges {
            doc_id: DocumentId::from("doc"),
            update,
        }
    }

    #[tokio::test]
    async fn test_membership() {
        let group = BroadcastGroup::new(16);
        let a = Uuid::new_v4();
        let _rx = group.add_member(a, member("A")).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(&a).await);

        assert_eq!(group.remove_member(&a).await.map(|p| p.name), Some("A".to_string()));
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_tags_origin() {
        let group = BroadcastGroup::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = group.add_member(a, member("A")).await;
        let mut rx_b = group.add_member(b, member("B")).await;

        let frame = changes(vec![1, 2, 3]);
        assert_eq!(group.broadcast(a, &frame).unwrap(), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.origin, a);
            assert_eq!(Frame::decode(&envelope.bytes).unwrap(), frame);
        }
        assert_eq!(group.stats().await.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_no_members_is_not_an_error() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(Uuid::new_v4(), &Frame::Ping).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_member(Uuid::new_v4(), member("slow")).await;
        for i in 0..5u8 {
            group.broadcast(Uuid::nil(), &changes(vec![i])).unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().await.frames_dropped, 3);
    }
}
