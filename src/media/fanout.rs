//! Lossy one-to-many byte fan-out

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identifier of a fan-out member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(u64);

/// Outcome of one [`FanOut::send`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Members whose queue was full; they miss this chunk
    pub skipped: usize,
    /// Members whose receiver was gone; they were removed
    pub closed: usize,
}

/// A set of bounded queues that all receive the same chunks.
///
/// Sending never waits: a member that has not drained its queue simply
/// misses the chunk. Members may be added or removed from any task while
/// another task is sending.
#[derive(Debug, Default)]
pub struct FanOut {
    members: Mutex<HashMap<MemberId, mpsc::Sender<Bytes>>>,
    next_id: AtomicU64,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member with room for `capacity` queued chunks.
    pub fn join(&self, capacity: usize) -> (MemberId, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = MemberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Remove a member. Its receiver sees the end of the queue once drained.
    pub fn leave(&self, id: MemberId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Offer `chunk` to every member without waiting.
    pub fn send(&self, chunk: &Bytes) -> Delivery {
        let mut delivery = Delivery::default();
        let mut members = self.lock();
        members.retain(|_, tx| match tx.try_send(chunk.clone()) {
            Ok(()) => {
                delivery.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                delivery.skipped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                delivery.closed += 1;
                false
            }
        });
        delivery
    }

    /// Remove every member.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MemberId, mpsc::Sender<Bytes>>> {
        // Poisoning only means a panic elsewhere; the map itself stays consistent
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
