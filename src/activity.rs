//! Bounded in-memory history of exchanges with a best-effort live feed.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::record::RequestLog;

pub const MAX_ENTRIES: usize = 1000;
/// Records buffered per live viewer before new ones are dropped for it.
pub const SUBSCRIBER_BUFFER: usize = 64;

pub type SubscriberId = u64;

/// A live viewer's end of the feed. `recv` returns `None` once unsubscribed.
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<RequestLog>,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<RequestLog>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<RequestLog>>,
}

pub struct ActivityLog {
    inner: RwLock<Inner>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ActivityLog {
            inner: RwLock::new(Inner::default()),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    // The guarded data is never left half-updated, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append then broadcast; what the proxy calls for every finished exchange.
    pub fn record(&self, entry: RequestLog) {
        self.append(entry.clone());
        self.broadcast(&entry);
    }

    /// Add to the tail, evicting from the head beyond capacity.
    pub fn append(&self, entry: RequestLog) {
        let mut inner = self.write();
        inner.entries.push_back(entry);
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
        }
    }

    /// Offer `entry` to every subscriber without waiting; full channels miss it.
    pub fn broadcast(&self, entry: &RequestLog) {
        let inner = self.read();
        for (id, sender) in &inner.subscribers {
            match sender.try_send(entry.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!(subscriber = id, "Subscriber lagging, record dropped"),
                Err(TrySendError::Closed(_)) => trace!(subscriber = id, "Subscriber gone"),
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().subscribers.insert(id, sender);
        Subscription { id, receiver }
    }

    /// Drop the sending half so the viewer's receive loop ends.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.write().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().subscribers.len()
    }

    /// Point-in-time copy of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<RequestLog> {
        self.read().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
