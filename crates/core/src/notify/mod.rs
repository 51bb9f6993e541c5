//! Replication event fan-out.
//!
//! The [`NotificationEmitter`] publishes one [`DocumentReplication`] per
//! resolved conflict to every live [`Subscription`]. Each subscriber owns an
//! unbounded queue, so a slow reader never loses events and never blocks the
//! resolver pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::ResolutionError;
use crate::models::{DocumentFlags, DocumentReplication};

type Senders = HashMap<u64, mpsc::UnboundedSender<DocumentReplication>>;

struct Listeners {
    next_id: AtomicU64,
    senders: Mutex<Senders>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, Senders> {
        self.senders.lock().unwrap_or_else(|poisoned| {
            warn!("listener mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Publishes replication events to subscribers.
#[derive(Clone)]
pub struct NotificationEmitter {
    inner: Arc<Listeners>,
}

impl Default for NotificationEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationEmitter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Listeners {
                next_id: AtomicU64::new(1),
                senders: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a new subscriber. Only events emitted afterwards are delivered.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().insert(id, tx);
        debug!(subscription = id, "replication listener added");
        Subscription {
            id,
            rx,
            listeners: Arc::downgrade(&self.inner),
        }
    }

    /// Publish the terminal outcome of one resolved conflict.
    pub fn emit(&self, document_id: &str, flags: DocumentFlags, error: Option<ResolutionError>) {
        let event = DocumentReplication {
            document_id: document_id.to_string(),
            flags,
            error,
        };
        match &event.error {
            Some(e) => warn!(
                document_id,
                deleted = flags.deleted,
                kind = e.kind(),
                error = %e,
                "conflict resolution failed"
            ),
            None => info!(document_id, deleted = flags.deleted, "conflict resolved"),
        }

        let mut senders = self.inner.lock();
        senders.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                debug!(subscription = *id, "dropping closed replication listener");
            }
            alive
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// A handle on the replication event stream.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DocumentReplication>,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the emitter is gone and
    /// every queued event has been read.
    pub async fn recv(&mut self) -> Option<DocumentReplication> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<DocumentReplication> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving events.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(&self.id);
            debug!(subscription = self.id, "replication listener removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let emitter = NotificationEmitter::new();
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();

        emitter.emit("doc1", DocumentFlags::default(), None);

        let ev = a.recv().await.unwrap();
        assert_eq!(ev.document_id, "doc1");
        assert!(ev.error.is_none());
        assert_eq!(b.recv().await.unwrap(), ev);
    }

    #[test]
    fn test_deleted_flag_and_error_are_carried() {
        let emitter = NotificationEmitter::new();
        let mut sub = emitter.subscribe();
        emitter.emit("doc1", DocumentFlags::deleted(), Some(ResolutionError::StoreClosed));

        let ev = sub.try_recv().unwrap();
        assert!(ev.flags.deleted);
        assert_eq!(ev.error, Some(ResolutionError::StoreClosed));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let emitter = NotificationEmitter::new();
        let sub = emitter.subscribe();
        let mut other = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        sub.unsubscribe();
        assert_eq!(emitter.subscriber_count(), 1);

        emitter.emit("doc1", DocumentFlags::default(), None);
        assert!(other.try_recv().is_some());
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let emitter = NotificationEmitter::new();
        emitter.emit("doc1", DocumentFlags::default(), None);
        let mut sub = emitter.subscribe();
        assert!(sub.try_recv().is_none());
    }
}
