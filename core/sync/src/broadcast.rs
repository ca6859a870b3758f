//! Status listener registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::state::SyncStatus;

/// Callback receiving full status snapshots.
pub type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes [`SyncStatus`] snapshots to any number of listeners.
///
/// Every listener gets the same snapshot; there are no diffs and no
/// ordering guarantee between listeners.
#[derive(Clone, Default)]
pub struct StatusBroadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, Arc::new(listener));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove a listener by id. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        lock(&self.registry).listeners.remove(&id).is_some()
    }

    /// Call every listener with `status`.
    pub fn publish(&self, status: &SyncStatus) {
        // Listeners run outside the lock so they may subscribe/unsubscribe.
        let listeners: Vec<Listener> = lock(&self.registry).listeners.values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }
}

/// Registration handle returned by [`StatusBroadcaster::subscribe`].
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the listener registered for the broadcaster's lifetime.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status(pending: usize) -> SyncStatus {
        SyncStatus {
            is_online: true,
            is_syncing: false,
            last_sync_time: None,
            pending_operations: pending,
            failed_operations: 0,
            backend_configured: true,
        }
    }

    #[test]
    fn test_all_listeners_receive_same_snapshot() {
        let broadcaster = StatusBroadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            broadcaster.subscribe(move |s| seen.lock().unwrap().push(("a", s.pending_operations)))
        };
        let b = {
            let seen = seen.clone();
            broadcaster.subscribe(move |s| seen.lock().unwrap().push(("b", s.pending_operations)))
        };

        broadcaster.publish(&status(4));

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![("a", 4), ("b", 4)]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broadcaster = StatusBroadcaster::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let calls = calls.clone();
            broadcaster.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        broadcaster.publish(&status(0));
        subscription.unsubscribe();
        broadcaster.publish(&status(0));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[test]
    fn test_detach_keeps_listener() {
        let broadcaster = StatusBroadcaster::new();
        let subscription = broadcaster.subscribe(|_| {});
        let id = subscription.id();
        subscription.detach();

        assert_eq!(broadcaster.listener_count(), 1);
        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
    }

    #[test]
    fn test_listener_may_unsubscribe_during_publish() {
        let broadcaster = StatusBroadcaster::new();
        let inner = broadcaster.clone();
        broadcaster
            .subscribe(move |_| {
                inner.unsubscribe(0);
            })
            .detach();

        broadcaster.publish(&status(1));
        assert_eq!(broadcaster.listener_count(), 0);
    }
}
