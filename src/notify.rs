//! Change notifications fired after every committed transition

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::StateKey;

/// Payload of a change notification.
///
/// `previous` is `None` for the notification fired by the initial state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange<K> {
    /// Key that was active before the transition
    pub previous: Option<K>,
    /// Key that is active now
    pub current: K,
}

/// Handle returned by [`StateMachine::subscribe`](crate::StateMachine::subscribe)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<K> = Arc<dyn Fn(&StateChange<K>) + Send + Sync>;

pub(crate) struct Listeners<K: StateKey> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Listener<K>)>>,
}

impl<K: StateKey> Listeners<K> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChange<K>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Call every listener in subscription order. The list is snapshotted
    /// first so listeners may subscribe or unsubscribe while being notified.
    pub(crate) fn emit(&self, change: &StateChange<K>) {
        let snapshot: Vec<Listener<K>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(change);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
