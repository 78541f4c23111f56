//! Transition guard table

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::StateKey;

/// Zero-argument predicate gating one `(from, to)` transition.
///
/// Guards are treated as pure by the engine but nothing enforces it. They run
/// while the engine lock is held, so a guard must not call back into the
/// machine.
pub type Guard = Arc<dyn Fn() -> bool + Send + Sync>;

/// At most one guard per ordered pair. A missing entry allows the transition.
pub(crate) struct GuardTable<K: StateKey> {
    guards: HashMap<(K, K), Guard>,
}

impl<K: StateKey> GuardTable<K> {
    pub(crate) fn new() -> Self {
        Self {
            guards: HashMap::new(),
        }
    }

    /// Install or replace the guard for `(from, to)`. Returns true if one was replaced.
    pub(crate) fn insert(&mut self, from: K, to: K, guard: Guard) -> bool {
        self.guards.insert((from, to), guard).is_some()
    }

    /// Evaluate the guard for `(from, to)`; unguarded pairs are always allowed
    pub(crate) fn allows(&self, from: &K, to: &K) -> bool {
        match self.guards.get(&(from.clone(), to.clone())) {
            Some(guard) => guard(),
            None => true,
        }
    }

    #[cfg(all(feature = "plantuml", debug_assertions))]
    pub(crate) fn pairs(&self) -> impl Iterator<Item = &(K, K)> {
        self.guards.keys()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.guards.len()
    }
}

impl<K: StateKey> fmt::Debug for GuardTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.guards.keys()).finish()
    }
}
