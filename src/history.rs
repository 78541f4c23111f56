//! Undo history

use crate::StateKey;

/// Last-in-first-out record of previously active keys, most recent last
#[derive(Debug, Clone)]
pub(crate) struct History<K: StateKey> {
    entries: Vec<K>,
}

impl<K: StateKey> History<K> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, key: K) {
        self.entries.push(key);
    }

    pub(crate) fn pop(&mut self) -> Option<K> {
        self.entries.pop()
    }

    pub(crate) fn peek(&self) -> Option<&K> {
        self.entries.last()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first
    pub(crate) fn to_vec(&self) -> Vec<K> {
        self.entries.clone()
    }
}
