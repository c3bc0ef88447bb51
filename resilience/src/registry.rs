//! Per-key state registry shared by every primitive.
//!
//! Each primitive partitions its state by an opaque caller-chosen key (one
//! logical protected dependency per key). Entries are created lazily on
//! first use and live for the process lifetime; manual operations may reset
//! an entry's state but never remove it.
//!
//! The map is sharded ([`DashMap`]) so unrelated keys never contend on a
//! single lock.

use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent per-key registry with atomic get-or-create semantics.
pub struct StateRegistry<T> {
    entries: DashMap<String, Arc<T>>,
}

impl<T> StateRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Get the entry for `key`, creating it with `init` if absent.
    ///
    /// Creation is atomic: two racing callers observe the same entry and
    /// `init` runs at most once per inserted key.
    pub fn get_or_create(&self, key: &str, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.entries
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(init()))
                .value(),
        )
    }

    /// Get the entry for `key` without creating it.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// All registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Arc<T>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for StateRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
