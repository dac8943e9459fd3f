//! A sparse map from edge identifiers to 32-bit counts.
//!
//! The counter keeps, next to the map itself, an append-only list of the keys
//! that became non-zero. Consumers that want to enumerate the covered edges
//! scan that list instead of the whole map. The list is a superset of the
//! true non-zero key set: it may contain duplicates, and no consumer is
//! allowed to rely on its uniqueness.

use ahash::AHashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default, Clone)]
pub(crate) struct CounterInner {
    pub(crate) counts: AHashMap<u32, u32>,
    pub(crate) non_zero_keys: Vec<u32>,
}

impl CounterInner {
    pub(crate) fn increment_by(&mut self, key: u32, delta: u32) -> u32 {
        let count = self.counts.entry(key).or_insert(0);
        let was_zero = *count == 0;
        *count = count.wrapping_add(delta);
        if was_zero && *count != 0 {
            self.non_zero_keys.push(key);
        }
        *count
    }

    pub(crate) fn get(&self, key: u32) -> u32 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub(crate) fn non_zero_size(&self) -> usize {
        self.counts.values().filter(|&&v| v != 0).count()
    }
}

/// A counter of how many times each edge was exercised.
///
/// Every method takes the internal lock, so the cumulative-merge path can
/// read a counter while the single writer thread is still appending to it
/// without observing a torn entry.
pub struct Counter {
    inner: Mutex<CounterInner>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CounterInner::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CounterInner> {
        self.inner.lock().unwrap()
    }

    /// Increments the count for `key` by 1 and returns the new count.
    pub fn increment(&self, key: u32) -> u32 {
        self.lock().increment_by(key, 1)
    }

    /// Increments the count for `key` by `delta` and returns the new count.
    pub fn increment_by(&self, key: u32, delta: u32) -> u32 {
        self.lock().increment_by(key, delta)
    }

    pub fn get(&self, key: u32) -> u32 {
        self.lock().get(key)
    }

    /// Number of keys that have ever been touched.
    pub fn size(&self) -> usize {
        self.lock().counts.len()
    }

    /// Number of keys whose count is currently non-zero.
    pub fn non_zero_size(&self) -> usize {
        self.lock().non_zero_size()
    }

    /// The append-only list of keys that became non-zero, in the order they
    /// first did. May contain duplicates; treat it as a superset to scan.
    pub fn non_zero_keys(&self) -> Vec<u32> {
        self.lock().non_zero_keys.clone()
    }

    /// The current values of the distinct non-zero keys.
    pub fn non_zero_values(&self) -> Vec<u32> {
        self.lock().counts.values().copied().filter(|&v| v != 0).collect()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.counts.clear();
        inner.non_zero_keys.clear();
    }

    pub fn copy_from(&self, other: &Counter) {
        let snapshot = other.lock().clone();
        *self.lock() = snapshot;
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self {
            inner: Mutex::new(self.lock().clone()),
        }
    }
}
