//! Per-key sequence stamps

use crate::GroupingKey;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-key monotonically increasing counters starting at 1.
///
/// A counter is dropped when its key is evicted from the allocator, so a key
/// that comes back later starts over at 1.
#[derive(Debug, Default)]
pub(crate) struct SequenceGenerators {
    counters: DashMap<GroupingKey, AtomicU64>,
}

impl SequenceGenerators {
    /// Create an empty set of generators
    pub(crate) fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Return the next stamp for `key` and advance its counter
    pub(crate) fn next(&self, key: GroupingKey) -> u64 {
        if let Some(counter) = self.counters.get(&key) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(1))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Forget `key`'s counter
    pub(crate) fn remove(&self, key: GroupingKey) {
        self.counters.remove(&key);
    }

    /// Forget every counter
    pub(crate) fn clear(&self) {
        self.counters.clear();
    }
}

#[cfg(test)]
impl SequenceGenerators {
    fn peek(&self, key: GroupingKey) -> Option<u64> {
        self.counters
            .get(&key)
            .map(|counter| counter.load(Ordering::Relaxed))
    }

    fn len(&self) -> usize {
        self.counters.len()
    }

    fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
