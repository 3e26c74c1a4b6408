//! Fair lane allocator
//!
//! Resolves grouping keys to lanes. A key keeps its lane for as long as it
//! stays in the access-ordered map; a new key goes to the lane with the fewest
//! live keys. When the map outgrows its bound the least recently resolved key
//! is evicted, its lane's count is released and its sequence counter dropped,
//! all inside the critical section of the insertion that caused it.
//!
//! Lock order is fixed: `assignments` first, then `counts`. The count index
//! is never locked on its own.

use crate::counts::CountIndex;
use crate::lru::AccessOrder;
use crate::sequence::SequenceGenerators;
use crate::{eviction_bound, ConfigError, GroupingKey, LaneIndex, DEFAULT_HEADROOM};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Initial map allocation is capped so large bounds don't reserve memory up front
const INITIAL_CAPACITY_CAP: usize = 1000;

/// Memory-bounded, least-count-first key to lane allocator
pub struct FairLaneAllocator {
    /// Number of lanes
    lanes: usize,

    /// Configured key capacity
    max_keys: u32,

    /// Eviction bound (`max_keys × headroom`)
    capacity: usize,

    /// key -> lane, ordered by last resolve
    assignments: Mutex<AccessOrder>,

    /// lane -> number of live keys
    counts: Mutex<CountIndex>,

    /// key -> next sequence stamp
    sequences: SequenceGenerators,
}

impl FairLaneAllocator {
    /// Create an allocator over `lanes` lanes keeping up to `2 × max_keys` keys
    pub fn new(lanes: usize, max_keys: u32) -> Result<Self, ConfigError> {
        Self::with_headroom(lanes, max_keys, DEFAULT_HEADROOM)
    }

    /// Create an allocator whose eviction bound is `headroom × max_keys`
    pub fn with_headroom(lanes: usize, max_keys: u32, headroom: u32) -> Result<Self, ConfigError> {
        if lanes == 0 {
            return Err(ConfigError::NoLanes);
        }
        let capacity = eviction_bound(max_keys, headroom)?;

        Ok(Self {
            lanes,
            max_keys,
            capacity,
            assignments: Mutex::new(AccessOrder::with_capacity(capacity.min(INITIAL_CAPACITY_CAP))),
            counts: Mutex::new(CountIndex::new(lanes)),
            sequences: SequenceGenerators::new(),
        })
    }

    /// Resolve `key` to its lane, assigning one if the key is new.
    ///
    /// Repeated calls return the same lane until the key is evicted.
    pub fn resolve(&self, key: GroupingKey) -> LaneIndex {
        let mut assignments = self.assignments.lock();
        if let Some(lane) = assignments.get_refresh(key) {
            return lane;
        }

        let mut counts = self.counts.lock();
        let lane = counts.acquire();
        assignments.insert(key, lane);

        while assignments.len() > self.capacity {
            match assignments.pop_lru() {
                Some((evicted, evicted_lane)) => {
                    counts.release(evicted_lane);
                    self.sequences.remove(evicted);
                    trace!(key = evicted, lane = evicted_lane, "evicted least recently used key");
                }
                None => break,
            }
        }

        lane
    }

    /// Next per-key sequence stamp, starting at 1.
    ///
    /// Independent of `resolve`; the counter restarts once `key` is evicted.
    pub fn next_sequence(&self, key: GroupingKey) -> u64 {
        self.sequences.next(key)
    }

    /// Lane currently assigned to `key`, without refreshing its recency
    pub fn assignment(&self, key: GroupingKey) -> Option<LaneIndex> {
        self.assignments.lock().peek(key)
    }

    /// Reset assignments, counts and sequence counters
    pub fn clear(&self) {
        let mut assignments = self.assignments.lock();
        let mut counts = self.counts.lock();
        assignments.clear();
        counts.reset();
        self.sequences.clear();
    }

    /// Copy of the per-lane key counts
    pub fn snapshot_counts(&self) -> Vec<u32> {
        let _assignments = self.assignments.lock();
        self.counts.lock().counts().to_vec()
    }

    /// Copy of the live key to lane mapping
    pub fn snapshot_assignments(&self) -> FxHashMap<GroupingKey, LaneIndex> {
        self.assignments.lock().iter().collect()
    }

    /// Number of live assignments
    pub fn key_count(&self) -> usize {
        self.assignments.lock().len()
    }

    /// Number of lanes
    pub fn lane_count(&self) -> usize {
        self.lanes
    }

    /// Configured key capacity
    pub fn max_keys(&self) -> u32 {
        self.max_keys
    }

    /// Number of assignments kept before eviction starts
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for FairLaneAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairLaneAllocator")
            .field("lanes", &self.lanes)
            .field("max_keys", &self.max_keys)
            .field("capacity", &self.capacity)
            .field("keys", &self.key_count())
            .finish()
    }
}
