//! Per-lane usage counts with least-loaded lookup

use crate::LaneIndex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Usage count of every lane, bucketed by count.
///
/// Each lane sits in exactly one bucket, and that bucket's count equals the
/// lane's entry in `per_lane`. The smallest bucket yields the least-loaded
/// lanes; within a bucket the smallest lane index wins.
#[derive(Debug, Clone)]
pub(crate) struct CountIndex {
    /// count -> lanes currently holding that count
    buckets: BTreeMap<u32, BTreeSet<LaneIndex>>,

    /// lane -> count
    per_lane: Vec<u32>,
}

impl CountIndex {
    /// Create an index with `lanes` lanes, all at count zero
    pub(crate) fn new(lanes: usize) -> Self {
        let mut index = Self {
            buckets: BTreeMap::new(),
            per_lane: vec![0; lanes],
        };
        index.reset();
        index
    }

    /// Put every lane back at count zero
    pub(crate) fn reset(&mut self) {
        self.buckets.clear();
        self.per_lane.iter_mut().for_each(|count| *count = 0);
        if !self.per_lane.is_empty() {
            self.buckets.insert(0, (0..self.per_lane.len()).collect());
        }
    }

    /// Pick the least-loaded lane and bump its count
    pub(crate) fn acquire(&mut self) -> LaneIndex {
        if self.buckets.is_empty() {
            warn!(lanes = self.per_lane.len(), "count index empty; reinitialising all lanes at zero");
            self.reset();
        }

        let (lowest, lane) = match self.buckets.first_entry() {
            Some(mut entry) => {
                let lowest = *entry.key();
                let lane = entry.get_mut().pop_first();
                if entry.get().is_empty() {
                    entry.remove();
                }
                (lowest, lane.unwrap_or(0))
            }
            // Only reachable with zero lanes, which construction rejects
            None => (0, 0),
        };

        let raised = lowest.saturating_add(1);
        if let Some(count) = self.per_lane.get_mut(lane) {
            *count = raised;
        }
        self.buckets.entry(raised).or_default().insert(lane);
        lane
    }

    /// Drop one key from `lane`'s count
    pub(crate) fn release(&mut self, lane: LaneIndex) {
        let current = match self.per_lane.get(lane) {
            Some(&count) => count,
            None => {
                warn!(lane, lanes = self.per_lane.len(), "release for unknown lane ignored");
                return;
            }
        };
        if current == 0 {
            warn!(lane, "release on lane with no assigned keys ignored");
            return;
        }

        self.detach(lane, current);
        let lowered = current - 1;
        self.per_lane[lane] = lowered;
        self.buckets.entry(lowered).or_default().insert(lane);
    }

    /// Counts indexed by lane
    pub(crate) fn counts(&self) -> &[u32] {
        &self.per_lane
    }

    fn detach(&mut self, lane: LaneIndex, count: u32) {
        if let Some(lanes) = self.buckets.get_mut(&count) {
            lanes.remove(&lane);
            if lanes.is_empty() {
                self.buckets.remove(&count);
            }
        }
    }
}

#[cfg(test)]
impl CountIndex {
    fn lane_count(&self) -> usize {
        self.per_lane.len()
    }

    fn count(&self, lane: LaneIndex) -> Option<u32> {
        self.per_lane.get(lane).copied()
    }

    fn min_count(&self) -> Option<u32> {
        self.buckets.keys().next().copied()
    }

    fn total(&self) -> u64 {
        self.per_lane.iter().map(|&count| u64::from(count)).sum()
    }

    fn bucket(&self, count: u32) -> Vec<LaneIndex> {
        self.buckets
            .get(&count)
            .map(|lanes| lanes.iter().copied().collect())
            .unwrap_or_default()
    }
}
