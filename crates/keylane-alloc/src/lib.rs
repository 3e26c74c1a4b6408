//! Keylane lane allocator
//!
//! Maps arbitrary 32-bit grouping keys onto a fixed number of lanes:
//! - Fair: a new key always lands on the lane with the fewest live keys
//! - Stable: a key keeps its lane until it is evicted
//! - Bounded: least-recently-resolved keys are evicted once the map grows
//!   past `headroom × max_keys` entries
//!
//! The allocator knows nothing about tasks or threads; the dispatcher in the
//! `keylane` crate builds per-key ordering on top of it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod allocator;
mod counts;
mod lru;
mod sequence;

pub use allocator::FairLaneAllocator;

/// Caller-supplied key identifying an ordering domain
pub type GroupingKey = u32;

/// Index of a lane in `[0, lane_count)`
pub type LaneIndex = usize;

/// Default multiplier applied to `max_keys` to size the eviction bound
pub const DEFAULT_HEADROOM: u32 = 2;

/// Eviction bounds (`max_keys × headroom`) must stay below this limit
pub const MAX_TRACKED_KEYS: u64 = i32::MAX as u64 - 1;

/// Invalid construction parameters
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Lane count resolved to zero
    #[error("lane count must be positive")]
    NoLanes,

    /// `max_keys` was zero, so no key could ever stay assigned
    #[error("max_keys must be positive")]
    NoKeyCapacity,

    /// Headroom factor was zero
    #[error("headroom factor must be positive")]
    NoHeadroom,

    /// `max_keys × headroom` reaches what the bounded map can track
    #[error("max_keys {max_keys} with headroom {headroom} reaches the tracked key limit {limit}")]
    KeyBoundOverflow {
        /// Requested key capacity
        max_keys: u32,
        /// Requested headroom factor
        headroom: u32,
        /// Bound limit; accepted bounds are strictly below it
        limit: u64,
    },
}

/// Compute the eviction bound for `max_keys` and `headroom`, validating both
pub fn eviction_bound(max_keys: u32, headroom: u32) -> Result<usize, ConfigError> {
    if max_keys == 0 {
        return Err(ConfigError::NoKeyCapacity);
    }
    if headroom == 0 {
        return Err(ConfigError::NoHeadroom);
    }

    let bound = u64::from(max_keys) * u64::from(headroom);
    if bound >= MAX_TRACKED_KEYS {
        return Err(ConfigError::KeyBoundOverflow {
            max_keys,
            headroom,
            limit: MAX_TRACKED_KEYS,
        });
    }

    usize::try_from(bound).map_err(|_| ConfigError::KeyBoundOverflow {
        max_keys,
        headroom,
        limit: MAX_TRACKED_KEYS,
    })
}
