//! Dispatcher configuration

use keylane_alloc::DEFAULT_HEADROOM;

/// Upper bound on the number of lanes a dispatcher creates
pub const MAX_LANES: usize = 100;

/// Key capacity used by `DispatcherConfig::default()`
pub const DEFAULT_MAX_KEYS: u32 = 1024;

/// Options for an `OrderedDispatcher`
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of distinct keys expected to be live at a time
    pub max_keys: u32,

    /// Multiplier applied to `max_keys` before least recently used keys are evicted
    pub headroom: u32,

    /// Cap on the lane count; values above `MAX_LANES` have no effect
    pub max_lanes: usize,

    /// Explicit lane count (None = available parallelism)
    pub lanes: Option<usize>,

    /// Worker thread name prefix; lane `i` runs on `{thread_name}-{i}`
    pub thread_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_keys: DEFAULT_MAX_KEYS,
            headroom: DEFAULT_HEADROOM,
            max_lanes: MAX_LANES,
            lanes: None,
            thread_name: "keylane-lane".to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Default options with the given key capacity
    pub fn new(max_keys: u32) -> Self {
        Self {
            max_keys,
            ..Self::default()
        }
    }

    /// Set the eviction headroom factor
    pub fn with_headroom(mut self, headroom: u32) -> Self {
        self.headroom = headroom;
        self
    }

    /// Lower the lane cap (never above `MAX_LANES`)
    pub fn with_max_lanes(mut self, max_lanes: usize) -> Self {
        self.max_lanes = max_lanes;
        self
    }

    /// Use exactly `lanes` lanes (still capped by `max_lanes` and `MAX_LANES`)
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = Some(lanes);
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Effective lane count
    pub fn lane_count(&self) -> usize {
        self.lanes
            .unwrap_or_else(num_cpus::get)
            .min(self.max_lanes)
            .min(MAX_LANES)
    }
}
