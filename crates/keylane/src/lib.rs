//! Keylane ordered dispatcher
//!
//! Runs submitted tasks on a small, fixed set of sequential lanes while
//! preserving per-key order:
//! - Tasks submitted under the same grouping key run one at a time, in
//!   submission order
//! - Tasks under different keys run concurrently on different lanes where
//!   possible
//! - New keys go to the lane with the fewest live keys; idle keys are evicted
//!   once more than `headroom × max_keys` are tracked
//!
//! Results come back through a [`TaskHandle`], which can be joined from a
//! thread or awaited as a future.
//!
//! ```ignore
//! let dispatcher = OrderedDispatcher::new(1024)?;
//! let handle = dispatcher.submit(account_id, move || apply(update))?;
//! let outcome = handle.join();
//! dispatcher.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
mod dispatcher;
pub mod error;
mod handle;
mod lane;
mod task;

pub use config::{DispatcherConfig, DEFAULT_MAX_KEYS, MAX_LANES};
pub use dispatcher::{DispatcherState, OrderedDispatcher};
pub use error::{LaneError, SubmitError, TaskError};
pub use handle::{TaskHandle, TaskResult};
pub use task::{unique_key, OrderedTask, PendingTask, UNIQUE_KEY_BASE};

pub use keylane_alloc::{
    ConfigError, FairLaneAllocator, GroupingKey, LaneIndex, DEFAULT_HEADROOM, MAX_TRACKED_KEYS,
};
