//! Ordered tasks and queued work

use crate::error::{panic_message, TaskError};
use crate::handle::Completer;
use keylane_alloc::{GroupingKey, LaneIndex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// First key handed out by `unique_key`.
///
/// Keys at or above this value are reserved for `unique_key`; caller-chosen
/// grouping keys should stay below it so they never share a lane queue with
/// unordered work by accident.
pub const UNIQUE_KEY_BASE: GroupingKey = 1 << 31;

static NEXT_UNIQUE_KEY: AtomicU32 = AtomicU32::new(0);

/// Generate a process-unique grouping key from the reserved range.
///
/// Tasks submitted under distinct unique keys have no ordering relative to
/// each other. Keys wrap within `UNIQUE_KEY_BASE..=u32::MAX` after 2^31
/// allocations.
pub fn unique_key() -> GroupingKey {
    UNIQUE_KEY_BASE | (NEXT_UNIQUE_KEY.fetch_add(1, Ordering::Relaxed) & !UNIQUE_KEY_BASE)
}

/// A unit of work that knows its own ordering domain.
///
/// Tasks returning the same `ordering_key` run in submission order. A task
/// that needs no ordering stores a `unique_key()` at construction; subtasks
/// that must not be reordered with their parent reuse the parent's key.
pub trait OrderedTask: Send + 'static {
    /// Value produced on success
    type Output: Send + 'static;

    /// Error produced on failure
    type Error: Send + 'static;

    /// Grouping key of this task
    fn ordering_key(&self) -> GroupingKey;

    /// Run the task
    fn call(self) -> Result<Self::Output, Self::Error>;
}

/// A queued task that has not started.
///
/// Returned by `shutdown_now`. Running it executes the task and completes
/// its handle; dropping it completes the handle with `TaskError::Cancelled`.
pub struct PendingTask {
    key: GroupingKey,
    lane: LaneIndex,
    job: Box<dyn FnOnce() + Send>,
}

impl PendingTask {
    /// Wrap `task` so its outcome lands in `completer`
    pub(crate) fn new<F, T, E>(key: GroupingKey, lane: LaneIndex, task: F, completer: Completer<T, E>) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let job = move || {
            let outcome = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskError::Failed(err)),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(key, lane, %message, "task panicked");
                    Err(TaskError::Panicked(message))
                }
            };
            completer.complete(outcome);
        };

        Self {
            key,
            lane,
            job: Box::new(job),
        }
    }

    /// Grouping key the task was submitted under
    pub fn key(&self) -> GroupingKey {
        self.key
    }

    /// Lane the task was queued on
    pub fn lane(&self) -> LaneIndex {
        self.lane
    }

    /// Execute the task on the calling thread
    pub fn run(self) {
        (self.job)()
    }
}

impl std::fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTask")
            .field("key", &self.key)
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}
