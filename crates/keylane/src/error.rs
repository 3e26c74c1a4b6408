//! Dispatcher error types

use keylane_alloc::{GroupingKey, LaneIndex};

/// A submission the dispatcher refused
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Dispatcher is shutting down or shut down
    #[error("dispatcher is shut down; rejected task for key {key}")]
    Rejected {
        /// Key of the rejected task
        key: GroupingKey,
    },

    /// The worker thread for a new lane could not be started
    #[error("failed to start worker for lane {lane}")]
    LaneSpawn {
        /// Lane that failed to start
        lane: LaneIndex,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },
}

/// Why a task did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    /// The task returned an error
    #[error("task failed: {0}")]
    Failed(E),

    /// The task panicked; the payload message is kept
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was abandoned by a forced shutdown before it ran
    #[error("task was cancelled before it ran")]
    Cancelled,
}

impl<E> TaskError<E> {
    /// The task's own error, if it returned one
    pub fn into_failure(self) -> Option<E> {
        match self {
            TaskError::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// True if the task never ran
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// An error raised while stopping one lane
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaneError {
    /// The worker thread exited before it was asked to stop
    #[error("worker for lane {lane} exited before shutdown")]
    WorkerExited {
        /// Affected lane
        lane: LaneIndex,
    },

    /// The worker thread died by panic
    #[error("worker for lane {lane} panicked: {message}")]
    WorkerPanicked {
        /// Affected lane
        lane: LaneIndex,
        /// Panic payload message
        message: String,
    },
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
