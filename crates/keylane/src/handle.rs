//! Task handles
//!
//! Every submitted task gets a `TaskHandle` on the caller side and a
//! `Completer` travelling with the task to its lane. The completer fills the
//! shared slot exactly once; if it is dropped unfilled (the task was abandoned
//! by a forced shutdown) the handle resolves to `TaskError::Cancelled`.

use crate::error::TaskError;
use keylane_alloc::GroupingKey;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Outcome delivered through a handle
pub type TaskResult<T, E> = Result<T, TaskError<E>>;

enum Slot<T, E> {
    /// Still running or queued
    Pending(Option<Waker>),
    /// Finished, result not yet taken
    Ready(TaskResult<T, E>),
    /// Result handed to the caller
    Taken,
}

struct Completion<T, E> {
    slot: Mutex<Slot<T, E>>,
    ready: Condvar,
}

impl<T, E> Completion<T, E> {
    fn fulfil(&self, outcome: TaskResult<T, E>) {
        let waker = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Ready(outcome)) {
                Slot::Pending(waker) => waker,
                // Never filled twice; keep the first outcome
                previous => {
                    *slot = previous;
                    None
                }
            }
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn take_ready(slot: &mut Slot<T, E>) -> Option<TaskResult<T, E>> {
        if !matches!(slot, Slot::Ready(_)) {
            return None;
        }
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Create a connected handle and completer
pub(crate) fn channel<T, E>(key: GroupingKey, sequence: Option<u64>) -> (TaskHandle<T, E>, Completer<T, E>) {
    let shared = Arc::new(Completion {
        slot: Mutex::new(Slot::Pending(None)),
        ready: Condvar::new(),
    });
    let handle = TaskHandle {
        shared: shared.clone(),
        key,
        sequence,
    };
    (handle, Completer { shared: Some(shared) })
}

/// Write side of a handle, owned by the queued task
pub(crate) struct Completer<T, E> {
    shared: Option<Arc<Completion<T, E>>>,
}

impl<T, E> Completer<T, E> {
    /// Deliver the task's outcome
    pub(crate) fn complete(mut self, outcome: TaskResult<T, E>) {
        if let Some(shared) = self.shared.take() {
            shared.fulfil(outcome);
        }
    }
}

impl<T, E> Drop for Completer<T, E> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.fulfil(Err(TaskError::Cancelled));
        }
    }
}

/// Handle to the result of a submitted task.
///
/// Wait with `join`, poll with `try_join`, or `.await` it from any executor.
pub struct TaskHandle<T, E> {
    shared: Arc<Completion<T, E>>,
    key: GroupingKey,
    sequence: Option<u64>,
}

impl<T, E> TaskHandle<T, E> {
    /// Grouping key the task was submitted under
    pub fn key(&self) -> GroupingKey {
        self.key
    }

    /// Per-key sequence stamp, for tasks submitted through `submit_task`
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// True once the task has finished, failed or been cancelled
    pub fn is_finished(&self) -> bool {
        !matches!(*self.shared.slot.lock(), Slot::Pending(_))
    }

    /// Block until the task finishes
    pub fn join(self) -> TaskResult<T, E> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = Completion::take_ready(&mut slot) {
                return outcome;
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Take the result if the task has finished, otherwise give the handle back
    pub fn try_join(self) -> Result<TaskResult<T, E>, Self> {
        let outcome = Completion::take_ready(&mut self.shared.slot.lock());
        outcome.ok_or(self)
    }

    /// Wait up to `timeout` for the task to finish
    pub fn join_timeout(self, timeout: Duration) -> Result<TaskResult<T, E>, Self> {
        let deadline = Instant::now() + timeout;
        let outcome = {
            let mut slot = self.shared.slot.lock();
            loop {
                if let Some(outcome) = Completion::take_ready(&mut slot) {
                    break Some(outcome);
                }
                if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                    break Completion::take_ready(&mut slot);
                }
            }
        };
        outcome.ok_or(self)
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = TaskResult<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        if let Some(outcome) = Completion::take_ready(&mut slot) {
            return Poll::Ready(outcome);
        }
        match &mut *slot {
            Slot::Pending(waker) => {
                let stale = !matches!(waker, Some(existing) if existing.will_wake(cx.waker()));
                if stale {
                    *waker = Some(cx.waker().clone());
                }
                Poll::Pending
            }
            Slot::Ready(_) => Poll::Pending,
            Slot::Taken => panic!("TaskHandle polled after completion"),
        }
    }
}

impl<T, E> std::fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.key)
            .field("sequence", &self.sequence)
            .field("finished", &self.is_finished())
            .finish()
    }
}
