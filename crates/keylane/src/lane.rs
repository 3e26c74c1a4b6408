//! Sequential execution lane
//!
//! A lane is one worker thread draining one FIFO queue, so everything queued
//! on a lane runs strictly one after another in enqueue order.
//!
//! Stop protocol:
//! - `stop` (graceful) closes the queue; the worker finishes what is queued
//!   and exits once the queue is empty.
//! - `halt` (forced) raises the interrupt flag, closes the queue and drains
//!   whatever is still queued back to the caller. The worker checks the flag
//!   before every task, so the task it is running finishes but nothing after it
//!   starts.
//!
//! The lane's stop state is a single atomic, so two shutdown paths racing on
//! the same lane never stop it twice.

use crate::error::{panic_message, LaneError};
use crate::task::PendingTask;
use crossbeam::channel::{self, Receiver, Sender};
use keylane_alloc::LaneIndex;
use parking_lot::{Condvar, Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, trace, warn};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const HALTED: u8 = 2;

/// Set once by the worker thread on its way out, even when unwinding
struct ExitLatch {
    exited: Mutex<bool>,
    cond: Condvar,
}

impl ExitLatch {
    fn new() -> Self {
        Self {
            exited: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.exited.lock() = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.exited.lock()
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut exited = self.exited.lock();
        while !*exited {
            if self.cond.wait_until(&mut exited, deadline).timed_out() {
                return *exited;
            }
        }
        true
    }
}

struct ExitGuard(Arc<ExitLatch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.signal();
    }
}

/// One worker thread plus its queue
pub(crate) struct Lane {
    /// Lane index
    index: LaneIndex,

    /// RUNNING, DRAINING or HALTED
    state: AtomicU8,

    /// Queue input; `None` once the lane is closed
    sender: RwLock<Option<Sender<PendingTask>>>,

    /// Second handle on the queue, used to drain it on `halt`
    backlog: Receiver<PendingTask>,

    /// Interrupt flag checked by the worker before each task
    interrupted: Arc<AtomicBool>,

    /// Worker thread handle
    worker: Mutex<Option<thread::JoinHandle<()>>>,

    /// Worker exit signal
    exit: Arc<ExitLatch>,
}

impl Lane {
    /// Start the worker thread for lane `index`
    pub(crate) fn spawn(index: LaneIndex, thread_name: &str) -> std::io::Result<Self> {
        let (sender, queue) = channel::unbounded();
        let backlog = queue.clone();
        let interrupted = Arc::new(AtomicBool::new(false));
        let exit = Arc::new(ExitLatch::new());

        let worker = {
            let interrupted = interrupted.clone();
            let guard = ExitGuard(exit.clone());
            thread::Builder::new()
                .name(format!("{}-{}", thread_name, index))
                .spawn(move || {
                    let _guard = guard;
                    Lane::run_loop(index, queue, interrupted);
                })?
        };

        Ok(Self {
            index,
            state: AtomicU8::new(RUNNING),
            sender: RwLock::new(Some(sender)),
            backlog,
            interrupted,
            worker: Mutex::new(Some(worker)),
            exit,
        })
    }

    /// Worker thread main loop
    fn run_loop(index: LaneIndex, queue: Receiver<PendingTask>, interrupted: Arc<AtomicBool>) {
        debug!(lane = index, "lane worker started");

        // recv fails once the queue is closed and empty
        while let Ok(task) = queue.recv() {
            if interrupted.load(Ordering::Acquire) {
                trace!(lane = index, key = task.key(), "lane interrupted; abandoning task");
                break;
            }

            let key = task.key();
            // Task panics are captured inside `run`; this only guards completion wake-ups
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
                warn!(
                    lane = index,
                    key,
                    message = %panic_message(payload.as_ref()),
                    "panic while completing task"
                );
            }
        }

        debug!(lane = index, "lane worker exiting");
    }

    /// Lane index
    pub(crate) fn index(&self) -> LaneIndex {
        self.index
    }

    /// Queue `task`, handing it back if the lane is closed
    pub(crate) fn enqueue(&self, task: PendingTask) -> Result<(), PendingTask> {
        let sender = self.sender.read();
        match sender.as_ref() {
            Some(sender) => sender.send(task).map_err(|err| err.into_inner()),
            None => Err(task),
        }
    }

    /// Close the queue and let the worker drain it
    pub(crate) fn stop(&self) -> Result<(), LaneError> {
        if self
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let exited_early = self.exit.is_set();
        self.sender.write().take();
        debug!(lane = self.index, "lane draining");

        if exited_early {
            return Err(LaneError::WorkerExited { lane: self.index });
        }
        Ok(())
    }

    /// Interrupt the worker, close the queue and return unexecuted tasks
    pub(crate) fn halt(&self) -> (Vec<PendingTask>, Option<LaneError>) {
        let previous = self.state.swap(HALTED, Ordering::AcqRel);
        if previous == HALTED {
            return (Vec::new(), None);
        }

        let exited_early = previous == RUNNING && self.exit.is_set();
        self.interrupted.store(true, Ordering::Release);
        self.sender.write().take();
        let drained: Vec<PendingTask> = self.backlog.try_iter().collect();
        debug!(lane = self.index, drained = drained.len(), "lane halted");

        let error = exited_early.then_some(LaneError::WorkerExited { lane: self.index });
        (drained, error)
    }

    /// True once the worker thread has exited
    pub(crate) fn is_finished(&self) -> bool {
        self.exit.is_set()
    }

    /// Wait for the worker to exit; false if `deadline` passes first
    pub(crate) fn wait_exit(&self, deadline: Instant) -> bool {
        self.exit.wait_until(deadline)
    }

    /// Join the worker thread if it has exited
    pub(crate) fn join_if_exited(&self) -> Result<(), LaneError> {
        if !self.exit.is_set() {
            return Ok(());
        }

        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => handle.join().map_err(|payload| LaneError::WorkerPanicked {
                lane: self.index,
                message: panic_message(payload.as_ref()),
            }),
            None => Ok(()),
        }
    }

    /// Number of tasks waiting in the queue
    pub(crate) fn queued(&self) -> usize {
        self.backlog.len()
    }
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("index", &self.index)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("queued", &self.queued())
            .field("finished", &self.is_finished())
            .finish()
    }
}
