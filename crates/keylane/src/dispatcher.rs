//! Ordered dispatcher
//!
//! Routes each submitted task to a lane chosen by the allocator. Tasks that
//! share a grouping key always land on the same lane while the key stays
//! assigned, so they run one after another in submission order; tasks under
//! different keys spread over the lanes and run concurrently.
//!
//! Lanes are started lazily on first use. Two submitters racing to start the
//! same lane both build one, but only one is installed; the other is halted
//! before anything is ever queued on it.

use crate::config::DispatcherConfig;
use crate::error::{LaneError, SubmitError};
use crate::handle::{self, TaskHandle};
use crate::lane::Lane;
use crate::task::{unique_key, OrderedTask, PendingTask};
use keylane_alloc::{ConfigError, FairLaneAllocator, GroupingKey, LaneIndex};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherState {
    /// Accepting submissions
    Running,
    /// Graceful shutdown requested; some lane is still draining
    ShuttingDown,
    /// All lanes stopped, or a forced shutdown was requested
    Stopped,
}

/// Key-ordered task dispatcher over a fixed set of sequential lanes
pub struct OrderedDispatcher {
    /// Options the dispatcher was built with
    config: DispatcherConfig,

    /// Key to lane assignment
    allocator: FairLaneAllocator,

    /// Lane slots, filled on first use
    lanes: Box<[OnceCell<Lane>]>,

    /// Set by either shutdown path
    shutdown: AtomicBool,

    /// Set by `shutdown_now` only
    shutdown_now: AtomicBool,
}

impl OrderedDispatcher {
    /// Create a dispatcher expecting about `max_keys` live keys
    pub fn new(max_keys: u32) -> Result<Self, ConfigError> {
        Self::with_config(DispatcherConfig::new(max_keys))
    }

    /// Create a dispatcher from explicit options
    pub fn with_config(config: DispatcherConfig) -> Result<Self, ConfigError> {
        let lane_count = config.lane_count();
        let allocator = FairLaneAllocator::with_headroom(lane_count, config.max_keys, config.headroom)?;
        let lanes = (0..lane_count).map(|_| OnceCell::new()).collect();

        info!(
            lanes = lane_count,
            max_keys = config.max_keys,
            capacity = allocator.capacity(),
            "ordered dispatcher created"
        );

        Ok(Self {
            config,
            allocator,
            lanes,
            shutdown: AtomicBool::new(false),
            shutdown_now: AtomicBool::new(false),
        })
    }

    /// Submit `task` under `key`.
    ///
    /// Tasks sharing a key run in the order their submissions complete.
    /// Returns `SubmitError::Rejected` once shutdown has started.
    pub fn submit<F, T, E>(&self, key: GroupingKey, task: F) -> Result<TaskHandle<T, E>, SubmitError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.dispatch(key, None, task)
    }

    /// Submit `task` under a fresh key from `unique_key`.
    ///
    /// The key comes from the reserved range above `UNIQUE_KEY_BASE`, so the
    /// task never queues behind caller keys below it.
    pub fn submit_unordered<F, T, E>(&self, task: F) -> Result<TaskHandle<T, E>, SubmitError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit(unique_key(), task)
    }

    /// Submit an `OrderedTask`, stamping its handle with the next sequence for its key
    pub fn submit_task<O: OrderedTask>(&self, task: O) -> Result<TaskHandle<O::Output, O::Error>, SubmitError> {
        let key = task.ordering_key();
        // A rejected task must not consume a stamp or recreate a cleared counter
        if self.is_shutdown() {
            trace!(key, "submission rejected");
            return Err(SubmitError::Rejected { key });
        }
        let sequence = self.allocator.next_sequence(key);
        self.dispatch(key, Some(sequence), move || task.call())
    }

    /// Next per-key sequence number
    pub fn next_sequence(&self, key: GroupingKey) -> u64 {
        self.allocator.next_sequence(key)
    }

    fn dispatch<F, T, E>(
        &self,
        key: GroupingKey,
        sequence: Option<u64>,
        task: F,
    ) -> Result<TaskHandle<T, E>, SubmitError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if self.is_shutdown() {
            trace!(key, "submission rejected");
            return Err(SubmitError::Rejected { key });
        }

        let index = self.allocator.resolve(key);
        let lane = self.lane(index)?;

        // Shutdown may have passed over this slot before the lane was installed
        if self.is_shutdown() {
            self.retire(lane);
            trace!(key, lane = index, "submission rejected");
            return Err(SubmitError::Rejected { key });
        }

        let (handle, completer) = handle::channel(key, sequence);
        let pending = PendingTask::new(key, index, task, completer);
        match lane.enqueue(pending) {
            Ok(()) => Ok(handle),
            Err(_rejected) => {
                trace!(key, lane = index, "lane closed; submission rejected");
                Err(SubmitError::Rejected { key })
            }
        }
    }

    /// Get lane `index`, starting it if needed
    fn lane(&self, index: LaneIndex) -> Result<&Lane, SubmitError> {
        if let Some(lane) = self.lanes[index].get() {
            return Ok(lane);
        }

        let lane = Lane::spawn(index, &self.config.thread_name)
            .map_err(|source| SubmitError::LaneSpawn { lane: index, source })?;
        Ok(self.install(index, lane))
    }

    /// Install `lane` in slot `index` unless another submitter got there first.
    ///
    /// The losing lane is halted before anything is queued on it.
    fn install(&self, index: LaneIndex, lane: Lane) -> &Lane {
        match self.lanes[index].try_insert(lane) {
            Ok(installed) => {
                debug!(lane = index, "lane created");
                installed
            }
            Err((installed, redundant)) => {
                trace!(lane = index, "lost lane creation race; halting redundant worker");
                redundant.halt();
                installed
            }
        }
    }

    /// Stop a lane found running after shutdown started
    fn retire(&self, lane: &Lane) {
        if self.shutdown_now.load(Ordering::SeqCst) {
            if let (_, Some(err)) = lane.halt() {
                warn!(lane = lane.index(), error = %err, "late lane failed to stop cleanly");
            }
        } else if let Err(err) = lane.stop() {
            warn!(lane = lane.index(), error = %err, "late lane failed to stop cleanly");
        }
    }

    fn created_lanes(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.iter().filter_map(OnceCell::get)
    }

    /// Stop accepting tasks and let every lane finish its queue.
    ///
    /// Does not wait; pair with `await_termination`. Calling it again, or
    /// after `shutdown_now`, does nothing and returns no errors.
    pub fn shutdown(&self) -> Vec<LaneError> {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Vec::new();
        }

        info!(active_lanes = self.active_lanes(), "dispatcher shutting down");
        let errors: Vec<LaneError> = self.created_lanes().filter_map(|lane| lane.stop().err()).collect();
        self.allocator.clear();
        errors
    }

    /// Stop accepting tasks, interrupt every lane and return what never ran.
    ///
    /// Running tasks finish; queued tasks come back in lane order, FIFO within
    /// a lane. Calling it again returns nothing.
    pub fn shutdown_now(&self) -> (Vec<PendingTask>, Vec<LaneError>) {
        if self
            .shutdown_now
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return (Vec::new(), Vec::new());
        }
        self.shutdown.store(true, Ordering::SeqCst);

        info!(active_lanes = self.active_lanes(), "dispatcher shutting down now");
        self.allocator.clear();

        let mut pending = Vec::new();
        let mut errors = Vec::new();
        for lane in self.created_lanes() {
            let (drained, error) = lane.halt();
            pending.extend(drained);
            errors.extend(error);
        }
        debug!(pending = pending.len(), "collected unexecuted tasks");
        (pending, errors)
    }

    /// True once either shutdown path has started
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> DispatcherState {
        if !self.is_shutdown() {
            DispatcherState::Running
        } else if self.shutdown_now.load(Ordering::SeqCst) || self.created_lanes().all(Lane::is_finished) {
            DispatcherState::Stopped
        } else {
            DispatcherState::ShuttingDown
        }
    }

    /// Wait up to `timeout` for every started lane's worker to exit
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.created_lanes().all(|lane| lane.wait_exit(deadline))
    }

    /// Join worker threads that have exited, collecting abnormal exits
    pub fn join_workers(&self) -> Vec<LaneError> {
        self.created_lanes()
            .filter_map(|lane| lane.join_if_exited().err())
            .collect()
    }

    /// Number of lanes
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Number of lanes started so far
    pub fn active_lanes(&self) -> usize {
        self.created_lanes().count()
    }

    /// Key to lane allocator
    pub fn allocator(&self) -> &FairLaneAllocator {
        &self.allocator
    }

    /// Options the dispatcher was built with
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

impl Drop for OrderedDispatcher {
    fn drop(&mut self) {
        for err in self.shutdown() {
            warn!(error = %err, "lane failed to stop cleanly");
        }
    }
}

impl std::fmt::Debug for OrderedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedDispatcher")
            .field("lanes", &self.lane_count())
            .field("active_lanes", &self.active_lanes())
            .field("state", &self.state())
            .field("allocator", &self.allocator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_LANES;
    use crate::error::TaskError;
    use crate::task::UNIQUE_KEY_BASE;
    use parking_lot::Mutex;
    use std::sync::{mpsc, Arc};

    fn dispatcher(lanes: usize) -> OrderedDispatcher {
        OrderedDispatcher::with_config(DispatcherConfig::new(16).with_lanes(lanes)).unwrap()
    }

    #[test]
    fn test_invalid_config() {
        assert_eq!(OrderedDispatcher::new(0).unwrap_err(), ConfigError::NoKeyCapacity);
        let config = DispatcherConfig::new(8).with_lanes(0);
        assert_eq!(OrderedDispatcher::with_config(config).unwrap_err(), ConfigError::NoLanes);
    }

    #[test]
    fn test_lanes_start_lazily() {
        let d = dispatcher(4);
        assert_eq!(d.lane_count(), 4);
        assert_eq!(d.active_lanes(), 0);

        let handle = d.submit(1, || Ok::<_, ()>(1)).unwrap();
        assert_eq!(handle.join().unwrap(), 1);
        assert_eq!(d.active_lanes(), 1);
    }

    #[test]
    fn test_same_key_runs_in_order() {
        let d = dispatcher(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..500)
            .map(|i| {
                let seen = seen.clone();
                d.submit(7, move || {
                    seen.lock().push(i);
                    Ok::<_, ()>(())
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*seen.lock(), (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_distinct_keys_use_distinct_lanes() {
        let d = dispatcher(3);
        for key in 0..3 {
            d.submit(key, || Ok::<_, ()>(())).unwrap().join().unwrap();
        }
        assert_eq!(d.active_lanes(), 3);
        assert_eq!(d.allocator().snapshot_counts(), vec![1, 1, 1]);
    }

    #[test]
    fn test_failure_does_not_block_key() {
        let d = dispatcher(2);
        let failed = d.submit(1, || Err::<u32, _>("nope")).unwrap();
        let next = d.submit(1, || Ok::<u32, &str>(2)).unwrap();
        assert_eq!(failed.join().unwrap_err().into_failure(), Some("nope"));
        assert_eq!(next.join().unwrap(), 2);
    }

    #[test]
    fn test_panic_does_not_block_key() {
        let d = dispatcher(1);
        let bad = d.submit(1, || -> Result<u32, ()> { panic!("boom") }).unwrap();
        let good = d.submit(1, || Ok::<u32, ()>(3)).unwrap();
        assert!(matches!(bad.join(), Err(TaskError::Panicked(_))));
        assert_eq!(good.join().unwrap(), 3);
    }

    #[test]
    fn test_submit_task_stamps_sequence() {
        struct Echo(u32, u32);
        impl OrderedTask for Echo {
            type Output = u32;
            type Error = ();
            fn ordering_key(&self) -> GroupingKey {
                self.0
            }
            fn call(self) -> Result<u32, ()> {
                Ok(self.1)
            }
        }

        let d = dispatcher(2);
        let handles: Vec<_> = (0..3).map(|i| d.submit_task(Echo(9, i)).unwrap()).collect();
        let sequences: Vec<_> = handles.iter().map(|h| h.sequence()).collect();
        assert_eq!(sequences, vec![Some(1), Some(2), Some(3)]);
        assert!(handles.iter().all(|h| h.key() == 9));

        let other = d.submit_task(Echo(10, 0)).unwrap();
        assert_eq!(other.sequence(), Some(1));
        assert_eq!(d.next_sequence(9), 4);
    }

    #[test]
    fn test_redundant_lane_never_runs_tasks() {
        let d = dispatcher(1);
        let first = d.install(0, Lane::spawn(0, "winner").unwrap());
        assert_eq!(first.index(), 0);

        // A second install for the same slot keeps the first lane
        let second = d.install(0, Lane::spawn(0, "loser").unwrap());
        assert_eq!(second.index(), 0);
        assert_eq!(d.active_lanes(), 1);
        assert!(d.lane(0).is_ok());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                d.submit(1, || Ok::<_, ()>(std::thread::current().name().map(str::to_string)))
                    .unwrap()
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().as_deref(), Some("winner-0"));
        }
    }

    #[test]
    fn test_lane_count_never_exceeds_max_lanes() {
        let config = DispatcherConfig::new(16).with_max_lanes(1_000).with_lanes(250);
        let d = OrderedDispatcher::with_config(config).unwrap();
        assert_eq!(d.lane_count(), MAX_LANES);
        assert_eq!(d.allocator().lane_count(), MAX_LANES);
    }

    #[test]
    fn test_unordered_task_does_not_wait_behind_caller_key() {
        let d = dispatcher(2);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let blocked = d.submit(1, move || Ok::<_, ()>(gate_rx.recv().is_ok())).unwrap();

        let unordered = d.submit_unordered(|| Ok::<_, ()>(7)).unwrap();
        assert!(unordered.key() >= UNIQUE_KEY_BASE);
        assert_ne!(d.allocator().assignment(unordered.key()), d.allocator().assignment(1));

        let outcome = unordered.join_timeout(Duration::from_secs(5));
        assert_eq!(outcome.ok().and_then(Result::ok), Some(7));

        gate_tx.send(()).unwrap();
        assert!(blocked.join().unwrap());
    }

    #[test]
    fn test_rejected_ordered_task_takes_no_sequence() {
        struct Noop(u32);
        impl OrderedTask for Noop {
            type Output = ();
            type Error = ();
            fn ordering_key(&self) -> GroupingKey {
                self.0
            }
            fn call(self) -> Result<(), ()> {
                Ok(())
            }
        }

        let d = dispatcher(2);
        d.submit_task(Noop(4)).unwrap().join().unwrap();
        d.shutdown();

        assert!(matches!(d.submit_task(Noop(4)), Err(SubmitError::Rejected { key: 4 })));
        assert!(matches!(d.submit_task(Noop(5)), Err(SubmitError::Rejected { key: 5 })));
        // Shutdown cleared the counters and the rejections did not recreate them
        assert_eq!(d.next_sequence(4), 1);
        assert_eq!(d.next_sequence(5), 1);
    }

    #[test]
    fn test_submit_unordered_uses_fresh_keys() {
        let d = dispatcher(2);
        let a = d.submit_unordered(|| Ok::<_, ()>(1)).unwrap();
        let b = d.submit_unordered(|| Ok::<_, ()>(2)).unwrap();
        assert_ne!(a.key(), b.key());
        assert_eq!(a.join().unwrap() + b.join().unwrap(), 3);
    }

    #[test]
    fn test_shutdown_states() {
        let d = dispatcher(2);
        assert_eq!(d.state(), DispatcherState::Running);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let blocked = d.submit(1, move || Ok::<_, ()>(gate_rx.recv().is_ok())).unwrap();

        assert!(d.shutdown().is_empty());
        assert!(d.is_shutdown());
        assert_eq!(d.state(), DispatcherState::ShuttingDown);
        assert!(!d.await_termination(Duration::from_millis(10)));

        gate_tx.send(()).unwrap();
        assert!(blocked.join().unwrap());
        assert!(d.await_termination(Duration::from_secs(5)));
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert!(d.join_workers().is_empty());
    }

    #[test]
    fn test_shutdown_twice() {
        let d = dispatcher(2);
        d.submit(1, || Ok::<_, ()>(())).unwrap().join().unwrap();
        assert!(d.shutdown().is_empty());
        assert!(d.shutdown().is_empty());
        assert!(d.is_shutdown());
    }

    #[test]
    fn test_shutdown_without_lanes() {
        let d = dispatcher(4);
        assert!(d.shutdown().is_empty());
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert!(d.await_termination(Duration::from_millis(1)));
    }

    #[test]
    fn test_rejected_after_shutdown() {
        let d = dispatcher(2);
        d.shutdown();
        match d.submit(3, || Ok::<_, ()>(())) {
            Err(SubmitError::Rejected { key }) => assert_eq!(key, 3),
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
        assert_eq!(d.active_lanes(), 0);
    }

    #[test]
    fn test_shutdown_clears_allocator() {
        let d = dispatcher(2);
        d.submit(1, || Ok::<_, ()>(())).unwrap().join().unwrap();
        d.next_sequence(1);
        assert_eq!(d.allocator().key_count(), 1);

        d.shutdown();
        assert_eq!(d.allocator().key_count(), 0);
        assert_eq!(d.allocator().snapshot_counts(), vec![0, 0]);
        assert_eq!(d.next_sequence(1), 1);
    }

    #[test]
    fn test_shutdown_now_returns_pending() {
        let d = dispatcher(1);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let running = d
            .submit(1, move || {
                started_tx.send(()).unwrap();
                Ok::<_, ()>(gate_rx.recv().is_ok())
            })
            .unwrap();
        started_rx.recv().unwrap();

        let queued: Vec<_> = (0..4).map(|i| d.submit(1, move || Ok::<_, ()>(i)).unwrap()).collect();

        let (pending, errors) = d.shutdown_now();
        assert!(errors.is_empty());
        assert_eq!(pending.len(), 4);
        assert!(pending.iter().all(|task| task.key() == 1 && task.lane() == 0));
        assert_eq!(d.state(), DispatcherState::Stopped);

        let (again, _) = d.shutdown_now();
        assert!(again.is_empty());
        assert!(d.shutdown().is_empty());

        gate_tx.send(()).unwrap();
        assert!(running.join().unwrap());

        drop(pending);
        for handle in queued {
            assert!(handle.join().unwrap_err().is_cancelled());
        }
        assert!(d.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_rejected_after_shutdown_now() {
        let d = dispatcher(2);
        d.shutdown_now();
        assert!(d.is_shutdown());
        assert!(matches!(
            d.submit(1, || Ok::<_, ()>(())),
            Err(SubmitError::Rejected { key: 1 })
        ));
    }

    #[test]
    fn test_drop_drains_queued_work() {
        let d = dispatcher(1);
        let counter = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let counter = counter.clone();
                d.submit(1, move || {
                    *counter.lock() += 1;
                    Ok::<_, ()>(())
                })
                .unwrap()
            })
            .collect();
        drop(d);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 50);
    }

    #[test]
    fn test_worker_thread_names() {
        let config = DispatcherConfig::new(4).with_lanes(1).with_thread_name("orders");
        let d = OrderedDispatcher::with_config(config).unwrap();
        let name = d
            .submit(1, || Ok::<_, ()>(std::thread::current().name().map(str::to_string)))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name.as_deref(), Some("orders-0"));
    }
}
