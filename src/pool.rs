//! The bounded worker pool every executor in this crate runs on.
//!
//! The pool keeps a core set of threads alive, grows up to a maximum size
//! while the backlog queue is full, and rejects submissions once both the
//! maximum size and the backlog capacity are exhausted. Rejection is a
//! backpressure signal surfaced to the submitter, never a silent drop.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use std::{fmt, panic, thread};

use two_lock_queue::{self as mpmc, RecvTimeoutError};

pub use two_lock_queue::{SendError, SendTimeoutError, TrySendError};

/// A unit of work that runs on the pool.
///
/// A `WorkerPool` instance is pinned to a single work type. To run arbitrary
/// closures on one pool, use `Box<dyn WorkBox>` as the work type.
pub trait Work: Send + 'static {
    /// Run the work.
    fn run(self);
}

/// A version of [`Work`] usable as a trait object.
pub trait WorkBox: Send + 'static {
    /// Run the boxed work.
    fn run_box(self: Box<Self>);
}

impl<F> Work for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self) {
        (self)()
    }
}

impl<T: Sized + Work> WorkBox for T {
    fn run_box(self: Box<Self>) {
        (*self).run()
    }
}

impl Work for Box<dyn WorkBox> {
    fn run(self) {
        self.run_box()
    }
}

/// Control handle for a pool of worker threads.
///
/// Dropping every [`PoolHandle`] shuts the pool down gracefully; this handle
/// observes and drives the shutdown.
pub struct WorkerPool<T> {
    inner: Arc<Inner<T>>,
}

/// Submission handle for a [`WorkerPool`].
pub struct PoolHandle<T> {
    tx: mpmc::Sender<T>,
    inner: Arc<Inner<T>>,
}

/// Worker pool configuration.
#[derive(Debug)]
pub struct Builder {
    pool: Config,
    backlog_capacity: usize,
}

#[derive(Debug)]
struct Config {
    core_size: usize,
    max_size: usize,
    keep_alive: Option<Duration>,
    name_prefix: Option<String>,
}

struct Inner<T> {
    // The pool control state packs two fields into one atomic integer:
    //
    //   worker_count: threads permitted to start and not yet permitted to
    //                 stop; transiently differs from the live thread count
    //   lifecycle:    Running -> Stop -> Tidying -> Terminated, monotonic,
    //                 ordered so that `>=` comparisons are meaningful
    //
    // Graceful shutdown is tracked by the work queue itself (a closed queue
    // stops accepting and drains); the Stop lifecycle additionally tells
    // workers to abandon queued work. The worker that decrements the count
    // to zero after the queue closed moves the pool to Tidying, wakes
    // `await_termination` callers, and leaves it Terminated.
    control: ControlState,

    // Keeps the work queue open while no worker is running. Cloned into
    // every spawned worker.
    rx: mpmc::Receiver<T>,

    termination_mutex: Mutex<()>,
    termination_signal: Condvar,

    next_thread_id: AtomicUsize,

    config: Config,
}

struct Worker<T> {
    rx: mpmc::Receiver<T>,
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        WorkerPool {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        PoolHandle {
            tx: self.tx.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for WorkerPool<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("WorkerPool").finish()
    }
}

impl<T> fmt::Debug for PoolHandle<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PoolHandle").finish()
    }
}

// ===== impl Builder =====

impl Builder {
    /// Returns a builder with default values.
    ///
    /// The defaults size the pool for background work next to an interactive
    /// thread: core size `cpus + 1`, maximum size `2 * cpus + 1`, a one
    /// second keep-alive for threads beyond the core size, and a backlog of
    /// 128 queued work items.
    pub fn new() -> Builder {
        let cpus = num_cpus::get();

        Builder {
            pool: Config {
                core_size: cpus + 1,
                max_size: 2 * cpus + 1,
                keep_alive: Some(Duration::from_secs(1)),
                name_prefix: None,
            },
            backlog_capacity: 128,
        }
    }

    /// Set the number of threads to keep in the pool even when idle.
    pub fn core_size(mut self, val: usize) -> Self {
        self.pool.core_size = val;
        self
    }

    /// Set the maximum number of threads the pool may grow to while the
    /// backlog is full.
    pub fn max_size(mut self, val: usize) -> Self {
        self.pool.max_size = val;
        self
    }

    /// Set how long a thread beyond the core size waits for work before
    /// exiting.
    pub fn keep_alive(mut self, val: Duration) -> Self {
        self.pool.keep_alive = Some(val);
        self
    }

    /// Set the capacity of the backlog queue.
    pub fn backlog_capacity(mut self, val: usize) -> Self {
        self.backlog_capacity = val;
        self
    }

    /// Set the name prefix of threads spawned by the pool.
    ///
    /// Threads are named by appending a counter to the prefix, so a prefix
    /// of `worker-` yields `worker-1`, `worker-2`, and so on.
    pub fn name_prefix<S: Into<String>>(mut self, val: S) -> Self {
        self.pool.name_prefix = Some(val.into());
        self
    }

    /// Build the configured worker pool.
    pub fn build<T: Work>(self) -> (PoolHandle<T>, WorkerPool<T>) {
        assert!(self.pool.core_size >= 1, "at least one thread required");
        assert!(
            self.pool.core_size <= self.pool.max_size,
            "`core_size` cannot be greater than `max_size`"
        );
        assert!(self.backlog_capacity >= 1, "backlog requires capacity");

        let (tx, rx) = mpmc::channel(self.backlog_capacity);

        let inner = Arc::new(Inner {
            control: ControlState::new(Lifecycle::Running),
            rx,
            termination_mutex: Mutex::new(()),
            termination_signal: Condvar::new(),
            next_thread_id: AtomicUsize::new(1),
            config: self.pool,
        });

        let handle = PoolHandle {
            tx,
            inner: inner.clone(),
        };

        (handle, WorkerPool { inner })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

// ===== impl WorkerPool =====

impl<T: Work> WorkerPool<T> {
    /// Initiate an orderly shutdown.
    ///
    /// Work already queued is executed, but no new work is accepted. Use
    /// [`await_termination`](Self::await_termination) to wait for queued
    /// work to complete.
    pub fn shutdown(&self) {
        self.inner.rx.close();
        self.inner.finalize_if_idle();
    }

    /// Shut down as fast as possible.
    ///
    /// No new work is accepted and queued work is discarded. Workers finish
    /// the item they are currently running.
    pub fn shutdown_now(&self) {
        self.inner.rx.close();

        if self.inner.control.try_transition_to_stop() {
            while self.inner.rx.recv().is_ok() {}
        }

        self.inner.finalize_if_idle();
    }

    /// Returns `true` if the pool is shutting down but has not yet
    /// terminated.
    pub fn is_terminating(&self) -> bool {
        !self.inner.rx.is_open() && !self.is_terminated()
    }

    /// Returns `true` once every worker has exited after a shutdown.
    pub fn is_terminated(&self) -> bool {
        self.inner.control.load().is_terminated()
    }

    /// Block the calling thread until the pool has terminated.
    pub fn await_termination(&self) {
        let mut lock = self.inner.termination_mutex.lock().unwrap();

        while !self.inner.control.load().is_terminated() {
            lock = self.inner.termination_signal.wait(lock).unwrap();
        }
    }

    /// The current number of worker threads.
    pub fn size(&self) -> usize {
        self.inner.control.load().worker_count()
    }

    /// The current number of queued work items.
    pub fn queued(&self) -> usize {
        self.inner.rx.len()
    }
}

// ===== impl PoolHandle =====

impl<T: Work> PoolHandle<T> {
    /// Submit work, blocking while the backlog is full.
    pub fn send(&self, work: T) -> Result<(), SendError<T>> {
        match self.try_send(work) {
            Ok(_) => Ok(()),
            Err(TrySendError::Disconnected(work)) => Err(SendError(work)),
            Err(TrySendError::Full(work)) => {
                // At capacity with every thread spawned; wait for room.
                self.tx.send(work)
            }
        }
    }

    /// Submit work, blocking for at most `timeout` while the backlog is
    /// full.
    pub fn send_timeout(&self, work: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        match self.try_send(work) {
            Ok(_) => Ok(()),
            Err(TrySendError::Disconnected(work)) => Err(SendTimeoutError::Disconnected(work)),
            Err(TrySendError::Full(work)) => self.tx.send_timeout(work, timeout),
        }
    }

    /// Submit work, returning immediately if the pool is saturated.
    ///
    /// Saturation means the backlog is full and the pool has already grown
    /// to its maximum size; the work is handed back in the error.
    pub fn try_send(&self, work: T) -> Result<(), TrySendError<T>> {
        match self.tx.try_send(work) {
            Ok(_) => {
                // Make sure the core threads are running.
                let state = self.inner.control.load();

                if state.worker_count() < self.inner.config.core_size {
                    let _ = self.inner.add_worker(None, &self.inner);
                }

                Ok(())
            }
            Err(TrySendError::Disconnected(work)) => Err(TrySendError::Disconnected(work)),
            Err(TrySendError::Full(work)) => {
                // Try to grow the pool past its core size.
                match self.inner.add_worker(Some(work), &self.inner) {
                    Ok(_) => Ok(()),
                    Err(work) => Err(TrySendError::Full(work.unwrap())),
                }
            }
        }
    }
}

impl PoolHandle<Box<dyn WorkBox>> {
    /// Submit a closure, blocking while the backlog is full.
    pub fn send_fn<F>(&self, work: F) -> Result<(), SendError<Box<dyn WorkBox>>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Box::new(work))
    }

    /// Submit a closure, returning immediately if the pool is saturated.
    pub fn try_send_fn<F>(&self, work: F) -> Result<(), TrySendError<Box<dyn WorkBox>>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_send(Box::new(work))
    }
}

// ===== impl Inner =====

impl<T: Work> Inner<T> {
    fn add_worker(&self, work: Option<T>, arc: &Arc<Inner<T>>) -> Result<(), Option<T>> {
        let core = work.is_none();
        let mut state = self.control.load();

        'retry: loop {
            let lifecycle = state.lifecycle();

            if lifecycle >= Lifecycle::Stop {
                return Err(work);
            }

            loop {
                let wc = state.worker_count();

                let target = if core {
                    self.config.core_size
                } else {
                    self.config.max_size
                };

                if wc >= MAX_WORKERS || wc >= target {
                    return Err(work);
                }

                state = match self.control.compare_and_inc_worker_count(state) {
                    Ok(_) => break 'retry,
                    Err(state) => state,
                };

                if state.lifecycle() != lifecycle {
                    continue 'retry;
                }

                // CAS failed on a worker_count change; retry the inner loop.
            }
        }

        let worker = Worker {
            rx: self.rx.clone(),
            inner: arc.clone(),
        };

        worker.spawn(work);

        Ok(())
    }

    fn finalize_if_idle(&self) {
        if self.control.load().worker_count() == 0 {
            self.finalize_pool();
        }
    }

    fn finalize_pool(&self) {
        if self.control.try_transition_to_tidying() {
            self.control.transition_to_terminated();
            self.termination_signal.notify_all();
        }
    }
}

// ===== impl Worker =====

impl<T: Work> Worker<T> {
    fn spawn(self, initial_work: Option<T>) {
        let mut builder = thread::Builder::new();

        if let Some(ref name_prefix) = self.inner.config.name_prefix {
            let id = self.inner.next_thread_id.fetch_add(1, Relaxed);
            builder = builder.name(format!("{}{}", name_prefix, id));
        }

        builder.spawn(move || self.run(initial_work)).unwrap();
    }

    fn run(mut self, mut initial_work: Option<T>) {
        use std::panic::AssertUnwindSafe;

        log::trace!("pool worker started");

        while let Some(work) = self.next_work(initial_work.take()) {
            // `Work` is `Send + 'static`, which is essentially unwind safe.
            if panic::catch_unwind(AssertUnwindSafe(move || work.run())).is_err() {
                log::warn!("pool worker caught a panicking work item");
            }
        }

        log::trace!("pool worker exiting");
    }

    // Gets the next work item, blocking if necessary. Returns None when the
    // worker should exit.
    fn next_work(&mut self, mut work: Option<T>) -> Option<T> {
        let mut timed_out = false;
        let core_size = self.inner.config.core_size;

        loop {
            let state = self.inner.control.load();

            if state.lifecycle() >= Lifecycle::Stop {
                // Queued work is no longer processed; exit the worker.
                self.decrement_worker_count();
                return None;
            }

            if work.is_some() {
                break;
            }

            let wc = state.worker_count();

            // Threads beyond the core size wait with a deadline and exit on
            // expiry; core threads wait indefinitely.
            let timeout = if wc > core_size {
                self.inner.config.keep_alive
            } else {
                None
            };

            if wc > self.inner.config.max_size || (timeout.is_some() && timed_out) {
                // Only let the last thread exit once the queue is empty.
                if wc > 1 || self.rx.len() == 0 {
                    if self.inner.control.compare_and_dec_worker_count(state) {
                        // The lifecycle was checked above and the queue has
                        // not been observed empty after the decrement, so
                        // this exit can never be the terminating one.
                        return None;
                    }

                    continue;
                }
            }

            match self.recv_work(timeout) {
                Ok(w) => {
                    // Re-check the lifecycle before running: the pool may
                    // have been stopped while this worker was blocked on
                    // the queue, in which case the item is discarded.
                    work = Some(w);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Queue closed and drained; exit the worker.
                    self.decrement_worker_count();
                    return None;
                }
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                }
            }
        }

        work
    }

    fn recv_work(&self, timeout: Option<Duration>) -> Result<T, RecvTimeoutError> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        }
    }

    fn decrement_worker_count(&self) {
        let state = self.inner.control.fetch_dec_worker_count();

        if state.worker_count() == 1 && !self.rx.is_open() {
            self.inner.finalize_pool();
        }
    }
}

// ===== pool control state =====

struct ControlState {
    atomic: AtomicUsize,
}

#[derive(Copy, Clone, Eq, PartialEq)]
struct Snapshot {
    state: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
enum Lifecycle {
    Running = 0,
    Stop = 1,
    Tidying = 2,
    Terminated = 3,
}

const LIFECYCLE_BITS: usize = 3;
const LIFECYCLE_MASK: usize = 7;
const MAX_WORKERS: usize = (1 << (32 - LIFECYCLE_BITS)) - 1;

impl ControlState {
    fn new(lifecycle: Lifecycle) -> ControlState {
        ControlState {
            atomic: AtomicUsize::new(lifecycle as usize),
        }
    }

    fn load(&self) -> Snapshot {
        Snapshot {
            state: self.atomic.load(SeqCst),
        }
    }

    fn compare_and_swap(&self, expect: Snapshot, val: Snapshot) -> Result<(), Snapshot> {
        match self
            .atomic
            .compare_exchange(expect.state, val.state, SeqCst, SeqCst)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(Snapshot { state: actual }),
        }
    }

    fn compare_and_inc_worker_count(&self, expect: Snapshot) -> Result<Snapshot, Snapshot> {
        let next = Snapshot {
            state: expect.state + (1 << LIFECYCLE_BITS),
        };

        match self.compare_and_swap(expect, next) {
            Ok(()) => Ok(expect),
            Err(actual) => Err(actual),
        }
    }

    fn compare_and_dec_worker_count(&self, expect: Snapshot) -> bool {
        assert!(expect.worker_count() > 0, "worker count underflow");

        let next = Snapshot {
            state: expect.state - (1 << LIFECYCLE_BITS),
        };

        self.compare_and_swap(expect, next).is_ok()
    }

    fn fetch_dec_worker_count(&self) -> Snapshot {
        Snapshot {
            state: self.atomic.fetch_sub(1 << LIFECYCLE_BITS, SeqCst),
        }
    }

    fn try_transition_to_stop(&self) -> bool {
        let mut state = self.load();

        loop {
            if state.lifecycle() >= Lifecycle::Stop {
                return false;
            }

            let next = state.with_lifecycle(Lifecycle::Stop);

            match self.compare_and_swap(state, next) {
                Ok(()) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    // A successful transition grants the caller the right to move the pool
    // to Terminated and wake termination waiters.
    fn try_transition_to_tidying(&self) -> bool {
        let mut state = self.load();

        loop {
            if state.lifecycle() >= Lifecycle::Tidying {
                return false;
            }

            let next = state.with_lifecycle(Lifecycle::Tidying);

            match self.compare_and_swap(state, next) {
                Ok(()) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    fn transition_to_terminated(&self) {
        let mut state = self.load();

        loop {
            assert_eq!(Lifecycle::Tidying, state.lifecycle());

            let next = state.with_lifecycle(Lifecycle::Terminated);

            match self.compare_and_swap(state, next) {
                Ok(()) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

impl Snapshot {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_usize(self.state & LIFECYCLE_MASK)
    }

    fn with_lifecycle(&self, lifecycle: Lifecycle) -> Snapshot {
        Snapshot {
            state: self.state & !LIFECYCLE_MASK | lifecycle as usize,
        }
    }

    fn worker_count(&self) -> usize {
        self.state >> LIFECYCLE_BITS
    }

    fn is_terminated(&self) -> bool {
        self.lifecycle() == Lifecycle::Terminated
    }
}

impl Lifecycle {
    fn from_usize(val: usize) -> Lifecycle {
        match val {
            0 => Lifecycle::Running,
            1 => Lifecycle::Stop,
            2 => Lifecycle::Tidying,
            3 => Lifecycle::Terminated,
            _ => panic!("unexpected lifecycle value"),
        }
    }
}
