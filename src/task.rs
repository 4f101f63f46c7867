use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;

use two_lock_queue::TrySendError;

use crate::error::{ExecuteError, JoinError, SubmitError};
use crate::event_loop::Handle;
use crate::outcome::{OutcomeCell, Terminal};
use crate::pool::{self, PoolHandle, WorkBox, WorkerPool};
use crate::serial::SerialLane;
use crate::state::{AtomicState, Status};

/// An execution substrate a [`Task`] can be submitted to.
///
/// Implemented by [`SerialLane`] for strict one-at-a-time execution and by
/// [`PoolHandle`] for bounded-parallel execution on the pool directly. A
/// saturated or terminated executor rejects the submission synchronously.
pub trait Executor {
    /// Hand a unit of work to the executor.
    fn execute(&self, work: Box<dyn WorkBox>) -> Result<(), SubmitError>;
}

impl Executor for SerialLane {
    fn execute(&self, work: Box<dyn WorkBox>) -> Result<(), SubmitError> {
        self.submit(work)
    }
}

impl Executor for PoolHandle<Box<dyn WorkBox>> {
    fn execute(&self, work: Box<dyn WorkBox>) -> Result<(), SubmitError> {
        self.try_send(work).map_err(|err| match err {
            TrySendError::Full(_) => SubmitError::Saturated,
            TrySendError::Disconnected(_) => SubmitError::Terminated,
        })
    }
}

type ComputeFn<P, Pr, R> = Box<dyn FnOnce(&Reporter<Pr>, P) -> R + Send>;

/// A unit of background work with progress and terminal delivery back to
/// the owning thread.
///
/// A task is built from a background computation plus optional hooks, all
/// supplied up front:
///
/// * the computation `FnOnce(&Reporter<Pr>, P) -> R` runs on a pool thread;
/// * `before_start` runs synchronously on the thread calling
///   [`execute`](Task::execute), before any background activity;
/// * `on_progress` runs on the owning thread for every value the
///   computation [`publish`](Reporter::publish)es;
/// * exactly one of `on_complete` / `on_cancelled` runs on the owning
///   thread once, after the computation returned, failed, or was never
///   entered.
///
/// The handle is cheap to clone; clones observe the same task.
pub struct Task<P, Pr, R> {
    inner: Arc<Inner<P, Pr, R>>,
}

/// Assembles a [`Task`] from its computation and hooks.
pub struct TaskBuilder<P, Pr, R> {
    compute: ComputeFn<P, Pr, R>,
    hooks: Hooks<Pr, R>,
}

/// Worker-side surface handed to the background computation.
///
/// Lets the computation publish progress values to the owning thread and
/// poll for cooperative cancellation.
pub struct Reporter<Pr> {
    sink: Box<dyn Fn(Pr) + Send + Sync>,
    cancelled: Box<dyn Fn() -> bool + Send + Sync>,
}

struct Inner<P, Pr, R> {
    state: AtomicState,
    handle: Handle,
    compute: Mutex<Option<ComputeFn<P, Pr, R>>>,
    params: Mutex<Option<P>>,
    hooks: Mutex<Hooks<Pr, R>>,
    outcome: OutcomeCell<R>,
    // The thread running the computation, registered for the duration of
    // the run so that `cancel(true)` can give parked waits a nudge.
    worker: Mutex<Option<Thread>>,
}

struct Hooks<Pr, R> {
    before: Option<Box<dyn FnOnce() + Send>>,
    progress: Option<Box<dyn FnMut(Pr) + Send>>,
    complete: Option<Box<dyn FnOnce(R) + Send>>,
    cancelled: Option<Box<dyn FnOnce(Option<R>) + Send>>,
}

// Owns the task internals between submission and execution. Dropping the
// guard without running it means the executor discarded the job (rejection
// or hard shutdown); waiters are released instead of hanging.
struct JobGuard<P, Pr, R> {
    inner: Option<Arc<Inner<P, Pr, R>>>,
}

// ===== impl Task =====

impl<P, Pr, R> Task<P, Pr, R>
where
    P: Send + 'static,
    Pr: Send + 'static,
    R: Send + 'static,
{
    /// Returns a builder for a task around the given background
    /// computation.
    pub fn builder<F>(compute: F) -> TaskBuilder<P, Pr, R>
    where
        F: FnOnce(&Reporter<Pr>, P) -> R + Send + 'static,
    {
        TaskBuilder {
            compute: Box::new(compute),
            hooks: Hooks {
                before: None,
                progress: None,
                complete: None,
                cancelled: None,
            },
        }
    }

    /// Execute the task on the runtime's default serial lane.
    ///
    /// Equivalent to `execute_on(runtime.serial(), params)`; see
    /// [`execute_on`](Task::execute_on).
    pub fn execute(&self, runtime: &Runtime, params: P) -> Result<&Self, ExecuteError> {
        self.execute_on(runtime.serial(), params)
    }

    /// Execute the task on the given executor.
    ///
    /// The `before_start` hook runs synchronously on the calling thread
    /// before the computation is submitted, so state it sets is visible to
    /// the computation. The call returns without waiting for completion.
    ///
    /// A task executes at most once. A second call fails with
    /// [`ExecuteError::AlreadyRunning`] or
    /// [`ExecuteError::AlreadyExecuted`]. If the executor rejects the
    /// submission the task stays `Running` with no way to resubmit it; the
    /// pre-work hook has already run and will not run again. Waiters on a
    /// rejected task observe [`JoinError::Abandoned`].
    pub fn execute_on<E>(&self, executor: &E, params: P) -> Result<&Self, ExecuteError>
    where
        E: Executor + ?Sized,
    {
        self.inner
            .state
            .try_transition_to_running()
            .map_err(|status| match status {
                Status::Running => ExecuteError::AlreadyRunning,
                _ => ExecuteError::AlreadyExecuted,
            })?;

        let before = self.inner.hooks.lock().unwrap().before.take();

        if let Some(f) = before {
            f();
        }

        *self.inner.params.lock().unwrap() = Some(params);

        let job = JobGuard {
            inner: Some(self.inner.clone()),
        };

        executor.execute(Box::new(move || job.run()))?;

        Ok(self)
    }

    /// Request cancellation of the task.
    ///
    /// Never blocks. Sets the cancelled flag, which suppresses further
    /// progress publishes and routes the terminal delivery to the
    /// `on_cancelled` hook. If the computation has not started yet it will
    /// never run, and the cancellation hook still fires, with no value.
    /// With `interrupt` set, a computation blocked in `thread::park` is
    /// woken so it can observe the flag; cancellation is otherwise
    /// cooperative and long computations should poll
    /// [`Reporter::is_cancelled`].
    ///
    /// Returns `false` when the request can have no effect: the terminal
    /// outcome was already produced, or cancellation was already requested.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let prev = self.inner.state.request_cancel();

        if prev.terminal_claimed() {
            return false;
        }

        if interrupt {
            if let Some(worker) = self.inner.worker.lock().unwrap().as_ref() {
                worker.unpark();
            }
        }

        if !prev.is_invoked() && self.inner.state.try_claim_terminal() {
            Inner::post_terminal(&self.inner);
            self.inner.outcome.fulfill(Terminal::Cancelled(None));
        }

        !prev.is_cancelled()
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load().is_cancelled()
    }

    /// The task's current lifecycle status.
    pub fn status(&self) -> Status {
        self.inner.state.load().status()
    }

    /// Block until the task has a terminal outcome.
    ///
    /// Returns `Ok(())` for normal completion. Must not be called on the
    /// owning thread while that thread is responsible for delivering this
    /// task's messages, as nothing would unblock it.
    pub fn wait(&self) -> Result<(), JoinError> {
        self.inner.outcome.wait()
    }

    /// Block until the task has a terminal outcome or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), JoinError> {
        self.inner.outcome.wait_timeout(timeout)
    }
}

impl<P, Pr, R> Task<P, Pr, R>
where
    P: Send + 'static,
    Pr: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Block until the task finishes and return a copy of its result.
    ///
    /// The result value itself is owned by the delivery protocol: once the
    /// owning thread has handed it to the completion or cancellation hook,
    /// this returns [`JoinError::Delivered`].
    pub fn get(&self) -> Result<R, JoinError> {
        self.inner.outcome.get()
    }

    /// Like [`get`](Task::get), additionally failing with
    /// [`JoinError::TimedOut`] once `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Result<R, JoinError> {
        self.inner.outcome.get_timeout(timeout)
    }
}

impl<P, Pr, R> Clone for Task<P, Pr, R> {
    fn clone(&self) -> Self {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<P, Pr, R> fmt::Debug for Task<P, Pr, R> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Task")
            .field("status", &self.inner.state.load().status())
            .field("cancelled", &self.inner.state.load().is_cancelled())
            .finish()
    }
}

// ===== impl TaskBuilder =====

impl<P, Pr, R> TaskBuilder<P, Pr, R>
where
    P: Send + 'static,
    Pr: Send + 'static,
    R: Send + 'static,
{
    /// Run `f` on the executing thread just before the computation is
    /// submitted.
    pub fn before_start<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.before = Some(Box::new(f));
        self
    }

    /// Run `f` on the owning thread for every published progress value.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(Pr) + Send + 'static,
    {
        self.hooks.progress = Some(Box::new(f));
        self
    }

    /// Run `f` on the owning thread with the computation's result, unless
    /// the task was cancelled.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(R) + Send + 'static,
    {
        self.hooks.complete = Some(Box::new(f));
        self
    }

    /// Run `f` on the owning thread once the task's outcome is settled as
    /// cancelled.
    ///
    /// The value is present when the computation ran to completion despite
    /// the cancellation request, and absent when it never ran.
    pub fn on_cancelled<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<R>) + Send + 'static,
    {
        self.hooks.cancelled = Some(Box::new(f));
        self
    }

    /// Build the task, binding its deliveries to the given event loop.
    pub fn build(self, handle: &Handle) -> Task<P, Pr, R> {
        Task {
            inner: Arc::new(Inner {
                state: AtomicState::new(),
                handle: handle.clone(),
                compute: Mutex::new(Some(self.compute)),
                params: Mutex::new(None),
                hooks: Mutex::new(self.hooks),
                outcome: OutcomeCell::new(),
                worker: Mutex::new(None),
            }),
        }
    }
}

impl<P, Pr, R> fmt::Debug for TaskBuilder<P, Pr, R> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("TaskBuilder").finish()
    }
}

// ===== impl Reporter =====

impl<Pr> Reporter<Pr> {
    /// Send a progress value to the owning thread's `on_progress` hook.
    ///
    /// Values are delivered in publish order, strictly before the task's
    /// terminal delivery. Publishing after cancellation was requested is a
    /// no-op.
    pub fn publish(&self, value: Pr) {
        (self.sink)(value)
    }

    /// Returns `true` once cancellation has been requested.
    ///
    /// Long computations should poll this at reasonable intervals and
    /// return early when it flips.
    pub fn is_cancelled(&self) -> bool {
        (self.cancelled)()
    }
}

impl<Pr: Send + 'static> Reporter<Pr> {
    fn for_task<P, R>(inner: &Arc<Inner<P, Pr, R>>) -> Reporter<Pr>
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let publish = inner.clone();
        let cancelled = inner.clone();

        Reporter {
            sink: Box::new(move |value: Pr| {
                if publish.state.load().is_cancelled() {
                    log::trace!("progress update suppressed after cancellation");
                    return;
                }

                let target = publish.clone();
                let posted = publish.handle.post(move || target.deliver_progress(value));

                if posted.is_err() {
                    log::warn!("progress update dropped: owning event loop is gone");
                }
            }),
            cancelled: Box::new(move || cancelled.state.load().is_cancelled()),
        }
    }
}

impl<Pr> fmt::Debug for Reporter<Pr> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Reporter").finish()
    }
}

// ===== impl Inner =====

impl<P, Pr, R> Inner<P, Pr, R>
where
    P: Send + 'static,
    Pr: Send + 'static,
    R: Send + 'static,
{
    // The computation wrapper, on a pool thread.
    fn run(inner: Arc<Self>) {
        if !inner.state.try_claim_invocation() {
            // Cancelled before the computation ever ran. Whichever of this
            // path and the cancel path claims the terminal posts it.
            if inner.state.try_claim_terminal() {
                Inner::post_terminal(&inner);
                inner.outcome.fulfill(Terminal::Cancelled(None));
            }

            return;
        }

        *inner.worker.lock().unwrap() = Some(thread::current());

        lower_thread_priority();

        let compute = inner
            .compute
            .lock()
            .unwrap()
            .take()
            .expect("computation already taken");
        let params = inner
            .params
            .lock()
            .unwrap()
            .take()
            .expect("parameters already taken");

        let reporter = Reporter::for_task(&inner);
        let result = panic::catch_unwind(AssertUnwindSafe(|| compute(&reporter, params)));

        *inner.worker.lock().unwrap() = None;

        match result {
            Ok(value) => {
                if inner.state.try_claim_terminal() {
                    Inner::post_terminal(&inner);

                    // A cancellation that landed while the computation ran
                    // settles the outcome as cancelled; the value is still
                    // carried to the cancellation hook.
                    let terminal = if inner.state.load().is_cancelled() {
                        Terminal::Cancelled(Some(value))
                    } else {
                        Terminal::Finished(value)
                    };

                    inner.outcome.fulfill(terminal);
                }
            }
            Err(payload) => {
                if inner.state.try_claim_terminal() {
                    let target = inner.clone();
                    let posted = inner.handle.post(move || {
                        target.state.transition_to_finished();
                        panic::resume_unwind(payload);
                    });

                    if posted.is_err() {
                        log::warn!(
                            "computation panic could not be surfaced: owning event loop is gone"
                        );
                    }

                    inner.outcome.fulfill(Terminal::Panicked);
                } else {
                    log::warn!("computation panicked after its outcome was settled");
                }
            }
        }
    }

    // Post the terminal message. The outcome cell is fulfilled by the
    // caller right after; delivery waits out that window.
    fn post_terminal(inner: &Arc<Self>) {
        let target = inner.clone();

        if inner.handle.post(move || target.deliver_terminal()).is_err() {
            log::warn!("task outcome dropped: owning event loop is gone");
        }
    }

    // Terminal delivery, on the owning thread. Cancellation observed here,
    // even after the computation produced a value, routes the value to the
    // cancellation hook.
    fn deliver_terminal(&self) {
        let terminal = match self.outcome.take_when_ready() {
            Some(terminal) => terminal,
            None => {
                log::warn!("terminal delivery found no outcome to deliver");
                return;
            }
        };

        match terminal {
            Terminal::Finished(value) => {
                if self.state.load().is_cancelled() {
                    self.finish_cancelled(Some(value));
                } else {
                    let hook = self.hooks.lock().unwrap().complete.take();

                    if let Some(f) = hook {
                        f(value);
                    }

                    self.state.transition_to_finished();
                }
            }
            Terminal::Cancelled(value) => self.finish_cancelled(value),
            Terminal::Panicked => {
                // Panics are re-raised by their own message, never here.
                log::warn!("panicked outcome reached value delivery");
            }
        }
    }

    fn finish_cancelled(&self, value: Option<R>) {
        let hook = self.hooks.lock().unwrap().cancelled.take();

        if let Some(f) = hook {
            f(value);
        }

        self.state.transition_to_finished();
    }

    // Progress delivery, on the owning thread. The hook is taken out for
    // the call so user code never runs under the hook lock.
    fn deliver_progress(&self, value: Pr) {
        let hook = self.hooks.lock().unwrap().progress.take();

        if let Some(mut f) = hook {
            f(value);
            self.hooks.lock().unwrap().progress = Some(f);
        }
    }
}

// ===== impl JobGuard =====

impl<P, Pr, R> JobGuard<P, Pr, R>
where
    P: Send + 'static,
    Pr: Send + 'static,
    R: Send + 'static,
{
    fn run(mut self) {
        let inner = self.inner.take().expect("job already consumed");
        Inner::run(inner);
    }
}

impl<P, Pr, R> Drop for JobGuard<P, Pr, R> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            // Dropped without running: the submission was rejected or the
            // pool discarded the job during shutdown.
            if inner.state.try_claim_terminal() {
                inner.outcome.abandon();
                log::warn!("background job dropped before it could run");
            }
        }
    }
}

// ===== impl Runtime =====

/// The execution context tasks run against.
///
/// Bundles the shared worker pool, the default serial lane feeding it, and
/// the owning loop's [`Handle`]. Construct one per owning thread and inject
/// it where tasks are executed; tests can swap in a differently sized pool
/// through [`Runtime::builder`].
pub struct Runtime {
    handle: Handle,
    pool: PoolHandle<Box<dyn WorkBox>>,
    control: WorkerPool<Box<dyn WorkBox>>,
    serial: SerialLane,
}

/// Configures and builds a [`Runtime`].
#[derive(Debug)]
pub struct RuntimeBuilder {
    pool: Option<pool::Builder>,
}

impl Runtime {
    /// Create a runtime with the default pool sizing.
    pub fn new(handle: &Handle) -> Runtime {
        Runtime::builder().build(handle)
    }

    /// Returns a builder with default values.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder { pool: None }
    }

    /// The owning loop's posting handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The bounded-parallel executor: submissions run concurrently, in no
    /// guaranteed order.
    pub fn pool(&self) -> &PoolHandle<Box<dyn WorkBox>> {
        &self.pool
    }

    /// The default serial lane: submissions start strictly in order, one at
    /// a time.
    pub fn serial(&self) -> &SerialLane {
        &self.serial
    }

    /// Create an additional serial lane on the shared pool, ordered
    /// independently of the default lane.
    pub fn new_lane(&self) -> SerialLane {
        SerialLane::new(self.pool.clone())
    }

    /// Queue a bare closure on the default serial lane.
    pub fn spawn<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.serial.submit_fn(f)
    }

    /// Shut the pool down gracefully and wait for queued work to finish.
    pub fn shutdown(self) {
        self.control.shutdown();
        self.control.await_termination();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Runtime").finish()
    }
}

impl RuntimeBuilder {
    /// Use a custom pool configuration instead of the default sizing.
    pub fn pool(mut self, builder: pool::Builder) -> Self {
        self.pool = Some(builder);
        self
    }

    /// Build the runtime, binding it to the given event loop.
    pub fn build(self, handle: &Handle) -> Runtime {
        let builder = self
            .pool
            .unwrap_or_else(|| pool::Builder::new().name_prefix("task-worker-"));

        let (pool, control) = builder.build();
        let serial = SerialLane::new(pool.clone());

        Runtime {
            handle: handle.clone(),
            pool,
            control,
            serial,
        }
    }
}

#[cfg(unix)]
fn lower_thread_priority() {
    // On Linux this applies to the calling thread only; elsewhere it may
    // cover the whole process. Best effort, failures ignored.
    unsafe {
        let _ = libc::nice(10);
    }
}

#[cfg(not(unix))]
fn lower_thread_priority() {}
