use thiserror::Error;

/// Error returned when a task could not be handed to an executor.
///
/// Both variants are backpressure or teardown signals surfaced synchronously
/// to the submitter; neither is ever raised after the work was accepted.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SubmitError {
    /// Every worker is busy and the backlog queue is at capacity.
    #[error("executor backlog is full")]
    Saturated,
    /// The executor has shut down and no longer accepts work.
    #[error("executor has shut down")]
    Terminated,
}

/// Error returned by [`Task::execute`](crate::Task::execute) and
/// [`Task::execute_on`](crate::Task::execute_on).
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ExecuteError {
    /// The task is currently running.
    #[error("cannot execute task: the task is already running")]
    AlreadyRunning,
    /// The task has already run to its terminal outcome. A task can be
    /// executed only once.
    #[error("cannot execute task: the task has already been executed")]
    AlreadyExecuted,
    /// The executor rejected the submission. The task stays `Running` and
    /// cannot be resubmitted; see [`Task::execute_on`](crate::Task::execute_on).
    #[error("cannot execute task: {0}")]
    Rejected(#[from] SubmitError),
}

/// Error returned to a caller blocking on a task's outcome.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum JoinError {
    /// The task was cancelled before producing a normal result.
    #[error("the task was cancelled")]
    Cancelled,
    /// The background computation panicked. The panic payload is re-raised
    /// on the owning thread, not here.
    #[error("the background computation panicked")]
    Panicked,
    /// The wait deadline elapsed before the task produced an outcome.
    #[error("timed out waiting for the task outcome")]
    TimedOut,
    /// The result value has already been handed to the completion or
    /// cancellation hook and is no longer available to waiters.
    #[error("the result was already delivered to the owning thread")]
    Delivered,
    /// The task was torn down before its computation could run, for example
    /// because the pool was shut down with the work still queued.
    #[error("the task was dropped before producing an outcome")]
    Abandoned,
}

/// Error returned by [`Handle::post`](crate::Handle::post) once the event
/// loop has been asked to quit.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("event loop is no longer accepting messages")]
pub struct PostError(pub(crate) ());
