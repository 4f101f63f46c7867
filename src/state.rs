use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

/// The task control state is a single atomic integer packing the lifecycle
/// status together with three orthogonal flag bits:
///
///   status:    Pending -> Running -> Finished, monotonic
///   CANCELLED: cancellation was requested; set at most once, never cleared
///   INVOKED:   the user computation actually began running
///   TERMINAL:  the terminal delivery has been claimed by one of the two
///              delivery paths; first claim wins
///
/// Packing everything into one word lets the cancel/complete race be decided
/// by plain compare-and-swap sequences on a single location. INVOKED can
/// only be set while CANCELLED is unset, so a cancellation that observes
/// INVOKED unset knows the computation will never run and the normal
/// delivery path will never post.
pub(crate) struct AtomicState {
    atomic: AtomicUsize,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct State {
    state: usize,
}

/// Lifecycle status of a [`Task`](crate::Task).
///
/// Each status is entered at most once; a task never moves backwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Status {
    /// The task has not been executed yet.
    Pending = 0,
    /// The task has been handed to an executor and has not finished.
    Running = 1,
    /// The terminal outcome has been delivered; the task is inert.
    Finished = 2,
}

const STATUS_BITS: usize = 2;
const STATUS_MASK: usize = 0b11;
const CANCELLED: usize = 1 << STATUS_BITS;
const INVOKED: usize = 1 << (STATUS_BITS + 1);
const TERMINAL: usize = 1 << (STATUS_BITS + 2);

// ===== impl AtomicState =====

impl AtomicState {
    pub(crate) fn new() -> AtomicState {
        AtomicState {
            atomic: AtomicUsize::new(Status::Pending as usize),
        }
    }

    pub(crate) fn load(&self) -> State {
        State::load(self.atomic.load(SeqCst))
    }

    fn compare_and_swap(&self, expect: State, val: State) -> Result<(), State> {
        match self
            .atomic
            .compare_exchange(expect.state, val.state, SeqCst, SeqCst)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(State::load(actual)),
        }
    }

    /// Attempt the Pending -> Running transition.
    ///
    /// On failure the observed status is returned so the caller can report
    /// whether the task was already running or already finished.
    pub(crate) fn try_transition_to_running(&self) -> Result<(), Status> {
        let mut state = self.load();

        loop {
            if state.status() != Status::Pending {
                return Err(state.status());
            }

            let next = state.with_status(Status::Running);

            match self.compare_and_swap(state, next) {
                Ok(()) => return Ok(()),
                Err(actual) => state = actual,
            }
        }
    }

    /// Set the CANCELLED flag, returning the state observed just before.
    ///
    /// The prior snapshot is what the cancel path decides on: whether the
    /// computation was ever invoked, and whether the terminal delivery has
    /// already been claimed.
    pub(crate) fn request_cancel(&self) -> State {
        State::load(self.atomic.fetch_or(CANCELLED, SeqCst))
    }

    /// Mark the user computation as started.
    ///
    /// Fails if cancellation was requested first; in that case the
    /// computation must not run and the caller owns the cancelled-before-
    /// start delivery path (subject to the terminal claim).
    pub(crate) fn try_claim_invocation(&self) -> bool {
        let mut state = self.load();

        loop {
            if state.is_cancelled() {
                return false;
            }

            let next = State {
                state: state.state | INVOKED,
            };

            match self.compare_and_swap(state, next) {
                Ok(()) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Claim the terminal delivery. Returns `true` for exactly one caller
    /// over the lifetime of the task.
    pub(crate) fn try_claim_terminal(&self) -> bool {
        let prev = self.atomic.fetch_or(TERMINAL, SeqCst);
        prev & TERMINAL == 0
    }

    /// Enter the Finished status, preserving the flag bits.
    ///
    /// Reached from Running, or directly from Pending when a task is
    /// cancelled without ever having been executed.
    pub(crate) fn transition_to_finished(&self) {
        let mut state = self.load();

        loop {
            if state.status() == Status::Finished {
                return;
            }

            let next = state.with_status(Status::Finished);

            match self.compare_and_swap(state, next) {
                Ok(()) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

// ===== impl State =====

impl State {
    fn load(num: usize) -> State {
        State { state: num }
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_usize(self.state & STATUS_MASK)
    }

    fn with_status(&self, status: Status) -> State {
        State {
            state: self.state & !STATUS_MASK | status as usize,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state & CANCELLED != 0
    }

    pub(crate) fn is_invoked(&self) -> bool {
        self.state & INVOKED != 0
    }

    pub(crate) fn terminal_claimed(&self) -> bool {
        self.state & TERMINAL != 0
    }
}

// ===== impl Status =====

impl Status {
    fn from_usize(val: usize) -> Status {
        match val {
            0 => Status::Pending,
            1 => Status::Running,
            2 => Status::Finished,
            _ => panic!("unexpected status value"),
        }
    }
}
