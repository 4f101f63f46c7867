use std::mem;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::JoinError;

/// The settled outcome of a background computation, as recorded by whichever
/// delivery path won the terminal claim.
pub(crate) enum Terminal<R> {
    /// The computation returned normally. Delivery decides between the
    /// completion and cancellation hooks based on the cancelled flag.
    Finished(R),
    /// Cancellation won before the computation produced a value. The value
    /// is present when the computation ran to completion anyway.
    Cancelled(Option<R>),
    /// The computation panicked. The payload travels in the terminal
    /// message, not here.
    Panicked,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Kind {
    Finished,
    Cancelled,
    Panicked,
}

enum CellState<R> {
    Pending,
    Ready(Terminal<R>),
    Spent(Kind),
    Abandoned,
}

/// A write-once cell that blocking waiters park on.
///
/// The terminal claimer fulfills the cell exactly once; the owning thread's
/// terminal delivery later takes the value out, leaving a tombstone that
/// still answers waiters arriving late.
pub(crate) struct OutcomeCell<R> {
    state: Mutex<CellState<R>>,
    cond: Condvar,
}

impl<R> OutcomeCell<R> {
    pub(crate) fn new() -> OutcomeCell<R> {
        OutcomeCell {
            state: Mutex::new(CellState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Record the terminal outcome and wake all waiters. A cell that is no
    /// longer pending is left untouched.
    pub(crate) fn fulfill(&self, terminal: Terminal<R>) {
        let mut state = self.state.lock().unwrap();

        if let CellState::Pending = *state {
            *state = CellState::Ready(terminal);
            self.cond.notify_all();
        }
    }

    /// Mark the cell as never going to be fulfilled and wake all waiters.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock().unwrap();

        if let CellState::Pending = *state {
            *state = CellState::Abandoned;
            self.cond.notify_all();
        }
    }

    /// Take the outcome for delivery to the hooks, waiting out the short
    /// window between the terminal message being posted and the cell being
    /// fulfilled by the same thread.
    pub(crate) fn take_when_ready(&self) -> Option<Terminal<R>> {
        let mut state = self.state.lock().unwrap();

        while let CellState::Pending = *state {
            state = self.cond.wait(state).unwrap();
        }

        let kind = match &*state {
            CellState::Ready(terminal) => terminal.kind(),
            _ => return None,
        };

        match mem::replace(&mut *state, CellState::Spent(kind)) {
            CellState::Ready(terminal) => Some(terminal),
            _ => unreachable!(),
        }
    }

    /// Block until the task has a terminal outcome.
    pub(crate) fn wait(&self) -> Result<(), JoinError> {
        let mut state = self.state.lock().unwrap();

        loop {
            match &*state {
                CellState::Pending => {}
                CellState::Ready(terminal) => return settled(terminal.kind()),
                CellState::Spent(kind) => return settled(*kind),
                CellState::Abandoned => return Err(JoinError::Abandoned),
            }

            state = self.cond.wait(state).unwrap();
        }
    }

    /// Block until the task has a terminal outcome, or `timeout` elapses.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Result<(), JoinError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        loop {
            match &*state {
                CellState::Pending => {}
                CellState::Ready(terminal) => return settled(terminal.kind()),
                CellState::Spent(kind) => return settled(*kind),
                CellState::Abandoned => return Err(JoinError::Abandoned),
            }

            let now = Instant::now();

            if now >= deadline {
                return Err(JoinError::TimedOut);
            }

            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

impl<R: Clone> OutcomeCell<R> {
    /// Block until the task finishes and return a copy of the result while
    /// delivery has not yet consumed it.
    pub(crate) fn get(&self) -> Result<R, JoinError> {
        let mut state = self.state.lock().unwrap();

        loop {
            match &*state {
                CellState::Pending => {}
                CellState::Ready(terminal) => return value_of(terminal),
                CellState::Spent(kind) => return Err(spent(*kind)),
                CellState::Abandoned => return Err(JoinError::Abandoned),
            }

            state = self.cond.wait(state).unwrap();
        }
    }

    /// Like [`get`](Self::get), additionally failing once `timeout` elapses.
    pub(crate) fn get_timeout(&self, timeout: Duration) -> Result<R, JoinError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        loop {
            match &*state {
                CellState::Pending => {}
                CellState::Ready(terminal) => return value_of(terminal),
                CellState::Spent(kind) => return Err(spent(*kind)),
                CellState::Abandoned => return Err(JoinError::Abandoned),
            }

            let now = Instant::now();

            if now >= deadline {
                return Err(JoinError::TimedOut);
            }

            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

impl<R> Terminal<R> {
    fn kind(&self) -> Kind {
        match self {
            Terminal::Finished(_) => Kind::Finished,
            Terminal::Cancelled(_) => Kind::Cancelled,
            Terminal::Panicked => Kind::Panicked,
        }
    }
}

fn settled(kind: Kind) -> Result<(), JoinError> {
    match kind {
        Kind::Finished => Ok(()),
        Kind::Cancelled => Err(JoinError::Cancelled),
        Kind::Panicked => Err(JoinError::Panicked),
    }
}

fn spent(kind: Kind) -> JoinError {
    match kind {
        Kind::Finished => JoinError::Delivered,
        Kind::Cancelled => JoinError::Cancelled,
        Kind::Panicked => JoinError::Panicked,
    }
}

fn value_of<R: Clone>(terminal: &Terminal<R>) -> Result<R, JoinError> {
    match terminal {
        Terminal::Finished(value) => Ok(value.clone()),
        Terminal::Cancelled(_) => Err(JoinError::Cancelled),
        Terminal::Panicked => Err(JoinError::Panicked),
    }
}
