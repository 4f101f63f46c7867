use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use two_lock_queue::TrySendError;

use crate::error::SubmitError;
use crate::pool::{PoolHandle, WorkBox};

/// An executor that runs submissions one at a time, in submission order, on
/// a shared [`WorkerPool`](crate::pool::WorkerPool).
///
/// The lane owns no thread of its own: each step runs on whichever pool
/// thread is free, but at most one step is handed to the pool at a time, so
/// submissions to the same lane start strictly in FIFO order. Lanes sharing
/// a pool are independent of each other.
pub struct SerialLane {
    inner: Arc<Inner>,
}

struct Inner {
    // Pending items and the active slot share one lock; submissions and
    // completions touch both from different threads.
    lane: Mutex<LaneState>,
    pool: PoolHandle<Box<dyn WorkBox>>,
}

struct LaneState {
    pending: VecDeque<Box<dyn WorkBox>>,
    active: bool,
}

// Advances the lane when dropped, so the next pending item is scheduled
// whether the current one returned normally or panicked.
struct Advance(Arc<Inner>);

// ===== impl SerialLane =====

impl SerialLane {
    /// Create a lane that feeds the given pool.
    pub fn new(pool: PoolHandle<Box<dyn WorkBox>>) -> SerialLane {
        SerialLane {
            inner: Arc::new(Inner {
                lane: Mutex::new(LaneState {
                    pending: VecDeque::new(),
                    active: false,
                }),
                pool,
            }),
        }
    }

    /// Queue a unit of work behind every earlier submission to this lane.
    ///
    /// May be called from any thread. When the lane is idle the work is
    /// handed to the pool immediately; a saturated or terminated pool
    /// rejects the submission and the work is not queued.
    pub fn submit(&self, work: Box<dyn WorkBox>) -> Result<(), SubmitError> {
        let mut lane = self.inner.lane.lock().unwrap();

        let chain = self.inner.clone();
        let wrapped: Box<dyn WorkBox> = Box::new(move || {
            let _advance = Advance(chain);
            work.run_box();
        });

        lane.pending.push_back(wrapped);

        if !lane.active {
            if let Err(err) = self.inner.activate(&mut lane) {
                lane.pending.pop_back();
                return Err(err);
            }
        }

        Ok(())
    }

    /// Queue a closure behind every earlier submission to this lane.
    pub fn submit_fn<F>(&self, work: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(work))
    }
}

impl Clone for SerialLane {
    fn clone(&self) -> Self {
        SerialLane {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for SerialLane {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("SerialLane").finish()
    }
}

// ===== impl Inner =====

impl Inner {
    // Hand the next pending item to the pool. Callers hold the lane lock.
    fn activate(&self, lane: &mut LaneState) -> Result<(), SubmitError> {
        let next = match lane.pending.pop_front() {
            Some(next) => next,
            None => return Ok(()),
        };

        match self.pool.try_send(next) {
            Ok(()) => {
                lane.active = true;
                Ok(())
            }
            Err(TrySendError::Full(next)) => {
                lane.pending.push_front(next);
                Err(SubmitError::Saturated)
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Terminated),
        }
    }
}

impl Drop for Advance {
    fn drop(&mut self) {
        let mut lane = self.0.lane.lock().unwrap();

        lane.active = false;

        if !lane.pending.is_empty() {
            if let Err(err) = self.0.activate(&mut lane) {
                log::warn!("serial lane stalled: {}; retrying on next submission", err);
            }
        }
    }
}
