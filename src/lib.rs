//! Launch background work from an owning thread and receive progress
//! updates plus exactly one terminal outcome back on that same thread, in
//! the order the background work produced them, without managing threads or
//! synchronization directly.
//!
//! The owning thread runs an [`EventLoop`]; closures posted to its
//! [`Handle`] from any thread are delivered strictly in post order. A
//! [`Task`] packages a background computation together with hooks that run
//! on the owning thread: a pre-work hook, a progress hook, and exactly one
//! of a completion or a cancellation hook. Computations run on a bounded
//! [`pool::WorkerPool`], either directly (parallel, unordered) or through a
//! [`SerialLane`] that starts submissions strictly one at a time in FIFO
//! order while still borrowing whichever pool thread is free. The
//! [`Runtime`] bundles one pool, one default lane, and the owning loop's
//! handle into an injectable context.
//!
//! Cancellation is cooperative: [`Task::cancel`] sets a flag the
//! computation can poll through [`Reporter::is_cancelled`]. Whether a task
//! is cancelled before it was ever scheduled, while running, or after its
//! value was computed but not yet delivered, exactly one terminal hook
//! fires, exactly once.
//!
//! # Usage
//!
//! ```
//! use offthread::{EventLoop, Reporter, Runtime, Task};
//! use std::sync::mpsc;
//!
//! let (handle, event_loop) = EventLoop::new();
//! let runtime = Runtime::new(&handle);
//! let (done_tx, done_rx) = mpsc::channel();
//!
//! let task = Task::builder(|reporter: &Reporter<usize>, chunks: Vec<u64>| {
//!         let mut total = 0;
//!         for (i, chunk) in chunks.iter().enumerate() {
//!             total += chunk;
//!             reporter.publish(i + 1);
//!         }
//!         total
//!     })
//!     .on_progress(|done| println!("summed {} chunks", done))
//!     .on_complete(move |total| done_tx.send(total).unwrap())
//!     .build(&handle);
//!
//! task.execute(&runtime, vec![3, 4, 5]).unwrap();
//! task.wait().unwrap();
//!
//! // Here the owning thread doubles as the loop thread; a long-lived
//! // program would keep running instead of quitting after one task.
//! handle.quit_safely();
//! event_loop.run();
//!
//! assert_eq!(12, done_rx.recv().unwrap());
//! ```

#![deny(warnings, missing_docs, missing_debug_implementations)]

mod error;
mod event_loop;
mod outcome;
pub mod pool;
mod serial;
mod state;
mod task;

pub use error::{ExecuteError, JoinError, PostError, SubmitError};
pub use event_loop::{EventLoop, Handle, LoopThread, LoopThreadBuilder};
pub use serial::SerialLane;
pub use state::Status;
pub use task::{Executor, Reporter, Runtime, RuntimeBuilder, Task, TaskBuilder};
