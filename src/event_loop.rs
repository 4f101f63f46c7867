use std::panic::resume_unwind;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{fmt, io, thread};

use crossbeam_channel::{Receiver, Sender};

use crate::error::PostError;

enum Envelope {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

struct Shared {
    // Posts are refused once unset. Checked again at delivery so that a
    // quit() discards messages that slipped in concurrently.
    accepting: AtomicBool,
    discard: AtomicBool,
}

/// A single-consumer message loop for the owning thread.
///
/// Closures posted through a [`Handle`] from any thread are run, strictly in
/// post order, by whichever thread calls [`run`](EventLoop::run). The loop
/// ends when every handle has been dropped or one of them asks it to quit.
pub struct EventLoop {
    rx: Receiver<Envelope>,
    shared: Arc<Shared>,
}

/// A cloneable, thread-safe handle for posting messages to an [`EventLoop`].
#[derive(Clone)]
pub struct Handle {
    tx: Sender<Envelope>,
    shared: Arc<Shared>,
}

// ===== impl EventLoop =====

impl EventLoop {
    /// Create an event loop together with a posting handle for it.
    pub fn new() -> (Handle, EventLoop) {
        let (tx, rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(Shared {
            accepting: AtomicBool::new(true),
            discard: AtomicBool::new(false),
        });

        let handle = Handle {
            tx,
            shared: shared.clone(),
        };

        (handle, EventLoop { rx, shared })
    }

    /// Process posted messages on the calling thread until the loop is asked
    /// to quit or the last [`Handle`] is dropped.
    ///
    /// A message that panics propagates out of this call; the loop does not
    /// absorb failures raised on the owning thread.
    pub fn run(self) {
        log::trace!("event loop running");

        let mut discarded = 0usize;

        while let Ok(envelope) = self.rx.recv() {
            match envelope {
                Envelope::Run(message) => {
                    if self.shared.discard.load(SeqCst) {
                        discarded += 1;
                        continue;
                    }

                    message();
                }
                Envelope::Quit => break,
            }
        }

        if discarded > 0 {
            log::trace!("event loop discarded {} pending messages", discarded);
        }

        log::trace!("event loop stopped");
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("EventLoop").finish()
    }
}

// ===== impl Handle =====

impl Handle {
    /// Post a closure to be run on the loop's thread, after every message
    /// posted before it.
    ///
    /// Fails once the loop has been asked to quit.
    pub fn post<F>(&self, message: F) -> Result<(), PostError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.accepting.load(SeqCst) {
            return Err(PostError(()));
        }

        self.tx
            .send(Envelope::Run(Box::new(message)))
            .map_err(|_| PostError(()))
    }

    /// Returns `true` while the loop still accepts messages.
    pub fn is_open(&self) -> bool {
        self.shared.accepting.load(SeqCst)
    }

    /// Stop the loop without processing any not-yet-delivered messages.
    ///
    /// Posts made after this call fail.
    pub fn quit(&self) {
        self.shared.accepting.store(false, SeqCst);
        self.shared.discard.store(true, SeqCst);
        let _ = self.tx.send(Envelope::Quit);
    }

    /// Stop the loop once every message already posted has been processed.
    ///
    /// Posts made after this call fail.
    pub fn quit_safely(&self) {
        self.shared.accepting.store(false, SeqCst);
        let _ = self.tx.send(Envelope::Quit);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Handle")
            .field("open", &self.is_open())
            .finish()
    }
}

// ===== impl LoopThread =====

/// A dedicated thread running an [`EventLoop`].
///
/// The thread is joined when the `LoopThread` is dropped; pending messages
/// are delivered first, and a panic raised on the loop thread is forwarded
/// to the thread performing the join.
pub struct LoopThread {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

/// Configures and spawns a [`LoopThread`].
pub struct LoopThreadBuilder {
    name: Option<String>,
    on_ready: Option<Box<dyn FnOnce() + Send>>,
}

impl LoopThread {
    /// Spawn a loop thread with default configuration.
    pub fn spawn() -> io::Result<LoopThread> {
        LoopThread::builder().spawn()
    }

    /// Returns a builder with default values.
    pub fn builder() -> LoopThreadBuilder {
        LoopThreadBuilder {
            name: None,
            on_ready: None,
        }
    }

    /// The posting handle for this thread's loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stop the loop without processing any not-yet-delivered messages.
    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Stop the loop once every message already posted has been processed.
    pub fn quit_safely(&self) {
        self.handle.quit_safely();
    }

    /// Ask the loop to quit safely and block until the thread has exited.
    pub fn join(mut self) {
        self.handle.quit_safely();
        self.wait_for_exit();
    }

    fn wait_for_exit(&mut self) {
        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit_safely();
        self.wait_for_exit();
    }
}

impl fmt::Debug for LoopThread {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("LoopThread").finish()
    }
}

// ===== impl LoopThreadBuilder =====

impl LoopThreadBuilder {
    /// Set the name of the loop thread.
    pub fn name<S: Into<String>>(mut self, val: S) -> Self {
        self.name = Some(val.into());
        self
    }

    /// Run `f` on the loop thread after it starts, before any message is
    /// delivered.
    pub fn on_ready<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_ready = Some(Box::new(f));
        self
    }

    /// Spawn the configured loop thread.
    pub fn spawn(self) -> io::Result<LoopThread> {
        let (handle, event_loop) = EventLoop::new();

        let mut builder = thread::Builder::new();

        if let Some(name) = self.name {
            builder = builder.name(name);
        }

        let on_ready = self.on_ready;

        let thread = builder.spawn(move || {
            if let Some(f) = on_ready {
                f();
            }

            event_loop.run();
        })?;

        Ok(LoopThread {
            handle,
            thread: Some(thread),
        })
    }
}

impl fmt::Debug for LoopThreadBuilder {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        const SOME: &&str = &"Some(_)";
        const NONE: &&str = &"None";

        fmt.debug_struct("LoopThreadBuilder")
            .field("name", &self.name)
            .field("on_ready", if self.on_ready.is_some() { SOME } else { NONE })
            .finish()
    }
}
