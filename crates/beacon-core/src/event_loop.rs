//! Thread-bound event loop.
//!
//! Each [`EventLoop`] owns one OS thread running a current-thread tokio
//! runtime. Delivery batches and consumer futures are submitted to it over an
//! unbounded channel, so batches always run contiguously on the loop thread
//! between two polls of its local tasks.

use crate::context::{Batch, Scheduler};
use crate::error::DispatchError;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Command {
    Run(Batch),
    Spawn(Task),
}

/// A single-threaded scheduler on a dedicated thread.
pub struct EventLoop {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    running: Arc<AtomicBool>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Start a new loop thread named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or the thread cannot be created.
    pub fn start(name: impl Into<String>) -> io::Result<Arc<Self>> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();

        // Marked running before the thread starts so early submissions queue
        // up instead of running on the caller.
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let loop_name = name.clone();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&runtime, async move {
                    while let Some(command) = receiver.recv().await {
                        match command {
                            Command::Run(batch) => batch.run(),
                            Command::Spawn(task) => {
                                tokio::task::spawn_local(task);
                            }
                        }
                    }
                });
                flag.store(false, Ordering::Release);
                debug!(event_loop = %loop_name, "Event loop stopped");
            })?;

        debug!(event_loop = %name, "Event loop started");
        Ok(Arc::new(Self {
            name,
            thread_id: thread.thread().id(),
            sender: Mutex::new(Some(sender)),
            running,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Get the loop name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop thread is up and accepting work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.sender.lock().is_some()
    }

    /// Run `future` as a local task on the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop has been shut down.
    pub fn spawn<F>(&self, future: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.send(Command::Spawn(Box::pin(future)))
    }

    /// Run a single closure on the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop has been shut down.
    pub fn call<F>(&self, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut batch = Batch::new();
        batch.push(Box::new(f));
        self.send(Command::Run(batch))
    }

    /// Stop accepting work, cancel pending local tasks and join the thread.
    ///
    /// Batches already submitted run before the loop exits.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!(event_loop = %self.name, "Event loop thread panicked");
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), DispatchError> {
        let sender = self.sender.lock();
        let closed = || DispatchError::Closed(self.name.clone());
        sender
            .as_ref()
            .ok_or_else(closed)?
            .send(command)
            .map_err(|_| closed())
    }
}

impl Scheduler for EventLoop {
    fn submit(&self, batch: Batch) -> Result<(), DispatchError> {
        self.send(Command::Run(batch))
    }

    /// Always true: a stopped loop must reject work with
    /// [`DispatchError::Closed`], never run it on the caller.
    fn is_active(&self) -> bool {
        true
    }

    fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
