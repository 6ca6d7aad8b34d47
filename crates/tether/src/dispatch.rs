//! The dispatch thread.
//!
//! All channel state is owned by driver tasks running on a single dedicated
//! thread with its own current-thread tokio runtime. Callbacks (command
//! handlers, channel listeners, cache waiters) always fire on this thread,
//! so handler code never needs its own locking, and blocking bridges can
//! detect when they are about to deadlock themselves by checking the
//! caller's thread identity.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Handle to the dispatch thread. Cheap to clone; valid for as long as the
/// owning [`Dispatcher`] is alive.
#[derive(Clone)]
pub struct DispatcherHandle {
    jobs: mpsc::UnboundedSender<Job>,
    rt: tokio::runtime::Handle,
    thread_id: ThreadId,
}

impl DispatcherHandle {
    /// Run `f` on the dispatch thread, after currently queued jobs.
    ///
    /// Silently dropped if the dispatcher has shut down; anything that must
    /// observe shutdown should hold channel state, not queued closures.
    pub fn invoke_later(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.jobs.send(Job::Run(Box::new(f)));
    }

    /// Spawn a future onto the dispatch thread's runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.rt.spawn(future)
    }

    /// True when called from the dispatch thread itself.
    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

/// Owns the dispatch thread. Dropping (or calling [`Dispatcher::shutdown`])
/// stops the thread after the jobs already queued have run.
pub struct Dispatcher {
    handle: DispatcherHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Start a dispatch thread named `name`.
    pub fn new(name: &str) -> io::Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dispatch_main(jobs_rx, ready_tx))?;

        let rt = ready_rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "dispatch thread failed to start")
        })?;

        let handle = DispatcherHandle {
            jobs: jobs_tx,
            rt,
            thread_id: thread.thread().id(),
        };
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &DispatcherHandle {
        &self.handle
    }

    /// Stop the dispatch thread and wait for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.handle.jobs.send(Job::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.handle.jobs.send(Job::Shutdown);
        if let Some(thread) = self.thread.take() {
            // Joining from the dispatch thread itself would deadlock.
            if thread::current().id() != thread.thread().id() {
                let _ = thread.join();
            }
        }
    }
}

fn dispatch_main(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    ready: std::sync::mpsc::Sender<tokio::runtime::Handle>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to build dispatch runtime: {e}");
            return;
        }
    };
    if ready.send(rt.handle().clone()).is_err() {
        return;
    }

    rt.block_on(async {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Run(f) => {
                    // A panicking job must not take the whole dispatch
                    // thread (and every channel on it) down with it.
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                        tracing::error!("dispatch job panicked: {}", panic_message(&panic));
                    }
                }
                Job::Shutdown => break,
            }
        }
    });
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
