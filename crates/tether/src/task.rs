//! Blocking bridge between ordinary threads and the dispatch thread.
//!
//! A [`BlockingTask`] runs a closure on the dispatch thread and lets a
//! non-dispatch thread block until that closure (or a callback it armed)
//! settles a result. The result cell is one-shot: exactly one `done` or
//! `fail` wins, a second settlement is a programming error and panics.
//!
//! Calling [`BlockingTask::get`] from the dispatch thread itself would
//! block the only thread able to produce the result, so it panics
//! immediately instead of deadlocking.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::dispatch::{panic_message, DispatcherHandle};
use crate::errors::TaskError;

enum TaskState<T> {
    Pending,
    Done(T),
    Failed(Box<dyn std::error::Error + Send + Sync>),
    Taken,
}

type RunFn<T> = Box<dyn FnMut(&Settle<T>) + Send>;

struct TaskCell<T> {
    state: Mutex<TaskState<T>>,
    cv: Condvar,
    dispatcher: DispatcherHandle,
    /// The task body. Taken out while running so a re-armed run does not
    /// re-enter it; `None` only during a run.
    run: Mutex<Option<RunFn<T>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A one-shot result produced on the dispatch thread, awaited by blocking.
pub struct BlockingTask<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T: Send + 'static> BlockingTask<T> {
    /// Schedule `run` on the dispatch thread.
    ///
    /// `run` receives a [`Settle`] it can complete immediately or stash in
    /// a callback (a command handler, a cache waiter) to complete later. It
    /// may also [`Settle::rearm`] itself to run again, which is how polling
    /// loops over not-yet-valid caches are built.
    pub fn new(
        dispatcher: &DispatcherHandle,
        run: impl FnMut(&Settle<T>) + Send + 'static,
    ) -> Self {
        let cell = Arc::new(TaskCell {
            state: Mutex::new(TaskState::Pending),
            cv: Condvar::new(),
            dispatcher: dispatcher.clone(),
            run: Mutex::new(Some(Box::new(run))),
        });
        let scheduled = Arc::clone(&cell);
        dispatcher.invoke_later(move || run_once(&scheduled));
        Self { cell }
    }

    /// Block the calling thread until the task settles or `timeout` passes.
    ///
    /// On timeout the scheduled work keeps running on the dispatch thread;
    /// only this wait gives up. A second `get` after a successful one is a
    /// programming error.
    ///
    /// # Panics
    ///
    /// Panics when called from the dispatch thread: blocking there would
    /// deadlock the thread that has to produce the result.
    pub fn get(&self, timeout: Duration) -> Result<T, TaskError> {
        assert!(
            !self.cell.dispatcher.is_dispatch_thread(),
            "BlockingTask::get called on its dispatch thread"
        );

        let guard = lock(&self.cell.state);
        let (mut guard, wait) = self
            .cell
            .cv
            .wait_timeout_while(guard, timeout, |state| matches!(state, TaskState::Pending))
            .unwrap_or_else(PoisonError::into_inner);

        match std::mem::replace(&mut *guard, TaskState::Taken) {
            TaskState::Done(value) => Ok(value),
            TaskState::Failed(e) => Err(TaskError::Failed(e)),
            TaskState::Pending => {
                debug_assert!(wait.timed_out());
                *guard = TaskState::Pending;
                Err(TaskError::TimedOut)
            }
            TaskState::Taken => panic!("BlockingTask result taken twice"),
        }
    }

    /// Whether the task has settled (successfully or not).
    pub fn is_settled(&self) -> bool {
        !matches!(*lock(&self.cell.state), TaskState::Pending)
    }
}

/// The settlement side of a [`BlockingTask`]. Clones all point at the same
/// one-shot cell.
pub struct Settle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for Settle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Send + 'static> Settle<T> {
    /// Complete the task.
    ///
    /// # Panics
    ///
    /// Panics if the task has already settled.
    pub fn done(&self, value: T) {
        let mut state = lock(&self.cell.state);
        if !matches!(*state, TaskState::Pending) {
            panic!("task completed twice");
        }
        *state = TaskState::Done(value);
        drop(state);
        self.cell.cv.notify_all();
    }

    /// Fail the task.
    ///
    /// # Panics
    ///
    /// Panics if the task has already settled.
    pub fn fail(&self, error: impl Into<Box<dyn std::error::Error + Send + Sync>>) {
        let mut state = lock(&self.cell.state);
        if !matches!(*state, TaskState::Pending) {
            panic!("task completed twice");
        }
        *state = TaskState::Failed(error.into());
        drop(state);
        self.cell.cv.notify_all();
    }

    /// Fail the task only if it is still pending. Used for panic recovery,
    /// where a settled task must keep its result.
    pub fn fail_if_pending(&self, message: &str) {
        let mut state = lock(&self.cell.state);
        if matches!(*state, TaskState::Pending) {
            *state = TaskState::Failed(message.to_string().into());
            drop(state);
            self.cell.cv.notify_all();
        }
    }

    /// A closure that re-schedules the task body. Stash it in a callback
    /// (e.g., a cache waiter) to retry once missing data arrives.
    pub fn rearm(&self) -> impl FnOnce() + Send {
        let cell = Arc::clone(&self.cell);
        move || {
            let scheduled = Arc::clone(&cell);
            cell.dispatcher.invoke_later(move || run_once(&scheduled));
        }
    }
}

fn run_once<T: Send + 'static>(cell: &Arc<TaskCell<T>>) {
    let Some(mut run) = lock(&cell.run).take() else {
        return;
    };
    let settle = Settle {
        cell: Arc::clone(cell),
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| run(&settle)));
    *lock(&cell.run) = Some(run);
    if let Err(panic) = outcome {
        settle.fail_if_pending(panic_message(&panic));
    }
}
