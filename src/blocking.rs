//! Synchronous entry points.
//!
//! Callers without an async context pick one of two explicit flavours:
//! `*_blocking` runs the operation to completion on a private
//! current-thread runtime and returns its result, `spawn_*` schedules it on
//! the ambient tokio runtime and returns the task handle. Dropping the handle
//! makes the call fire-and-forget; failures still reach the diagnostics sink.
//!
//! Tasks scheduled while a `*_blocking` call is running (for example a state
//! calling [`StateContext::request_change_state`](crate::StateContext::request_change_state)
//! from a hook) are tracked and run to completion before the call returns,
//! since the private runtime is dropped afterwards.

use std::future::Future;

use tokio::runtime::{Builder, Handle};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::machine::StateMachine;
use crate::state::StateKey;

tokio::task_local! {
    static BLOCKING_TASKS: TaskTracker;
}

/// Spawn `task` on `handle`. Inside a `*_blocking` call the task joins that
/// call's tracker, and so does anything it spawns in turn.
pub(crate) fn spawn_tracked<F>(handle: &Handle, task: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match BLOCKING_TASKS.try_with(TaskTracker::clone) {
        Ok(tracker) => tracker.spawn_on(BLOCKING_TASKS.scope(tracker.clone(), task), handle),
        Err(_) => handle.spawn(task),
    }
}

impl<K: StateKey> StateMachine<K> {
    /// Blocking [`set_initial_state`](Self::set_initial_state)
    pub fn set_initial_state_blocking(&self, key: K) -> Result<(), K> {
        self.block_on(self.set_initial_state(key))
    }

    /// Blocking [`change_state`](Self::change_state)
    pub fn change_state_blocking(&self, key: K) -> Result<(), K> {
        self.block_on(self.change_state(key))
    }

    /// Blocking [`update`](Self::update)
    pub fn update_blocking(&self) -> Result<(), K> {
        self.block_on(self.update())
    }

    /// Blocking [`undo_last_transition`](Self::undo_last_transition)
    pub fn undo_last_transition_blocking(&self) -> Result<(), K> {
        self.block_on(self.undo_last_transition())
    }

    /// Schedule [`set_initial_state`](Self::set_initial_state) on the ambient runtime
    pub fn spawn_set_initial_state(&self, key: K) -> Result<JoinHandle<Result<(), K>>, K> {
        let machine = self.clone();
        self.schedule(async move { machine.set_initial_state(key).await })
    }

    /// Schedule [`change_state`](Self::change_state) on the ambient runtime
    pub fn spawn_change_state(&self, key: K) -> Result<JoinHandle<Result<(), K>>, K> {
        let machine = self.clone();
        self.schedule(async move { machine.change_state(key).await })
    }

    /// Schedule [`update`](Self::update) on the ambient runtime
    pub fn spawn_update(&self) -> Result<JoinHandle<Result<(), K>>, K> {
        let machine = self.clone();
        self.schedule(async move { machine.update().await })
    }

    /// Schedule [`undo_last_transition`](Self::undo_last_transition) on the ambient runtime
    pub fn spawn_undo_last_transition(&self) -> Result<JoinHandle<Result<(), K>>, K> {
        let machine = self.clone();
        self.schedule(async move { machine.undo_last_transition().await })
    }

    fn block_on<F>(&self, operation: F) -> Result<(), K>
    where
        F: Future<Output = Result<(), K>>,
    {
        // Blocking a runtime worker on its own work would deadlock
        if Handle::try_current().is_ok() {
            return self.shared.fail(Error::BlockingInAsyncContext);
        }

        let runtime = match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => return self.shared.fail(Error::Runtime(err)),
        };
        let tracker = TaskTracker::new();
        let result = runtime.block_on(BLOCKING_TASKS.scope(tracker.clone(), operation));

        // Drain work the operation scheduled before the runtime goes away
        tracker.close();
        runtime.block_on(tracker.wait());
        result
    }

    fn schedule<F>(&self, operation: F) -> Result<JoinHandle<Result<(), K>>, K>
    where
        F: Future<Output = Result<(), K>> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => Ok(spawn_tracked(&handle, operation)),
            Err(_) => self.shared.fail(Error::NoRuntime),
        }
    }
}
