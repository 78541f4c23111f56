//! State contracts: the key bound, the lifecycle trait and the context
//! capability handed to states.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Weak;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blocking::spawn_tracked;
use crate::error::{Error, HookResult, Result};
use crate::machine::Shared;

/// Bound for state identifiers, typically a fieldless enum.
///
/// Implemented automatically for every type that satisfies it.
pub trait StateKey: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

impl<T> StateKey for T where T: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

#[async_trait]
/// Lifecycle hooks of one state.
///
/// Hooks take `&self` because a state may request its own replacement from
/// inside a hook through its [`StateContext`]; keep per-state data behind
/// interior mutability. Every hook receives a cancellation token and should
/// return promptly once it fires.
pub trait Stateful<K: StateKey>: Send + Sync {
    /// Called when the state becomes active.
    ///
    /// # Arguments
    /// * `cancel` - Token the caller may cancel to abandon the transition.
    ///
    /// # Returns
    /// `Ok(())`, or the error that aborts the transition. The error reaches
    /// the caller unchanged inside [`Error::Hook`].
    async fn on_enter(&self, cancel: &CancellationToken) -> HookResult;

    /// Called once per host tick while the state is active.
    ///
    /// # Arguments
    /// * `cancel` - Token the caller may cancel to abandon the update.
    async fn on_update(&self, _cancel: &CancellationToken) -> HookResult {
        Ok(())
    }

    /// Called before another state becomes active.
    ///
    /// # Arguments
    /// * `cancel` - Token the caller may cancel. A cancelled exit leaves the
    ///   machine in this state.
    async fn on_exit(&self, _cancel: &CancellationToken) -> HookResult {
        Ok(())
    }
}

/// Capability handed to states registered through
/// [`StateMachine::add_state_with_context`](crate::StateMachine::add_state_with_context).
///
/// It only allows requesting transitions. It holds a weak reference, so a
/// state keeping its context does not keep the engine alive.
pub struct StateContext<K: StateKey> {
    shared: Weak<Shared<K>>,
}

impl<K: StateKey> Clone for StateContext<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<K: StateKey> Debug for StateContext<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl<K: StateKey> StateContext<K> {
    pub(crate) fn new(shared: Weak<Shared<K>>) -> Self {
        Self { shared }
    }

    /// Run the full transition protocol to `key` and wait for it.
    ///
    /// Called from inside a hook this nests a transition inside the one in
    /// progress.
    pub async fn change_state(&self, key: K) -> Result<(), K> {
        let cancel = CancellationToken::new();
        self.change_state_with_cancel(key, &cancel).await
    }

    /// Like [`change_state`](Self::change_state) with a caller-supplied token
    pub async fn change_state_with_cancel(&self, key: K, cancel: &CancellationToken) -> Result<(), K> {
        let shared = self.shared.upgrade().ok_or(Error::<K>::EngineDropped)?;
        shared.change_state(key, cancel).await
    }

    /// Schedule a transition to `key` on the current tokio runtime and return
    /// immediately. Failures are reported to the engine's diagnostics sink;
    /// await the handle to observe them directly. Under a `*_blocking` call
    /// the transition completes before that call returns.
    pub fn request_change_state(&self, key: K) -> Result<JoinHandle<Result<(), K>>, K> {
        let shared = self.shared.upgrade().ok_or(Error::<K>::EngineDropped)?;
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return shared.fail(Error::NoRuntime),
        };
        Ok(spawn_tracked(&handle, async move {
            let cancel = CancellationToken::new();
            shared.change_state(key, &cancel).await
        }))
    }

    /// Whether the engine this context belongs to is still alive
    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }
}
