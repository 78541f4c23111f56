//! Error types for the state machine

use std::fmt::{self, Debug};
use thiserror::Error;

/// Error type a state hook may return. The engine hands it back untouched
/// inside [`Error::Hook`], so callers can downcast to their own type.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by [`Stateful`](crate::Stateful) hooks
pub type HookResult = std::result::Result<(), HookError>;

/// Result type alias for state machine operations
pub type Result<T, K> = std::result::Result<T, Error<K>>;

/// Lifecycle hook that was running when a failure surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// `on_enter`
    Enter,
    /// `on_update`
    Update,
    /// `on_exit`
    Exit,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Enter => f.write_str("enter"),
            HookPhase::Update => f.write_str("update"),
            HookPhase::Exit => f.write_str("exit"),
        }
    }
}

/// Errors that can occur during state machine operations
#[derive(Error, Debug)]
pub enum Error<K: Debug> {
    /// The target key has no registered state
    #[error("State {0:?} does not exist in the state machine")]
    InvalidState(K),

    /// No initial state has been set yet
    #[error("State machine not initialized")]
    NotInitialized,

    /// A state hook failed; `source` is the hook's own error
    #[error("State {state:?} {phase} hook failed: {source}")]
    Hook {
        /// State whose hook failed
        state: K,
        /// Hook that failed
        phase: HookPhase,
        /// Error returned by the hook
        #[source]
        source: HookError,
    },

    /// The cancellation token fired while a hook was running
    #[error("State {state:?} {phase} hook was cancelled")]
    Cancelled {
        /// State whose hook observed the cancellation
        state: K,
        /// Hook that was running
        phase: HookPhase,
    },

    /// A blocking entry point was called from inside a tokio runtime
    #[error("Blocking call made from inside an async runtime; use the async entry point")]
    BlockingInAsyncContext,

    /// A scheduled entry point was called with no tokio runtime available
    #[error("No tokio runtime available to schedule the operation")]
    NoRuntime,

    /// A [`StateContext`](crate::StateContext) outlived its engine
    #[error("State machine has been dropped")]
    EngineDropped,

    /// The blocking adapter could not start its runtime
    #[error("Failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl<K: Debug> Error<K> {
    /// Whether the error originated in a state hook rather than the engine
    pub fn is_hook_failure(&self) -> bool {
        matches!(self, Error::Hook { .. } | Error::Cancelled { .. })
    }

    /// The hook's own error, if this failure came from a hook
    pub fn hook_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::Hook { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
