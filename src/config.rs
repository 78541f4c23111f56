//! Engine configuration

/// What the engine does when a state's `on_enter` fails (or is cancelled)
/// after the active key has already been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnterFailurePolicy {
    /// Leave the machine in the new key with history already updated.
    /// No change notification is fired.
    #[default]
    Stay,
    /// Restore the previous key and history, then re-run `on_enter` on the
    /// previous state. Errors from that re-entry are only logged.
    Rollback,
}

/// Tunables for a [`StateMachine`](crate::StateMachine)
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Behaviour after a failed `on_enter`
    pub enter_failure: EnterFailurePolicy,
}

impl EngineConfig {
    /// Configuration with the given enter-failure policy
    pub fn with_enter_failure(mut self, policy: EnterFailurePolicy) -> Self {
        self.enter_failure = policy;
        self
    }
}
