//! Builder pattern implementation for state machines

use std::sync::Arc;

use crate::config::{EngineConfig, EnterFailurePolicy};
use crate::diagnostics::{Diagnostics, TracingDiagnostics};
use crate::state::{StateContext, StateKey, Stateful};
use crate::StateMachine;

type Registration<K> = Box<dyn FnOnce(&StateMachine<K>)>;

/// Builder for constructing state machines.
///
/// Registrations are replayed in call order on the finished machine, so a
/// later `.state(..)` for the same key overwrites an earlier one exactly as
/// [`StateMachine::add_state`] would.
pub struct StateMachineBuilder<K: StateKey> {
    config: EngineConfig,
    diagnostics: Arc<dyn Diagnostics>,
    registrations: Vec<Registration<K>>,
}

impl<K: StateKey> Default for StateMachineBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StateKey> StateMachineBuilder<K> {
    /// Create a new builder logging through `tracing`
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            diagnostics: Arc::new(TracingDiagnostics),
            registrations: Vec::new(),
        }
    }

    /// Add a state to the state machine
    pub fn state<T>(mut self, key: K, state: T) -> Self
    where
        T: Stateful<K> + 'static,
    {
        self.registrations
            .push(Box::new(move |machine: &StateMachine<K>| machine.add_state(key, state)));
        self
    }

    /// Add a state built from the machine's [`StateContext`]
    pub fn state_with_context<T, F>(mut self, key: K, factory: F) -> Self
    where
        T: Stateful<K> + 'static,
        F: FnOnce(StateContext<K>) -> T + 'static,
    {
        self.registrations.push(Box::new(move |machine: &StateMachine<K>| {
            machine.add_state_with_context(key, factory)
        }));
        self
    }

    /// Guard the `from -> to` transition
    pub fn transition<F>(mut self, from: K, to: K, guard: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.registrations
            .push(Box::new(move |machine: &StateMachine<K>| machine.add_transition(from, to, guard)));
        self
    }

    /// Replace the diagnostics sink
    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Choose what happens when `on_enter` fails after the key was committed
    pub fn on_enter_failure(mut self, policy: EnterFailurePolicy) -> Self {
        self.config.enter_failure = policy;
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the state machine
    pub fn build(self) -> StateMachine<K> {
        let machine = StateMachine::with_config(self.config, self.diagnostics);
        for register in self.registrations {
            register(&machine);
        }
        machine
    }
}
