//! The state machine engine.
//!
//! A [`StateMachine`] holds one [`Stateful`] instance per key, a guard table,
//! an undo history and the active key. All of those live behind a single
//! mutex that is only held for table reads and writes, never while a hook is
//! awaited, so hooks may request further transitions through their
//! [`StateContext`].
//!
//! # Transition protocol
//! 1. Under the lock: reject unregistered targets, evaluate the guard for
//!    `(current, target)`. A guard returning `false` is logged and the call
//!    returns `Ok(())` without touching anything.
//! 2. Await `on_exit` of the current state. Failure or cancellation here
//!    leaves the machine unchanged.
//! 3. Under the lock: push the old key onto history and make `target` active.
//! 4. Await `on_enter` of the new state.
//! 5. Notify subscribers with `(old, target)`.
//!
//! Two concurrent transitions may both pass step 1 against the same active
//! key; there is no transition queue.
//!
//! # Errors
//! Most methods return [`Error<K>`]: [`Error::InvalidState`] for unknown keys,
//! [`Error::NotInitialized`] before an initial state, [`Error::Hook`] and
//! [`Error::Cancelled`] for hook failures.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, EnterFailurePolicy};
use crate::diagnostics::{Diagnostics, Level, TracingDiagnostics};
use crate::error::{Error, HookPhase, HookResult, Result};
use crate::guard::GuardTable;
use crate::history::History;
use crate::notify::{Listeners, StateChange, SubscriptionId};
use crate::state::{StateContext, StateKey, Stateful};

#[cfg(all(feature = "plantuml", debug_assertions))]
use std::collections::HashSet;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type StateRef<K> = Arc<dyn Stateful<K>>;

/// What a transition does to the history when it commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryOp {
    Push,
    Pop,
}

/// How a committed transition touched the history, so a rollback can revert it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bookkeeping {
    Pushed,
    Popped,
    Untouched,
}

pub(crate) struct Tables<K: StateKey> {
    states: HashMap<K, StateRef<K>>,
    guards: GuardTable<K>,
    history: History<K>,
    current: Option<K>,

    // One entry per distinct (from, to) pair that was committed
    #[cfg(all(feature = "plantuml", debug_assertions))]
    transition_log: HashSet<(K, K)>,
}

impl<K: StateKey> Tables<K> {
    fn new() -> Self {
        Self {
            states: HashMap::new(),
            guards: GuardTable::new(),
            history: History::new(),
            current: None,

            #[cfg(all(feature = "plantuml", debug_assertions))]
            transition_log: HashSet::new(),
        }
    }

    fn state(&self, key: &K) -> Result<StateRef<K>, K> {
        self.states
            .get(key)
            .cloned()
            .ok_or_else(|| Error::InvalidState(key.clone()))
    }

    #[cfg(all(feature = "plantuml", debug_assertions))]
    fn log_transition(&mut self, from: &K, to: &K) {
        self.transition_log.insert((from.clone(), to.clone()));
    }

    #[cfg(not(all(feature = "plantuml", debug_assertions)))]
    fn log_transition(&mut self, _from: &K, _to: &K) {}
}

/// Engine internals shared between [`StateMachine`] handles and the
/// [`StateContext`]s given to states.
pub(crate) struct Shared<K: StateKey> {
    tables: Mutex<Tables<K>>,
    listeners: Listeners<K>,
    diagnostics: Arc<dyn Diagnostics>,
    config: EngineConfig,
}

impl<K: StateKey> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, Tables<K>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, level: Level, message: &str) {
        self.diagnostics.log(level, message);
    }

    fn report(&self, error: &Error<K>) {
        self.log(Level::Error, &error.to_string());
    }

    pub(crate) fn fail<T>(&self, error: Error<K>) -> Result<T, K> {
        self.report(&error);
        Err(error)
    }

    /// Log a failure before handing it back to the caller
    fn surface<T>(&self, result: Result<T, K>) -> Result<T, K> {
        if let Err(error) = &result {
            self.report(error);
        }
        result
    }

    fn notify(&self, previous: Option<K>, current: K) {
        self.log(
            Level::Info,
            &format!("State changed from {:?} to {:?}", previous, current),
        );
        self.listeners.emit(&StateChange { previous, current });
    }

    /// Map a hook outcome to an engine result. Cancellation wins over the
    /// hook's own result.
    fn settle(state: &K, phase: HookPhase, outcome: HookResult, cancel: &CancellationToken) -> Result<(), K> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                state: state.clone(),
                phase,
            });
        }
        outcome.map_err(|source| Error::Hook {
            state: state.clone(),
            phase,
            source,
        })
    }

    pub(crate) async fn initialize(&self, key: K, cancel: &CancellationToken) -> Result<(), K> {
        let result = self.enter_initial(key, cancel).await;
        self.surface(result)
    }

    pub(crate) async fn change_state(&self, key: K, cancel: &CancellationToken) -> Result<(), K> {
        let result = self.transition(key, HistoryOp::Push, cancel).await;
        self.surface(result)
    }

    pub(crate) async fn update(&self, cancel: &CancellationToken) -> Result<(), K> {
        let result = self.update_current(cancel).await;
        self.surface(result)
    }

    pub(crate) async fn undo(&self, cancel: &CancellationToken) -> Result<(), K> {
        let target = {
            let tables = self.lock();
            match tables.history.peek() {
                Some(key) => key.clone(),
                None => {
                    self.log(Level::Warn, "No previous state to revert to");
                    return Ok(());
                }
            }
        };
        let result = self.transition(target, HistoryOp::Pop, cancel).await;
        self.surface(result)
    }

    async fn enter_initial(&self, key: K, cancel: &CancellationToken) -> Result<(), K> {
        let (state, displaced, cleared) = {
            let mut tables = self.lock();
            let state = tables.state(&key)?;
            let cleared = tables.history.clone();
            tables.history.clear();
            let displaced = tables.current.replace(key.clone());
            (state, displaced, cleared)
        };

        let entered = state.on_enter(cancel).await;
        if let Err(error) = Self::settle(&key, HookPhase::Enter, entered, cancel) {
            if self.config.enter_failure == EnterFailurePolicy::Rollback {
                let mut tables = self.lock();
                // Untouched by a nested transition: restore key and history together
                if tables.current.as_ref() == Some(&key) {
                    tables.current = displaced;
                    tables.history = cleared;
                }
            }
            return Err(error);
        }

        self.notify(None, key);
        Ok(())
    }

    /// The transition protocol. Boxed because hooks may re-enter it through
    /// a [`StateContext`].
    fn transition<'a>(
        &'a self,
        target: K,
        op: HistoryOp,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), K>> {
        Box::pin(async move {
            let (previous, from_state, to_state) = {
                let tables = self.lock();
                let to_state = tables.state(&target)?;
                let previous = tables.current.clone().ok_or(Error::<K>::NotInitialized)?;
                if !tables.guards.allows(&previous, &target) {
                    self.log(
                        Level::Warn,
                        &format!(
                            "Transition from {:?} to {:?} is not allowed by the guard",
                            previous, target
                        ),
                    );
                    return Ok(());
                }
                let from_state = tables.state(&previous)?;
                (previous, from_state, to_state)
            };

            let exited = from_state.on_exit(cancel).await;
            Self::settle(&previous, HookPhase::Exit, exited, cancel)?;

            let bookkeeping = {
                let mut tables = self.lock();
                let bookkeeping = match op {
                    HistoryOp::Push => {
                        tables.history.push(previous.clone());
                        Bookkeeping::Pushed
                    }
                    HistoryOp::Pop if tables.history.peek() == Some(&target) => {
                        tables.history.pop();
                        Bookkeeping::Popped
                    }
                    HistoryOp::Pop => Bookkeeping::Untouched,
                };
                tables.current = Some(target.clone());
                tables.log_transition(&previous, &target);
                bookkeeping
            };

            let entered = to_state.on_enter(cancel).await;
            if let Err(error) = Self::settle(&target, HookPhase::Enter, entered, cancel) {
                if self.config.enter_failure == EnterFailurePolicy::Rollback {
                    self.roll_back(&previous, &target, bookkeeping, from_state).await;
                }
                return Err(error);
            }

            self.notify(Some(previous), target);
            Ok(())
        })
    }

    async fn roll_back(&self, previous: &K, target: &K, bookkeeping: Bookkeeping, state: StateRef<K>) {
        {
            let mut tables = self.lock();
            // A nested transition already moved on from `target`
            if tables.current.as_ref() != Some(target) {
                return;
            }
            tables.current = Some(previous.clone());
            match bookkeeping {
                Bookkeeping::Pushed if tables.history.peek() == Some(previous) => {
                    tables.history.pop();
                }
                Bookkeeping::Popped => tables.history.push(target.clone()),
                _ => {}
            }
        }

        self.log(
            Level::Warn,
            &format!("Rolling back from {:?} to {:?}", target, previous),
        );

        let cancel = CancellationToken::new();
        if let Err(source) = state.on_enter(&cancel).await {
            self.log(
                Level::Error,
                &format!("State {:?} failed to re-enter during rollback: {}", previous, source),
            );
        }
    }

    async fn update_current(&self, cancel: &CancellationToken) -> Result<(), K> {
        let (key, state) = {
            let tables = self.lock();
            let key = tables.current.clone().ok_or(Error::<K>::NotInitialized)?;
            let state = tables.state(&key)?;
            (key, state)
        };

        let outcome = state.on_update(cancel).await;
        Self::settle(&key, HookPhase::Update, outcome, cancel)
    }
}

/// A generic asynchronous finite state machine.
///
/// Cloning is cheap and yields another handle to the same machine.
pub struct StateMachine<K: StateKey> {
    pub(crate) shared: Arc<Shared<K>>,
}

impl<K: StateKey> Clone for StateMachine<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: StateKey> Default for StateMachine<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StateKey> fmt::Debug for StateMachine<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.shared.lock();
        f.debug_struct("StateMachine")
            .field("current", &tables.current)
            .field("states", &tables.states.len())
            .field("guards", &tables.guards)
            .field("history", &tables.history.to_vec())
            .field("subscribers", &self.shared.listeners.len())
            .finish()
    }
}

impl<K: StateKey> StateMachine<K> {
    /// Create an empty machine logging through `tracing`
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default(), Arc::new(TracingDiagnostics))
    }

    /// Create an empty machine with explicit configuration and diagnostics sink
    pub fn with_config(config: EngineConfig, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::new()),
                listeners: Listeners::new(),
                diagnostics,
                config,
            }),
        }
    }

    /// Register `state` at `key`, replacing any previous registration.
    ///
    /// Replacing is not a lifecycle event: the old instance is dropped without
    /// `on_exit`, and the active key is left alone even if it equals `key`.
    pub fn add_state<T>(&self, key: K, state: T)
    where
        T: Stateful<K> + 'static,
    {
        self.install(key, Arc::new(state));
    }

    /// Register the state built by `factory`, which receives a
    /// [`StateContext`] it may keep to request transitions later.
    pub fn add_state_with_context<T, F>(&self, key: K, factory: F)
    where
        T: Stateful<K> + 'static,
        F: FnOnce(StateContext<K>) -> T,
    {
        // Built outside the lock so the factory may touch the context
        let state = factory(self.context());
        self.install(key, Arc::new(state));
    }

    fn install(&self, key: K, state: StateRef<K>) {
        let mut tables = self.shared.lock();
        if tables.states.contains_key(&key) {
            self.shared.log(
                Level::Warn,
                &format!("State {:?} already exists in the state machine. Overwriting.", key),
            );
        }
        tables.states.insert(key, state);
    }

    /// Install or replace the guard for `from -> to`.
    ///
    /// Neither key needs to be registered yet. The guard runs under the engine
    /// lock and must not call back into the machine.
    pub fn add_transition<F>(&self, from: K, to: K, guard: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.shared.lock().guards.insert(from, to, Arc::new(guard));
    }

    /// A transition capability for this machine
    pub fn context(&self) -> StateContext<K> {
        StateContext::new(Arc::downgrade(&self.shared))
    }

    /// Make `key` the active state: clears history, awaits `on_enter` and
    /// notifies with `previous = None`. May be called again to re-initialize;
    /// the previously active state is not exited.
    pub async fn set_initial_state(&self, key: K) -> Result<(), K> {
        let cancel = CancellationToken::new();
        self.set_initial_state_with_cancel(key, &cancel).await
    }

    /// [`set_initial_state`](Self::set_initial_state) with a caller-supplied token
    pub async fn set_initial_state_with_cancel(&self, key: K, cancel: &CancellationToken) -> Result<(), K> {
        self.shared.initialize(key, cancel).await
    }

    /// Transition to `key` through the guarded exit/commit/enter protocol
    pub async fn change_state(&self, key: K) -> Result<(), K> {
        let cancel = CancellationToken::new();
        self.change_state_with_cancel(key, &cancel).await
    }

    /// [`change_state`](Self::change_state) with a caller-supplied token
    pub async fn change_state_with_cancel(&self, key: K, cancel: &CancellationToken) -> Result<(), K> {
        self.shared.change_state(key, cancel).await
    }

    /// Await `on_update` of the active state. Call once per host tick.
    pub async fn update(&self) -> Result<(), K> {
        let cancel = CancellationToken::new();
        self.update_with_cancel(&cancel).await
    }

    /// [`update`](Self::update) with a caller-supplied token
    pub async fn update_with_cancel(&self, cancel: &CancellationToken) -> Result<(), K> {
        self.shared.update(cancel).await
    }

    /// Transition back to the most recent history entry. With empty history
    /// this logs a warning and returns `Ok(())`.
    pub async fn undo_last_transition(&self) -> Result<(), K> {
        let cancel = CancellationToken::new();
        self.undo_last_transition_with_cancel(&cancel).await
    }

    /// [`undo_last_transition`](Self::undo_last_transition) with a caller-supplied token
    pub async fn undo_last_transition_with_cancel(&self, cancel: &CancellationToken) -> Result<(), K> {
        self.shared.undo(cancel).await
    }

    /// Call `listener` after every committed transition
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChange<K>) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(listener)
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.listeners.unsubscribe(id)
    }

    /// Get the current state
    pub fn current_state(&self) -> Option<K> {
        self.shared.lock().current.clone()
    }

    /// Previously active keys, oldest first
    pub fn history(&self) -> Vec<K> {
        self.shared.lock().history.to_vec()
    }

    /// Whether `key` has a registered state
    pub fn is_registered(&self, key: &K) -> bool {
        self.shared.lock().states.contains_key(key)
    }

    /// All registered keys, in no particular order
    pub fn registered_states(&self) -> Vec<K> {
        self.shared.lock().states.keys().cloned().collect()
    }

    /// The configuration this machine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Export a PlantUML diagram of registered states, guarded pairs and
    /// observed transitions. Only available with the `plantuml` feature in
    /// debug builds.
    #[cfg(all(feature = "plantuml", debug_assertions))]
    pub fn export_plantuml(&self) -> String {
        let tables = self.shared.lock();
        let states: Vec<K> = tables.states.keys().cloned().collect();
        let guarded: Vec<(K, K)> = tables.guards.pairs().cloned().collect();
        crate::plantuml::generate_plantuml(
            &states,
            &guarded,
            &tables.transition_log,
            tables.current.as_ref(),
        )
    }

    /// Stub for export_plantuml when feature is disabled
    #[cfg(not(all(feature = "plantuml", debug_assertions)))]
    pub fn export_plantuml(&self) -> String {
        String::from("PlantUML export not available (requires 'plantuml' feature and debug build)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StateMachineBuilder;
    use crate::diagnostics::MemoryDiagnostics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // Test state enum
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestState {
        Bootstrap,
        Menu,
        Game,
        Broken,
    }

    type Journal = Arc<Mutex<Vec<String>>>;

    // Records every hook call as "<Name>:<hook>"
    struct Recorder {
        name: &'static str,
        journal: Journal,
    }

    impl Recorder {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                journal: Arc::clone(journal),
            }
        }

        fn record(&self, hook: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, hook));
        }
    }

    #[async_trait]
    impl Stateful<TestState> for Recorder {
        async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
            self.record("enter");
            Ok(())
        }

        async fn on_update(&self, _cancel: &CancellationToken) -> HookResult {
            self.record("update");
            Ok(())
        }

        async fn on_exit(&self, _cancel: &CancellationToken) -> HookResult {
            self.record("exit");
            Ok(())
        }
    }

    // Fails every enter with a fixed message
    struct FailingEnter;

    #[async_trait]
    impl Stateful<TestState> for FailingEnter {
        async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
            Err("refusing to start".into())
        }
    }

    fn create_test_fsm(
        policy: EnterFailurePolicy,
    ) -> (StateMachine<TestState>, Journal, Arc<MemoryDiagnostics>) {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(MemoryDiagnostics::new());

        let fsm = StateMachineBuilder::new()
            .diagnostics(sink.clone())
            .config(EngineConfig::default().with_enter_failure(policy))
            .state(TestState::Bootstrap, Recorder::new("Bootstrap", &journal))
            .state(TestState::Menu, Recorder::new("Menu", &journal))
            .state(TestState::Game, Recorder::new("Game", &journal))
            .state(TestState::Broken, FailingEnter)
            .build();

        (fsm, journal, sink)
    }

    fn journal(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_initialization() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);
        assert_eq!(fsm.current_state(), None);

        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();

        assert_eq!(fsm.current_state(), Some(TestState::Bootstrap));
        assert!(fsm.history().is_empty());
        assert_eq!(journal(&log), vec!["Bootstrap:enter"]);
    }

    #[tokio::test]
    async fn test_initial_state_must_be_registered() {
        let fsm: StateMachine<TestState> =
            StateMachine::with_config(EngineConfig::default(), Arc::new(MemoryDiagnostics::new()));

        let result = fsm.set_initial_state(TestState::Menu).await;
        assert!(matches!(result, Err(Error::InvalidState(TestState::Menu))));
        assert_eq!(fsm.current_state(), None);
    }

    #[tokio::test]
    async fn test_exit_runs_before_enter() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();

        fsm.change_state(TestState::Menu).await.unwrap();

        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert_eq!(fsm.history(), vec![TestState::Bootstrap]);
        assert_eq!(
            journal(&log),
            vec!["Bootstrap:enter", "Bootstrap:exit", "Menu:enter"]
        );
    }

    #[tokio::test]
    async fn test_reinitialization_clears_history_without_exit() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();
        fsm.change_state(TestState::Game).await.unwrap();
        assert_eq!(fsm.history().len(), 2);

        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();

        assert!(fsm.history().is_empty());
        assert_eq!(fsm.current_state(), Some(TestState::Bootstrap));
        assert_eq!(journal(&log).last().unwrap(), "Bootstrap:enter");
        assert!(!journal(&log).contains(&"Game:exit".to_string()));
    }

    #[tokio::test]
    async fn test_change_before_init_fails() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);

        let result = fsm.change_state(TestState::Menu).await;
        assert!(matches!(result, Err(Error::NotInitialized)));
        assert!(journal(&log).is_empty());
    }

    #[tokio::test]
    async fn test_update_targets_active_state_only() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);

        assert!(matches!(fsm.update().await, Err(Error::NotInitialized)));

        fsm.set_initial_state(TestState::Menu).await.unwrap();
        fsm.update().await.unwrap();
        fsm.update().await.unwrap();

        assert_eq!(
            journal(&log),
            vec!["Menu:enter", "Menu:update", "Menu:update"]
        );
    }

    #[tokio::test]
    async fn test_guard_rejection_is_a_logged_no_op() {
        let (fsm, log, sink) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.add_transition(TestState::Bootstrap, TestState::Menu, || false);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();

        fsm.change_state(TestState::Menu).await.unwrap();

        assert_eq!(fsm.current_state(), Some(TestState::Bootstrap));
        assert!(fsm.history().is_empty());
        assert_eq!(journal(&log), vec!["Bootstrap:enter"]);
        assert_eq!(
            sink.messages(Level::Warn),
            vec!["Transition from Bootstrap to Menu is not allowed by the guard".to_string()]
        );
    }

    #[tokio::test]
    async fn test_undo_uses_history() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();
        fsm.change_state(TestState::Game).await.unwrap();

        fsm.undo_last_transition().await.unwrap();
        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert_eq!(fsm.history(), vec![TestState::Bootstrap]);

        fsm.undo_last_transition().await.unwrap();
        assert_eq!(fsm.current_state(), Some(TestState::Bootstrap));
        assert!(fsm.history().is_empty());

        assert_eq!(
            journal(&log)[5..],
            ["Game:exit", "Menu:enter", "Menu:exit", "Bootstrap:enter"]
        );
    }

    #[tokio::test]
    async fn test_undo_with_empty_history_warns() {
        let (fsm, _, sink) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();

        fsm.undo_last_transition().await.unwrap();

        assert_eq!(fsm.current_state(), Some(TestState::Bootstrap));
        assert_eq!(
            sink.messages(Level::Warn),
            vec!["No previous state to revert to".to_string()]
        );
    }

    #[tokio::test]
    async fn test_guarded_undo_keeps_history() {
        let (fsm, _, _) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.add_transition(TestState::Menu, TestState::Bootstrap, || false);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();

        fsm.undo_last_transition().await.unwrap();

        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert_eq!(fsm.history(), vec![TestState::Bootstrap]);
    }

    #[tokio::test]
    async fn test_enter_failure_stays_in_new_state() {
        let (fsm, _, sink) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.set_initial_state(TestState::Menu).await.unwrap();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        fsm.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = fsm.change_state(TestState::Broken).await;

        match result {
            Err(Error::Hook { state, phase, source }) => {
                assert_eq!(state, TestState::Broken);
                assert_eq!(phase, HookPhase::Enter);
                assert_eq!(source.to_string(), "refusing to start");
            }
            other => panic!("Expected Hook error, got {:?}", other),
        }
        assert_eq!(fsm.current_state(), Some(TestState::Broken));
        assert_eq!(fsm.history(), vec![TestState::Menu]);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        assert_eq!(sink.count(Level::Error), 1);
    }

    #[tokio::test]
    async fn test_enter_failure_rolls_back_when_configured() {
        let (fsm, log, sink) = create_test_fsm(EnterFailurePolicy::Rollback);
        fsm.set_initial_state(TestState::Menu).await.unwrap();

        let result = fsm.change_state(TestState::Broken).await;

        assert!(matches!(result, Err(Error::Hook { .. })));
        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert!(fsm.history().is_empty());
        assert_eq!(journal(&log), vec!["Menu:enter", "Menu:exit", "Menu:enter"]);
        assert!(sink
            .messages(Level::Warn)
            .contains(&"Rolling back from Broken to Menu".to_string()));
    }

    #[tokio::test]
    async fn test_initial_enter_failure_rolls_back_to_previous_key() {
        let (fsm, _, _) = create_test_fsm(EnterFailurePolicy::Rollback);

        assert!(fsm.set_initial_state(TestState::Broken).await.is_err());
        assert_eq!(fsm.current_state(), None);

        fsm.set_initial_state(TestState::Menu).await.unwrap();
        assert!(fsm.set_initial_state(TestState::Broken).await.is_err());
        assert_eq!(fsm.current_state(), Some(TestState::Menu));
    }

    #[tokio::test]
    async fn test_initial_enter_failure_restores_history() {
        let (fsm, _, _) = create_test_fsm(EnterFailurePolicy::Rollback);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();

        assert!(fsm.set_initial_state(TestState::Broken).await.is_err());

        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert_eq!(fsm.history(), vec![TestState::Bootstrap]);
        fsm.undo_last_transition().await.unwrap();
        assert_eq!(fsm.current_state(), Some(TestState::Bootstrap));
    }

    // Enter that waits for cancellation
    struct StalledEnter;

    #[async_trait]
    impl Stateful<TestState> for StalledEnter {
        async fn on_enter(&self, cancel: &CancellationToken) -> HookResult {
            cancel.cancelled().await;
            Err("enter abandoned".into())
        }
    }

    #[tokio::test]
    async fn test_cancelled_enter_rolls_back_when_configured() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Rollback);
        fsm.add_state(TestState::Game, StalledEnter);
        fsm.set_initial_state(TestState::Menu).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = fsm.change_state_with_cancel(TestState::Game, &cancel).await;

        assert!(matches!(
            result,
            Err(Error::Cancelled {
                state: TestState::Game,
                phase: HookPhase::Enter
            })
        ));
        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert!(fsm.history().is_empty());
        // Re-entry runs with a fresh token, so the cancellation does not reach it
        assert_eq!(journal(&log), vec!["Menu:enter", "Menu:exit", "Menu:enter"]);
    }

    #[tokio::test]
    async fn test_failed_undo_rolls_back_and_keeps_history() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Rollback);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();
        fsm.add_state(TestState::Bootstrap, FailingEnter);

        let result = fsm.undo_last_transition().await;

        assert!(matches!(
            result,
            Err(Error::Hook {
                state: TestState::Bootstrap,
                phase: HookPhase::Enter,
                ..
            })
        ));
        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert_eq!(fsm.history(), vec![TestState::Bootstrap]);
        assert_eq!(journal(&log)[3..], ["Menu:exit", "Menu:enter"]);
    }

    // Enters once, refuses every later entry
    struct FlakyEnter {
        entered: AtomicBool,
    }

    #[async_trait]
    impl Stateful<TestState> for FlakyEnter {
        async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
            if self.entered.swap(true, Ordering::SeqCst) {
                return Err("second entry refused".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_reentry_during_rollback_is_logged() {
        let (fsm, _, sink) = create_test_fsm(EnterFailurePolicy::Rollback);
        fsm.add_state(
            TestState::Menu,
            FlakyEnter {
                entered: AtomicBool::new(false),
            },
        );
        fsm.set_initial_state(TestState::Menu).await.unwrap();

        let result = fsm.change_state(TestState::Broken).await;

        assert!(matches!(
            result,
            Err(Error::Hook {
                state: TestState::Broken,
                ..
            })
        ));
        assert_eq!(fsm.current_state(), Some(TestState::Menu));
        assert!(sink.messages(Level::Error).contains(
            &"State Menu failed to re-enter during rollback: second entry refused".to_string()
        ));
        assert_eq!(sink.count(Level::Error), 2);
    }

    // Exit that waits for cancellation
    struct StubbornExit;

    #[async_trait]
    impl Stateful<TestState> for StubbornExit {
        async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
            Ok(())
        }

        async fn on_exit(&self, cancel: &CancellationToken) -> HookResult {
            cancel.cancelled().await;
            Err("exit abandoned".into())
        }
    }

    #[tokio::test]
    async fn test_cancelled_exit_leaves_machine_untouched() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.add_state(TestState::Bootstrap, StubbornExit);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = fsm.change_state_with_cancel(TestState::Menu, &cancel).await;

        assert!(matches!(
            result,
            Err(Error::Cancelled {
                state: TestState::Bootstrap,
                phase: HookPhase::Exit
            })
        ));
        assert_eq!(fsm.current_state(), Some(TestState::Bootstrap));
        assert!(fsm.history().is_empty());
        assert!(journal(&log).is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_warns_and_replaces() {
        let (fsm, log, sink) = create_test_fsm(EnterFailurePolicy::Stay);
        let second: Journal = Arc::new(Mutex::new(Vec::new()));
        fsm.add_state(TestState::Menu, Recorder::new("Menu2", &second));

        assert_eq!(
            sink.messages(Level::Warn),
            vec!["State Menu already exists in the state machine. Overwriting.".to_string()]
        );

        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();

        assert_eq!(journal(&second), vec!["Menu2:enter"]);
        assert!(!journal(&log).iter().any(|entry| entry.starts_with("Menu:")));
    }

    // Hops to Game from inside its own enter hook
    struct SelfAdvancing {
        context: StateContext<TestState>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Stateful<TestState> for SelfAdvancing {
        async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
            Ok(())
        }

        async fn on_update(&self, _cancel: &CancellationToken) -> HookResult {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.context.change_state(TestState::Game).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_state_can_change_itself_through_context() {
        let (fsm, log, _) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.add_state_with_context(TestState::Bootstrap, |context| SelfAdvancing {
            context,
            fired: AtomicBool::new(false),
        });
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();

        fsm.update().await.unwrap();

        assert_eq!(fsm.current_state(), Some(TestState::Game));
        assert_eq!(fsm.history(), vec![TestState::Bootstrap]);
        assert_eq!(journal(&log), vec!["Game:enter"]);
    }

    #[tokio::test]
    async fn test_context_outliving_engine_reports_dropped() {
        let fsm: StateMachine<TestState> = StateMachine::new();
        let context = fsm.context();
        assert!(context.is_attached());
        drop(fsm);

        assert!(!context.is_attached());
        let result = context.change_state(TestState::Menu).await;
        assert!(matches!(result, Err(Error::EngineDropped)));
    }

    #[test]
    fn test_debug_output_lists_current_state() {
        let (fsm, _, _) = create_test_fsm(EnterFailurePolicy::Stay);
        tokio_test::block_on(fsm.set_initial_state(TestState::Game)).unwrap();

        let rendered = format!("{:?}", fsm);
        assert!(rendered.contains("current: Some(Game)"));
        assert!(rendered.contains("states: 4"));
    }

    #[cfg(not(all(feature = "plantuml", debug_assertions)))]
    #[test]
    fn test_plantuml_disabled() {
        let fsm: StateMachine<TestState> = StateMachine::new();
        let plantuml = fsm.export_plantuml();
        assert!(plantuml.contains("PlantUML export not available"));
    }

    #[cfg(all(feature = "plantuml", debug_assertions))]
    #[tokio::test]
    async fn test_plantuml_generation() {
        let (fsm, _, _) = create_test_fsm(EnterFailurePolicy::Stay);
        fsm.add_transition(TestState::Game, TestState::Menu, || true);
        fsm.set_initial_state(TestState::Bootstrap).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();
        fsm.change_state(TestState::Game).await.unwrap();
        fsm.change_state(TestState::Menu).await.unwrap();
        fsm.change_state(TestState::Game).await.unwrap();

        let plantuml = fsm.export_plantuml();

        assert!(plantuml.contains("@startuml"));
        assert!(plantuml.contains("@enduml"));
        assert!(plantuml.contains("Bootstrap --> Menu"));
        assert_eq!(plantuml.matches("Menu --> Game").count(), 1);
        assert!(plantuml.contains("Game --> Menu : [guard]"));
        assert!(plantuml.contains("state Broken\n"));
        assert!(plantuml.contains("Game <<Current>>"));
    }
}
