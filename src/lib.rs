//! # Async State Engine
//!
//! An async-first finite state machine runtime. One state is active at a
//! time; states have async enter/update/exit hooks, transitions can be gated
//! by guards, every committed transition is recorded for undo and broadcast
//! to subscribers.
//!
//! ## Features
//!
//! - 🔄 **Async Hooks**: `on_enter`, `on_update` and `on_exit` with cancellation tokens
//! - 🚦 **Guards**: per `(from, to)` predicates consulted before a transition
//! - ↩️ **Undo**: history of previously active states
//! - 📣 **Notifications**: subscribe to `(previous, current)` changes
//! - 🧵 **Thread Safe**: table access behind one short-lived lock, hooks run outside it
//! - 🧱 **Sync Adapters**: explicit blocking and spawned variants of every lifecycle call
//! - 📊 **PlantUML Export**: diagram of states and transitions (debug builds only)
//!
//! ## Quick Start
//!
//! ```rust
//! use async_state_engine::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! enum AppState { Bootstrap, Menu }
//!
//! struct Bootstrap;
//!
//! #[async_trait]
//! impl Stateful<AppState> for Bootstrap {
//!     async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
//!         Ok(())
//!     }
//! }
//!
//! struct Menu;
//!
//! #[async_trait]
//! impl Stateful<AppState> for Menu {
//!     async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), AppState> {
//! let fsm = StateMachineBuilder::new()
//!     .state(AppState::Bootstrap, Bootstrap)
//!     .state(AppState::Menu, Menu)
//!     .build();
//!
//! fsm.set_initial_state(AppState::Bootstrap).await?;
//! fsm.change_state(AppState::Menu).await?;
//! fsm.undo_last_transition().await?;
//! assert_eq!(fsm.current_state(), Some(AppState::Bootstrap));
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub use async_trait::async_trait;

mod blocking;
mod builder;
mod config;
mod diagnostics;
mod error;
mod guard;
mod history;
mod machine;
mod notify;
mod state;

#[cfg(all(feature = "plantuml", debug_assertions))]
mod plantuml;

pub use builder::StateMachineBuilder;
pub use config::{EngineConfig, EnterFailurePolicy};
pub use diagnostics::{Diagnostics, Level, MemoryDiagnostics, SilentDiagnostics, TracingDiagnostics};
pub use error::{Error, HookError, HookPhase, HookResult, Result};
pub use guard::Guard;
pub use machine::StateMachine;
pub use notify::{StateChange, SubscriptionId};
pub use state::{StateContext, StateKey, Stateful};

pub mod prelude {
    //! Prelude module for convenient imports
    pub use crate::{
        Error, HookResult, Result, StateChange, StateContext, StateKey, StateMachine,
        StateMachineBuilder, Stateful,
    };
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
