//! Application flow example
//!
//! An application with three states driven by a fixed-rate tick loop:
//! - Bootstrap: loads data on enter, then asks to move to the main menu
//! - MainMenu: waits a few ticks and starts the game
//! - GameLoop: counts frames and eventually returns to the menu
//!
//! The example shows:
//! - Context-aware states requesting their own transitions
//! - A time-based guard on Bootstrap -> MainMenu
//! - Change notifications and undo
//! - Logging through `tracing`

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_state_engine::{
    async_trait, HookResult, StateContext, StateMachine, StateMachineBuilder, Stateful,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AppState {
    Bootstrap,
    MainMenu,
    GameLoop,
}

struct BootstrapState {
    context: StateContext<AppState>,
}

#[async_trait]
impl Stateful<AppState> for BootstrapState {
    async fn on_enter(&self, cancel: &CancellationToken) -> HookResult {
        println!("🚀 Entering Bootstrap");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => println!("📦 Bootstrap data loaded"),
            _ = cancel.cancelled() => return Err("bootstrap cancelled".into()),
        }
        Ok(())
    }

    async fn on_update(&self, _cancel: &CancellationToken) -> HookResult {
        // Rejected by the guard until enough time has passed
        self.context.change_state(AppState::MainMenu).await?;
        Ok(())
    }

    async fn on_exit(&self, _cancel: &CancellationToken) -> HookResult {
        println!("👋 Exiting Bootstrap");
        Ok(())
    }
}

struct MainMenuState {
    context: StateContext<AppState>,
    ticks: AtomicU32,
}

#[async_trait]
impl Stateful<AppState> for MainMenuState {
    async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
        println!("📋 Entering Main Menu");
        self.ticks.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn on_update(&self, _cancel: &CancellationToken) -> HookResult {
        if self.ticks.fetch_add(1, Ordering::SeqCst) == 3 {
            println!("▶️  Start pressed");
            self.context.change_state(AppState::GameLoop).await?;
        }
        Ok(())
    }

    async fn on_exit(&self, _cancel: &CancellationToken) -> HookResult {
        println!("📋 Exiting Main Menu");
        Ok(())
    }
}

struct GameLoopState {
    frames: AtomicU32,
}

#[async_trait]
impl Stateful<AppState> for GameLoopState {
    async fn on_enter(&self, _cancel: &CancellationToken) -> HookResult {
        println!("🎮 Entering Game Loop");
        self.frames.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn on_update(&self, _cancel: &CancellationToken) -> HookResult {
        let frame = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        println!("   frame {}", frame);
        Ok(())
    }

    async fn on_exit(&self, _cancel: &CancellationToken) -> HookResult {
        println!("🎮 Exiting Game Loop");
        Ok(())
    }
}

fn create_app_fsm() -> StateMachine<AppState> {
    let started = Instant::now();

    StateMachineBuilder::new()
        .state_with_context(AppState::Bootstrap, |context| BootstrapState { context })
        .state_with_context(AppState::MainMenu, |context| MainMenuState {
            context,
            ticks: AtomicU32::new(0),
        })
        .state(
            AppState::GameLoop,
            GameLoopState {
                frames: AtomicU32::new(0),
            },
        )
        .transition(AppState::Bootstrap, AppState::MainMenu, move || {
            started.elapsed() > Duration::from_millis(500)
        })
        .transition(AppState::GameLoop, AppState::MainMenu, || true)
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    println!("🎯 Application Flow Example");
    println!("===========================\n");

    let fsm = create_app_fsm();
    fsm.subscribe(|change| {
        println!("🔄 State changed from {:?} to {:?}", change.previous, change.current);
    });

    fsm.set_initial_state(AppState::Bootstrap).await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    for _ in 0..30 {
        ticker.tick().await;
        fsm.update().await?;
    }

    println!("\n↩️  Undoing the last transition");
    fsm.undo_last_transition().await?;
    println!("Current state: {:?}", fsm.current_state());
    println!("History: {:?}", fsm.history());

    #[cfg(all(feature = "plantuml", debug_assertions))]
    {
        println!("\n📊 PlantUML Diagram:");
        println!("{}", fsm.export_plantuml());
    }

    println!("\n✅ Example completed!");
    Ok(())
}
