//! Injectable diagnostics sink
//!
//! The engine never logs through a global facility directly. Every warning,
//! error and informational message goes through the [`Diagnostics`] handed to
//! it at construction, so tests can capture them deterministically.

use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Severity of a diagnostics message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Committed state changes
    Info,
    /// Policy outcomes such as guard rejections or empty undo history
    Warn,
    /// Failures surfaced to a caller
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => f.write_str("INFO"),
            Level::Warn => f.write_str("WARN"),
            Level::Error => f.write_str("ERROR"),
        }
    }
}

/// Receiver for engine messages.
///
/// Implementations must not panic: the engine calls them from inside its
/// transition path.
pub trait Diagnostics: Send + Sync {
    /// Record one message
    fn log(&self, level: Level, message: &str);
}

/// Forwards messages to `tracing`. This is the default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Info => tracing::info!(target: "async_state_engine", "{}", message),
            Level::Warn => tracing::warn!(target: "async_state_engine", "{}", message),
            Level::Error => tracing::error!(target: "async_state_engine", "{}", message),
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentDiagnostics;

impl Diagnostics for SilentDiagnostics {
    fn log(&self, _level: Level, _message: &str) {}
}

/// Keeps every message in memory, in arrival order
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    entries: Mutex<Vec<(Level, String)>>,
}

impl MemoryDiagnostics {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded messages
    pub fn entries(&self) -> Vec<(Level, String)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages recorded at `level`
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Number of messages recorded at `level`
    pub fn count(&self, level: Level) -> usize {
        self.messages(level).len()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn log(&self, level: Level, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, message.to_string()));
    }
}
