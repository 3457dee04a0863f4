//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Controller (controller.rs):
//!     start → run → [signal | restart | shutdown] → drain → run again or stop
//!
//! State (state.rs):
//!     Idle → Running → {ShuttingDown | Restarting} → Running | Idle
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → current run's channel → graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One phase value under one lock instead of independent flags
//! - A fresh signal channel per run; stale channels are closed, never reused
//! - Shutdown has a timeout: connections still open after it are closed

pub mod controller;
pub mod signals;
pub mod state;

pub use controller::{Controller, StartupHook, DEFAULT_GRACEFUL_TIMEOUT};
pub use signals::{ManualSignals, OsSignals, Registration, Signal, SignalSource};
pub use state::Phase;
