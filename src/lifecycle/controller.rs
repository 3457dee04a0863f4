//! Server lifecycle controller.
//!
//! # Responsibilities
//! - Own the next-run configuration and bake it at every run boundary
//! - Run the accept loop, restarting it in place on request
//! - Route termination signals to the current run only
//! - Shut the current run down gracefully within a grace period
//!
//! # Data Flow
//! ```text
//! start()
//!     → begin run (fresh signal channel, fresh server handle)
//!     → startup hook edits the builder
//!     → builder baked into ServerConfig → HttpServer::serve
//!     → signal or restart() → watcher calls shutdown() → serve returns
//!     → end run (registration dropped, channel closed)
//!     → restart pending? carry builder forward and loop : return
//! ```
//!
//! # Design Decisions
//! - A new run binds only after the previous accept loop has returned, so
//!   two listeners never overlap
//! - The builder persists across runs; only emptied TLS material is dropped
//!   when carrying it forward
//! - `shutdown()` logs drain failures instead of returning them, since the
//!   accept loop reports its own outcome through `start()`

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::http::server::{HttpServer, ServerBuilder, ServerConfig, ServerError, ServerHandle};
use crate::lifecycle::signals::{OsSignals, Registration, Signal, SignalSource};
use crate::lifecycle::state::{Phase, RunState};
use crate::observability::metrics;

/// Grace period used when none is configured.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Called with the builder before every run, including restarts.
///
/// The builder lock is held while it runs, so the hook must not call
/// [`Controller::update`] or [`Controller::replace_handler`].
pub type StartupHook = Box<dyn Fn(&mut ServerBuilder) + Send + Sync>;

/// Owns a listening server and controls its lifecycle.
///
/// Cheap to clone; clones control the same server.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

struct Shared {
    builder: Mutex<ServerBuilder>,
    state: Mutex<RunState>,
    on_start: Mutex<Option<StartupHook>>,
    signals: Arc<dyn SignalSource>,
    graceful_timeout: Mutex<Duration>,
}

impl Controller {
    /// Controller reacting to the process's SIGINT and SIGTERM.
    pub fn new(builder: ServerBuilder) -> Self {
        Self::with_signals(builder, OsSignals)
    }

    /// Controller with a custom signal source.
    pub fn with_signals(builder: ServerBuilder, signals: impl SignalSource) -> Self {
        Self {
            shared: Arc::new(Shared {
                builder: Mutex::new(builder),
                state: Mutex::new(RunState::new()),
                on_start: Mutex::new(None),
                signals: Arc::new(signals),
                graceful_timeout: Mutex::new(DEFAULT_GRACEFUL_TIMEOUT),
            }),
        }
    }

    pub fn graceful_timeout(self, grace: Duration) -> Self {
        self.set_graceful_timeout(grace);
        self
    }

    pub fn set_graceful_timeout(&self, grace: Duration) {
        *self.shared.graceful_timeout.lock() = grace;
    }

    /// Time a shutdown waits for open connections before closing them.
    pub fn grace_period(&self) -> Duration {
        *self.shared.graceful_timeout.lock()
    }

    /// Register the startup hook, replacing any previous one. Takes effect
    /// at the next run.
    pub fn on_start<F>(&self, hook: F)
    where
        F: Fn(&mut ServerBuilder) + Send + Sync + 'static,
    {
        *self.shared.on_start.lock() = Some(Box::new(hook));
    }

    /// Edit the configuration of the next run.
    pub fn update<R>(&self, f: impl FnOnce(&mut ServerBuilder) -> R) -> R {
        f(&mut *self.shared.builder.lock())
    }

    /// Replace the handler, both for the running server and for later runs.
    pub fn replace_handler(&self, handler: Router) {
        self.shared.builder.lock().handler = handler.clone();
        if let Some(server) = self.shared.state.lock().server() {
            server.replace_handler(handler);
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase()
    }

    /// The serve loop is alive: serving, draining, or between two runs of
    /// a restart. See [`restart_requested`](Self::restart_requested).
    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    pub fn restart_requested(&self) -> bool {
        self.phase() == Phase::Restarting
    }

    /// Address of the current run once bound. After the loop stops this
    /// is the last run's address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local_addr()
    }

    /// Configuration baked for the current (or last) run.
    pub fn config(&self) -> Option<ServerConfig> {
        self.shared.state.lock().config().cloned()
    }

    /// Number of runs started so far.
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation()
    }

    /// Serve until shut down, restarting in place whenever requested.
    ///
    /// Resolves when a run ends with no restart pending, with that run's
    /// result. Errors of runs followed by a restart are logged.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.shared.state.lock().claim()?;
        let _loop = LoopGuard(&self.shared);

        loop {
            let result = self.run_once().await;

            if !self.restart_requested() {
                tracing::info!("HTTP server is shutdown");
                return result;
            }
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server run failed");
            }

            tracing::info!("HTTP server is restarting");
            self.shared.builder.lock().carry_forward();
        }
    }

    /// Stop the current run and start a new one with the next-run
    /// configuration. No-op when nothing runs or a restart is pending.
    pub fn restart(&self) {
        let requested = self.shared.state.lock().request_restart();
        if requested {
            metrics::record_restart();
            tracing::info!("HTTP server restart requested");
        } else {
            tracing::debug!(phase = %self.phase(), "Restart ignored");
        }
    }

    /// Gracefully stop the current run. A pending restart stays pending.
    pub async fn shutdown(&self) {
        let Some(server) = self.shared.state.lock().mark_shutting_down() else {
            tracing::debug!("No HTTP server to shut down");
            return;
        };

        if let Err(e) = server.shutdown(self.grace_period()).await {
            tracing::error!(error = %e, "HTTP server shutdown");
        }
    }

    async fn run_once(&self) -> Result<(), ServerError> {
        let shared = &self.shared;
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let handle = ServerHandle::new();

        let generation = shared.state.lock().begin_run(signal_tx.clone(), handle.clone());
        let registration = shared.signals.notify(signal_tx);
        tokio::spawn(watch_signals(self.clone(), signal_rx));
        let _run = RunGuard {
            shared,
            generation,
            registration: Some(registration),
        };

        if let Some(hook) = shared.on_start.lock().as_ref() {
            hook(&mut *shared.builder.lock());
        }
        let config = shared.builder.lock().build();
        shared.state.lock().attach_config(generation, config.clone());

        let span = tracing::info_span!(
            "server",
            name = %config.name(),
            address = %config.address(),
            generation
        );
        let server = HttpServer::with_handle(config, handle);

        metrics::record_run_started();
        let result = server.serve().instrument(span).await;
        metrics::record_run_finished(result.is_ok());

        result
    }
}

/// Shut the run down on its first signal. Exits once the run closes the
/// channel.
async fn watch_signals(controller: Controller, mut signal_rx: mpsc::Receiver<Signal>) {
    if let Some(signal) = signal_rx.recv().await {
        tracing::info!(?signal, "Shutting down HTTP server");
        controller.shutdown().await;
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("phase", &self.phase())
            .field("generation", &self.generation())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Ends one run on every exit path: deregisters signals, closes the
/// channel and leaves the running phase.
struct RunGuard<'a> {
    shared: &'a Shared,
    generation: u64,
    registration: Option<Registration>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        drop(self.registration.take());
        self.shared.state.lock().end_run(self.generation);
    }
}

/// Releases the restart loop when `start` returns or is cancelled.
struct LoopGuard<'a>(&'a Shared);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().release();
    }
}
