//! Controller run state.
//!
//! One `Phase` value replaces separate "running" and "restart requested"
//! flags, so the two can never be observed out of step. Every transition
//! happens under the controller's state lock.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::http::server::{ServerConfig, ServerError, ServerHandle};
use crate::lifecycle::signals::Signal;

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No run in progress.
    Idle,
    /// A run is serving.
    Running,
    /// A run is draining after a shutdown request.
    ShuttingDown,
    /// The current run is stopping and another will follow.
    Restarting,
}

impl Phase {
    /// The serve loop is alive, including while it drains for a restart.
    pub fn is_running(self) -> bool {
        self != Phase::Idle
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::ShuttingDown => "shutting_down",
            Phase::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

/// State shared between the accept loop, the signal watcher and the owner.
#[derive(Debug)]
pub(crate) struct RunState {
    phase: Phase,
    looping: bool,
    generation: u64,
    signal_tx: Option<mpsc::Sender<Signal>>,
    server: Option<ServerHandle>,
    config: Option<ServerConfig>,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Idle,
            looping: false,
            generation: 0,
            signal_tx: None,
            server: None,
            config: None,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Take ownership of the restart loop. Only one `start` may hold it.
    pub(crate) fn claim(&mut self) -> Result<(), ServerError> {
        if self.looping {
            return Err(ServerError::AlreadyStarted);
        }
        self.looping = true;
        Ok(())
    }

    /// Give the restart loop back. The controller is idle afterwards.
    pub(crate) fn release(&mut self) {
        self.looping = false;
        self.phase = Phase::Idle;
        self.signal_tx = None;
    }

    /// Enter a new run. A pending restart is consumed here.
    pub(crate) fn begin_run(&mut self, signal_tx: mpsc::Sender<Signal>, server: ServerHandle) -> u64 {
        self.generation += 1;
        self.phase = Phase::Running;
        self.signal_tx = Some(signal_tx);
        self.server = Some(server);
        self.config = None;
        self.generation
    }

    /// Record the configuration baked for the current run.
    pub(crate) fn attach_config(&mut self, generation: u64, config: ServerConfig) {
        if generation == self.generation {
            self.config = Some(config);
        }
    }

    pub(crate) fn config(&self) -> Option<&ServerConfig> {
        self.config.as_ref()
    }

    /// Request a restart of the current run.
    ///
    /// Returns `false` (and changes nothing) when no run exists or a restart
    /// is already pending. Otherwise wakes the run's signal watcher; a full
    /// or closed channel means the run is already stopping, which is enough.
    pub(crate) fn request_restart(&mut self) -> bool {
        if !matches!(self.phase, Phase::Running | Phase::ShuttingDown) {
            return false;
        }
        self.phase = Phase::Restarting;
        if let Some(tx) = &self.signal_tx {
            let _ = tx.try_send(Signal::Interrupt);
        }
        true
    }

    /// Note a shutdown request and return the server to stop.
    ///
    /// A pending restart stays pending. The last run's handle is returned
    /// even after it finished, where shutting it down is a no-op.
    pub(crate) fn mark_shutting_down(&mut self) -> Option<ServerHandle> {
        if self.phase == Phase::Running {
            self.phase = Phase::ShuttingDown;
        }
        self.server.clone()
    }

    /// Leave the run identified by `generation`. Returns whether a restart
    /// is pending.
    pub(crate) fn end_run(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return self.phase == Phase::Restarting;
        }
        self.signal_tx = None;
        if self.phase != Phase::Restarting {
            self.phase = Phase::Idle;
        }
        self.phase == Phase::Restarting
    }

    /// Address the current (or last) run is bound to.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(ServerHandle::local_addr)
    }

    pub(crate) fn server(&self) -> Option<ServerHandle> {
        self.server.clone()
    }
}
