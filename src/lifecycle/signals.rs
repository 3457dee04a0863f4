//! Termination signal delivery.
//!
//! # Responsibilities
//! - Deliver SIGINT/SIGTERM to the channel of the current run only
//! - Stop delivery when the run's registration is dropped
//! - Provide an in-process source for tests and embedding
//!
//! # Design Decisions
//! - Uses Tokio's signal handling on a dedicated relay thread
//! - Delivery is `try_send`: a full channel already holds a pending stop
//! - Tokio cannot uninstall a handler, so with no live registration the
//!   relay restores the default action and re-raises the signal

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT, Ctrl+C, or a restart request.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

/// A live subscription. Dropping it stops delivery.
pub struct Registration {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A registration with nothing to release.
    pub fn inert() -> Self {
        Self { release: None }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("live", &self.release.is_some())
            .finish()
    }
}

/// Source of termination signals.
pub trait SignalSource: Send + Sync + 'static {
    /// Deliver `Interrupt` and `Terminate` to `tx` until the returned
    /// registration is dropped.
    fn notify(&self, tx: mpsc::Sender<Signal>) -> Registration;
}

/// Process signals.
///
/// One relay thread owns the OS handlers for the life of the process and
/// hands each signal to the live registrations. A signal that arrives with
/// nothing registered gets the default action, so the process still dies
/// on Ctrl+C before the first run and after the last one.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

impl SignalSource for OsSignals {
    fn notify(&self, tx: mpsc::Sender<Signal>) -> Registration {
        match os_relay() {
            Some(relay) => relay.notify(tx),
            None => Registration::inert(),
        }
    }
}

static OS_RELAY: OnceLock<Option<ManualSignals>> = OnceLock::new();

/// Start the relay on first use. Returns once the handlers are installed.
fn os_relay() -> Option<&'static ManualSignals> {
    OS_RELAY
        .get_or_init(|| {
            let relay = ManualSignals::new();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel();
            let forwarded = relay.clone();
            let spawned = std::thread::Builder::new()
                .name("rebind-signals".to_string())
                .spawn(move || run_relay(forwarded, ready_tx));
            if let Err(e) = spawned {
                tracing::error!(error = %e, "Failed to start signal relay");
                return None;
            }
            ready_rx.recv().unwrap_or(false).then_some(relay)
        })
        .as_ref()
}

fn run_relay(relay: ManualSignals, ready: std::sync::mpsc::Sender<bool>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build signal relay runtime");
            let _ = ready.send(false);
            return;
        }
    };
    runtime.block_on(forward_os_signals(relay, ready));
}

fn relay_signal(relay: &ManualSignals, signal: Signal) {
    match relay.offer(signal) {
        Some(delivered) => tracing::info!(?signal, delivered, "Received signal"),
        None => {
            tracing::info!(?signal, "Received signal with no listener, exiting");
            deliver_default(signal);
        }
    }
}

#[cfg(unix)]
async fn forward_os_signals(relay: ManualSignals, ready: std::sync::mpsc::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            let _ = ready.send(false);
            return;
        }
    };
    let _ = ready.send(true);

    loop {
        let signal = tokio::select! {
            Some(()) = sigint.recv() => Signal::Interrupt,
            Some(()) = sigterm.recv() => Signal::Terminate,
            else => return,
        };
        relay_signal(&relay, signal);
    }
}

#[cfg(not(unix))]
async fn forward_os_signals(relay: ManualSignals, ready: std::sync::mpsc::Sender<bool>) {
    let _ = ready.send(true);
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        relay_signal(&relay, Signal::Interrupt);
    }
}

/// Put the default disposition back and re-raise.
#[cfg(unix)]
fn deliver_default(signal: Signal) {
    use nix::sys::signal::{self as sys, SigHandler};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Interrupt => sys::Signal::SIGINT,
        Signal::Terminate => sys::Signal::SIGTERM,
    };
    // SAFETY: SIG_DFL installs no handler code.
    if let Err(e) = unsafe { sys::signal(sig, SigHandler::SigDfl) } {
        tracing::error!(error = %e, ?signal, "Failed to restore default signal action");
        return;
    }
    if let Err(e) = sys::kill(Pid::this(), sig) {
        tracing::error!(error = %e, ?signal, "Failed to re-raise signal");
    }
}

#[cfg(not(unix))]
fn deliver_default(_signal: Signal) {
    std::process::exit(130);
}

/// In-process signal source. `raise` reaches every live registration.
#[derive(Debug, Clone, Default)]
pub struct ManualSignals {
    inner: Arc<ManualInner>,
}

#[derive(Debug, Default)]
struct ManualInner {
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, mpsc::Sender<Signal>)>>,
}

impl ManualSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `signal`. Returns how many registrations accepted it.
    pub fn raise(&self, signal: Signal) -> usize {
        self.offer(signal).unwrap_or(0)
    }

    /// Like [`raise`](Self::raise), but `None` when nothing is registered.
    fn offer(&self, signal: Signal) -> Option<usize> {
        let senders = self.inner.senders.lock();
        if senders.is_empty() {
            return None;
        }
        Some(
            senders
                .iter()
                .filter(|(_, tx)| tx.try_send(signal).is_ok())
                .count(),
        )
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.inner.senders.lock().len()
    }
}

impl SignalSource for ManualSignals {
    fn notify(&self, tx: mpsc::Sender<Signal>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.senders.lock().push((id, tx));

        let inner = Arc::clone(&self.inner);
        Registration::new(move || {
            inner.senders.lock().retain(|(other, _)| *other != id);
        })
    }
}
