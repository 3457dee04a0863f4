//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count open connections for shutdown and metrics
//! - Report connection state transitions (New → Active ⇄ Idle → Closed)
//! - Enforce the idle timeout between requests
//! - Attach base and per-connection context to every request

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{Extensions, Request};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};
use tower::Service;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State reported to the connection-state hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, no request seen yet.
    New,
    /// At least one request in flight.
    Active,
    /// Between requests (keep-alive).
    Idle,
    /// Closed, for any reason including a failed TLS handshake.
    Closed,
}

/// Called with the peer address on every connection state transition.
pub type ConnStateHook = Arc<dyn Fn(SocketAddr, ConnState) + Send + Sync>;

/// Called once per run with the bound address; the returned extensions are
/// added to every request served by that run.
pub type BaseContextHook = Arc<dyn Fn(SocketAddr) -> Extensions + Send + Sync>;

/// Called once per connection with the run's base extensions and the peer
/// address; the returned extensions are added to every request on it.
pub type ConnContextHook = Arc<dyn Fn(&Extensions, SocketAddr) -> Extensions + Send + Sync>;

/// Listener-level callbacks. Changing any of them requires a restart.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    pub on_state: Option<ConnStateHook>,
    pub base_context: Option<BaseContextHook>,
    pub conn_context: Option<ConnContextHook>,
}

impl ConnectionHooks {
    pub fn on_state<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr, ConnState) + Send + Sync + 'static,
    {
        self.on_state = Some(Arc::new(f));
        self
    }

    pub fn base_context<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) -> Extensions + Send + Sync + 'static,
    {
        self.base_context = Some(Arc::new(f));
        self
    }

    pub fn conn_context<F>(mut self, f: F) -> Self
    where
        F: Fn(&Extensions, SocketAddr) -> Extensions + Send + Sync + 'static,
    {
        self.conn_context = Some(Arc::new(f));
        self
    }

    /// Extensions shared by every request of a run bound to `local_addr`.
    pub(crate) fn base_extensions(&self, local_addr: SocketAddr) -> Extensions {
        self.base_context
            .as_ref()
            .map(|f| f(local_addr))
            .unwrap_or_default()
    }

    /// Extensions for one connection: the base set plus the per-connection set.
    pub(crate) fn connection_extensions(&self, base: &Extensions, peer: SocketAddr) -> Extensions {
        let mut extensions = base.clone();
        if let Some(f) = &self.conn_context {
            extensions.extend(f(base, peer));
        }
        extensions
    }
}

impl fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_state", &self.on_state.is_some())
            .field("base_context", &self.base_context.is_some())
            .field("conn_context", &self.conn_context.is_some())
            .finish()
    }
}

/// Tracks open connections of a server.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active_count: Arc<watch::Sender<u64>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self {
            active_count: Arc::new(watch::Sender::new(0)),
        }
    }
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new open connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.send_modify(|count| *count += 1);
        metrics::record_connection_opened();
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current open connection count.
    pub fn active_count(&self) -> u64 {
        *self.active_count.borrow()
    }

    /// Resolve once no connection is open.
    pub async fn drained(&self) {
        let mut count = self.active_count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = count.wait_for(|count| *count == 0).await;
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the open count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.send_modify(|count| *count -= 1);
        metrics::record_connection_closed();
    }
}

/// Per-connection bookkeeping shared by the stream and the request service.
pub(crate) struct Connection {
    guard: ConnectionGuard,
    peer: SocketAddr,
    on_state: Option<ConnStateHook>,
    in_flight: AtomicUsize,
}

impl Connection {
    pub(crate) fn open(
        tracker: &ConnectionTracker,
        peer: SocketAddr,
        on_state: Option<ConnStateHook>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            guard: tracker.track(),
            peer,
            on_state,
            in_flight: AtomicUsize::new(0),
        });
        connection.report(ConnState::New);
        connection
    }

    fn report(&self, state: ConnState) {
        tracing::trace!(connection_id = %self.guard.id(), peer = %self.peer, ?state, "Connection state");
        if let Some(hook) = &self.on_state {
            hook(self.peer, state);
        }
    }

    fn request_started(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            self.report(ConnState::Active);
        }
    }

    fn request_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.report(ConnState::Idle);
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.report(ConnState::Closed);
    }
}

/// Marks one request in flight on a connection until dropped.
struct InFlight(Arc<Connection>);

impl InFlight {
    fn begin(connection: Arc<Connection>) -> Self {
        connection.request_started();
        Self(connection)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.request_finished();
    }
}

struct IdleDeadline {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleDeadline {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn reset(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }
}

/// I/O stream wrapper that keeps the connection record alive and closes the
/// connection once it sits idle between requests for too long.
pub struct TrackedStream<T> {
    inner: T,
    connection: Arc<Connection>,
    idle: Option<IdleDeadline>,
}

impl<T> TrackedStream<T> {
    pub(crate) fn new(inner: T, connection: Arc<Connection>, idle_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            connection,
            idle: idle_timeout.map(IdleDeadline::new),
        }
    }

    fn touch(&mut self) {
        if let Some(idle) = self.idle.as_mut() {
            idle.reset();
        }
    }

    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(idle) = self.idle.as_mut() else {
            return Poll::Pending;
        };
        if !self.connection.is_idle() {
            return Poll::Pending;
        }
        match idle.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle timeout",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TrackedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_idle(cx),
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TrackedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if poll.is_ready() {
            this.touch();
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if poll.is_ready() {
            this.touch();
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Per-connection service wrapper: adds the connection's extensions to each
/// request and tracks requests in flight.
#[derive(Clone)]
pub struct ContextService<S> {
    inner: S,
    extensions: Extensions,
    connection: Arc<Connection>,
}

impl<S> ContextService<S> {
    pub(crate) fn new(inner: S, extensions: Extensions, connection: Arc<Connection>) -> Self {
        Self {
            inner,
            extensions,
            connection,
        }
    }
}

impl<S, B> Service<Request<B>> for ContextService<S>
where
    S: Service<Request<B>>,
    S::Future: Send + 'static,
    S::Response: 'static,
    S::Error: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        request.extensions_mut().extend(self.extensions.clone());
        let in_flight = InFlight::begin(Arc::clone(&self.connection));
        let future = self.inner.call(request);
        Box::pin(async move {
            let _in_flight = in_flight;
            future.await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn drained_waits_for_last_guard() {
        let tracker = ConnectionTracker::new();
        tracker.drained().await;

        let guard = tracker.track();
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.drained().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drained did not resolve")
            .unwrap();
    }

    #[test]
    fn reports_state_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let hook: ConnStateHook = Arc::new(move |_, state| log.lock().push(state));

        let tracker = ConnectionTracker::new();
        let connection = Connection::open(&tracker, peer(), Some(hook));
        {
            let _first = InFlight::begin(Arc::clone(&connection));
            let _second = InFlight::begin(Arc::clone(&connection));
        }
        assert_eq!(tracker.active_count(), 1);
        drop(connection);

        assert_eq!(
            *seen.lock(),
            vec![ConnState::New, ConnState::Active, ConnState::Idle, ConnState::Closed]
        );
        assert_eq!(tracker.active_count(), 0);
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Tag(&'static str);

    #[derive(Clone, Debug, PartialEq)]
    struct Peer(SocketAddr);

    #[test]
    fn connection_extensions_layer_on_base() {
        let hooks = ConnectionHooks::default()
            .base_context(|_| {
                let mut ext = Extensions::new();
                ext.insert(Tag("base"));
                ext
            })
            .conn_context(|base, peer| {
                assert!(base.get::<Tag>().is_some());
                let mut ext = Extensions::new();
                ext.insert(Peer(peer));
                ext
            });

        let base = hooks.base_extensions("127.0.0.1:8080".parse().unwrap());
        let ext = hooks.connection_extensions(&base, peer());
        assert_eq!(ext.get::<Tag>(), Some(&Tag("base")));
        assert_eq!(ext.get::<Peer>(), Some(&Peer(peer())));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out_only_between_requests() {
        use tokio::io::AsyncReadExt;

        let tracker = ConnectionTracker::new();
        let (client, server) = tokio::io::duplex(64);
        let connection = Connection::open(&tracker, peer(), None);
        let mut stream =
            TrackedStream::new(server, Arc::clone(&connection), Some(Duration::from_secs(5)));

        let busy = InFlight::begin(Arc::clone(&connection));
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf)).await;
        assert!(read.is_err(), "busy connection must not hit the idle deadline");

        drop(busy);
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(client);
    }
}
