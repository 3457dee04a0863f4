//! Connection acceptor wrapping the plain or TLS acceptor of axum-server.
//!
//! Every accepted TCP stream is registered with the run's connection tracker,
//! reported to the connection-state hook, wrapped for idle tracking, and its
//! service is given the run's base and per-connection extensions.

use std::io;
use std::time::Duration;

use axum::http::Extensions;
use axum_server::accept::Accept;
use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use crate::net::connection::{
    Connection, ConnectionHooks, ConnectionTracker, ContextService, TrackedStream,
};

/// Acceptor installed on every run's listener.
#[derive(Clone)]
pub struct ConnectionAcceptor<A> {
    inner: A,
    hooks: ConnectionHooks,
    base: Extensions,
    idle_timeout: Option<Duration>,
    tracker: ConnectionTracker,
}

impl<A> ConnectionAcceptor<A> {
    pub fn new(
        inner: A,
        hooks: ConnectionHooks,
        base: Extensions,
        idle_timeout: Option<Duration>,
        tracker: ConnectionTracker,
    ) -> Self {
        Self {
            inner,
            hooks,
            base,
            idle_timeout,
            tracker,
        }
    }
}

impl<A, S> Accept<TcpStream, S> for ConnectionAcceptor<A>
where
    A: Accept<TcpStream, S> + Clone + Send + Sync + 'static,
    A::Stream: Send + 'static,
    A::Service: Send + 'static,
    A::Future: Send + 'static,
    S: Send + 'static,
{
    type Stream = TrackedStream<A::Stream>;
    type Service = ContextService<A::Service>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        let inner = self.inner.clone();
        let hooks = self.hooks.clone();
        let base = self.base.clone();
        let idle_timeout = self.idle_timeout;
        let tracker = self.tracker.clone();

        Box::pin(async move {
            let peer = stream.peer_addr()?;
            let connection = Connection::open(&tracker, peer, hooks.on_state.clone());

            // A failed handshake drops `connection`, reporting it closed.
            let (stream, service) = inner.accept(stream, service).await.map_err(|err| {
                tracing::debug!(peer = %peer, error = %err, "Connection handshake failed");
                err
            })?;

            let extensions = hooks.connection_extensions(&base, peer);
            Ok((
                TrackedStream::new(stream, connection.clone(), idle_timeout),
                ContextService::new(service, extensions, connection),
            ))
        })
    }
}
