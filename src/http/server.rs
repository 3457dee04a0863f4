//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Hold the mutable builder for the next run and bake it into an
//!   immutable `ServerConfig` snapshot
//! - Bind the listener and run the plain or TLS accept loop
//! - Wire connection hooks, header limits and timeouts into hyper
//! - Graceful shutdown bounded by a grace period
//!
//! # Design Decisions
//! - The listener is bound by us, not by axum-server, so bind failures are
//!   reported with the address and the bound port is known before serving
//! - The handler is read through an `ArcSwap` so it can be replaced between
//!   requests without a restart; everything else is fixed for the run

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::extract::Request;
use axum::Router;
use axum_server::accept::DefaultAcceptor;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;

use crate::config::{ClientAuthMode, ConfigError, ServiceConfig, TlsConfig};
use crate::net::tls::{load_client_roots, ClientAuth, TlsError};
use crate::net::{ConnectionAcceptor, ConnectionHooks, ConnectionTracker, TlsMaterial};

/// Default maximum size of request headers (1 MiB).
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Smallest header buffer hyper accepts.
pub const MIN_MAX_HEADER_BYTES: usize = 8192;

/// Errors produced by a server run.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("HTTP server bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server accept loop: {0}")]
    Serve(#[source] std::io::Error),

    #[error("HTTP server TLS: {0}")]
    Tls(#[from] TlsError),

    #[error("HTTP server shutdown: grace period of {grace:?} exceeded with {remaining} connection(s) open")]
    ShutdownTimeout { grace: Duration, remaining: usize },

    #[error("HTTP server controller is already started")]
    AlreadyStarted,
}

/// Mutable configuration for the next run.
///
/// The controller keeps one builder for its whole lifetime, so every field
/// survives a restart unless the startup hook or the owner changes it.
/// `address`, `tls` and `hooks` only take effect on the next run.
#[derive(Debug, Clone)]
pub struct ServerBuilder {
    /// Address to bind. Port 0 picks a fresh port on every run.
    pub address: SocketAddr,
    /// Request handler. Opaque to the controller.
    pub handler: Router,
    /// TLS material; `None` or an empty set serves plaintext.
    pub tls: Option<TlsMaterial>,
    /// Time allowed for reading request headers.
    pub read_header_timeout: Option<Duration>,
    /// Deadline for handling a whole request (answered 408 when exceeded).
    pub request_timeout: Option<Duration>,
    /// Time a keep-alive connection may sit idle between requests.
    pub idle_timeout: Option<Duration>,
    /// Header buffer limit, at least 8 KiB.
    pub max_header_bytes: usize,
    /// HTTP/1 keep-alive.
    pub keep_alive: bool,
    /// Label attached to every log line of the server.
    pub name: String,
    /// Connection-level callbacks.
    pub hooks: ConnectionHooks,
}

impl ServerBuilder {
    pub fn new(address: SocketAddr, handler: Router) -> Self {
        Self {
            address,
            handler,
            tls: None,
            read_header_timeout: None,
            request_timeout: None,
            idle_timeout: None,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            keep_alive: true,
            name: "rebind".to_string(),
            hooks: ConnectionHooks::default(),
        }
    }

    /// Builder for a service config file. TLS files are loaded here.
    pub fn from_config(config: &ServiceConfig, handler: Router) -> Result<Self, ConfigError> {
        let address = config.listener.socket_addr()?;
        let mut builder = Self::new(address, handler);
        builder.apply_config(config)?;
        Ok(builder)
    }

    /// Apply a (re)loaded service config. Handler and hooks are kept.
    pub fn apply_config(&mut self, config: &ServiceConfig) -> Result<(), ConfigError> {
        self.address = config.listener.socket_addr()?;
        self.tls = match &config.tls {
            Some(tls) => Some(tls_material(tls).map_err(ConfigError::Tls)?),
            None => None,
        };
        self.read_header_timeout = config.timeouts.read_header();
        self.request_timeout = config.timeouts.request();
        self.idle_timeout = config.timeouts.idle();
        self.max_header_bytes = config.listener.max_header_bytes;
        self.keep_alive = config.listener.keep_alive;
        self.name = config.listener.name.clone();
        Ok(())
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_read_header_timeout(mut self, timeout: Duration) -> Self {
        self.read_header_timeout = Some(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_header_bytes(mut self, bytes: usize) -> Self {
        self.max_header_bytes = bytes;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_hooks(mut self, hooks: ConnectionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Prepare the builder for the run after a restart.
    ///
    /// TLS material whose certificates were all removed is dropped, so the
    /// next run serves plaintext instead of a listener with nothing to offer.
    pub fn carry_forward(&mut self) {
        if self.tls.as_ref().is_some_and(TlsMaterial::is_empty) {
            tracing::warn!(
                address = %self.address,
                "TLS material holds no certificates, next run serves plaintext"
            );
            self.tls = None;
        }
    }

    /// Bake an immutable snapshot for one run.
    pub fn build(&self) -> ServerConfig {
        ServerConfig {
            address: self.address,
            handler: self.handler.clone(),
            tls: self.tls.clone().filter(|tls| !tls.is_empty()),
            read_header_timeout: self.read_header_timeout,
            request_timeout: self.request_timeout,
            idle_timeout: self.idle_timeout,
            max_header_bytes: self.max_header_bytes.max(MIN_MAX_HEADER_BYTES),
            keep_alive: self.keep_alive,
            name: self.name.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

fn tls_material(tls: &TlsConfig) -> Result<TlsMaterial, TlsError> {
    let material = TlsMaterial::from_pem_files(&tls.cert_path, &tls.key_path)?
        .with_alpn(tls.alpn.iter().map(String::as_bytes));
    let Some(ca_path) = &tls.client_ca_path else {
        return Ok(material);
    };
    let roots = load_client_roots(ca_path)?;
    let client_auth = match tls.client_auth {
        ClientAuthMode::Required => ClientAuth::Required(roots),
        ClientAuthMode::Optional => ClientAuth::Optional(roots),
    };
    Ok(material.with_client_auth(client_auth))
}

/// Configuration of one run. Never changes while the run is serving.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    address: SocketAddr,
    handler: Router,
    tls: Option<TlsMaterial>,
    read_header_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    max_header_bytes: usize,
    keep_alive: bool,
    name: String,
    hooks: ConnectionHooks,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether this run serves TLS.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn tls(&self) -> Option<&TlsMaterial> {
        self.tls.as_ref()
    }

    pub fn read_header_timeout(&self) -> Option<Duration> {
        self.read_header_timeout
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Cloneable handle to one run's server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    inner: axum_server::Handle,
    local_addr: Arc<OnceLock<SocketAddr>>,
    handler: Arc<ArcSwap<Router>>,
    tracker: ConnectionTracker,
}

impl ServerHandle {
    pub fn new() -> Self {
        Self {
            inner: axum_server::Handle::new(),
            local_addr: Arc::new(OnceLock::new()),
            handler: Arc::new(ArcSwap::from_pointee(Router::new())),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Address the run is bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Open connections of the run.
    pub fn connection_count(&self) -> usize {
        usize::try_from(self.tracker.active_count()).unwrap_or(usize::MAX)
    }

    /// Swap the handler served by the run. Requests already dispatched keep
    /// the handler they started with.
    pub fn replace_handler(&self, handler: Router) {
        self.handler.store(Arc::new(handler));
    }

    /// Stop accepting, then wait up to `grace` for open connections to finish.
    /// Connections still open after `grace` are closed by force.
    ///
    /// Calling this before the run starts serving makes the run stop as soon
    /// as it starts.
    ///
    /// The grace timer is ours rather than axum-server's so the connections
    /// left open are counted before they are closed.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ServerError> {
        self.inner.graceful_shutdown(None);

        if tokio::time::timeout(grace, self.tracker.drained()).await.is_ok() {
            return Ok(());
        }

        let remaining = self.connection_count();
        self.inner.shutdown();
        Err(ServerError::ShutdownTimeout { grace, remaining })
    }
}

impl Default for ServerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A single run of an HTTP server.
pub struct HttpServer {
    config: ServerConfig,
    handle: ServerHandle,
}

impl HttpServer {
    /// Create a server for one run with a fresh handle.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handle(config, ServerHandle::new())
    }

    /// Create a server driven by an existing handle.
    pub fn with_handle(config: ServerConfig, handle: ServerHandle) -> Self {
        handle.replace_handler(config.handler.clone());
        Self { config, handle }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Serve with TLS when the config carries certificates, plaintext otherwise.
    pub async fn serve(self) -> Result<(), ServerError> {
        if self.config.is_secure() {
            self.listen_and_serve_tls().await
        } else {
            self.listen_and_serve().await
        }
    }

    /// Bind and serve plaintext until shut down. `Ok` means a graceful stop.
    pub async fn listen_and_serve(self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.run(listener, None).await
    }

    /// Bind and serve TLS until shut down. `Ok` means a graceful stop.
    pub async fn listen_and_serve_tls(self) -> Result<(), ServerError> {
        let tls = self.config.tls.as_ref().ok_or(TlsError::Empty)?;
        let rustls = RustlsConfig::from_config(tls.server_config()?);
        let listener = self.bind()?;
        self.run(listener, Some(rustls)).await
    }

    fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.address;
        let bind_error = |source| ServerError::Bind { addr, source };

        let listener = TcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        let _ = self.handle.local_addr.set(local_addr);

        Ok(listener)
    }

    async fn run(self, listener: TcpListener, tls: Option<RustlsConfig>) -> Result<(), ServerError> {
        let local_addr = listener.local_addr().map_err(ServerError::Serve)?;
        tracing::info!(
            address = %local_addr,
            secure = tls.is_some(),
            "HTTP server serving"
        );

        let mut server = axum_server::from_tcp(listener).handle(self.handle.inner.clone());
        self.configure_http(server.http_builder());

        let base = self.config.hooks.base_extensions(local_addr);
        let hooks = self.config.hooks.clone();
        let idle = self.config.idle_timeout;
        let tracker = self.handle.tracker.clone();
        let app = self
            .app()
            .into_make_service_with_connect_info::<SocketAddr>();

        let result = match tls {
            Some(rustls) => {
                let acceptor = ConnectionAcceptor::new(
                    RustlsAcceptor::new(rustls),
                    hooks,
                    base,
                    idle,
                    tracker,
                );
                server.acceptor(acceptor).serve(app).await
            }
            None => {
                let acceptor =
                    ConnectionAcceptor::new(DefaultAcceptor::new(), hooks, base, idle, tracker);
                server.acceptor(acceptor).serve(app).await
            }
        };

        tracing::info!(address = %local_addr, "HTTP server stopped");
        result.map_err(ServerError::Serve)
    }

    fn configure_http(&self, builder: &mut auto::Builder<TokioExecutor>) {
        let mut http1 = builder.http1();
        http1
            .keep_alive(self.config.keep_alive)
            .max_buf_size(self.config.max_header_bytes);
        if let Some(timeout) = self.config.read_header_timeout {
            http1.timer(TokioTimer::new()).header_read_timeout(timeout);
        }

        let header_list = u32::try_from(self.config.max_header_bytes).unwrap_or(u32::MAX);
        builder.http2().max_header_list_size(header_list);
    }

    /// Router served by the run: dispatches to the swappable handler.
    #[allow(deprecated)]
    fn app(&self) -> Router {
        let handler = Arc::clone(&self.handle.handler);
        let dispatch = tower::service_fn(move |request: Request| {
            let router = handler.load_full();
            async move { Router::clone(&router).oneshot(request).await }
        });

        let app = Router::new().fallback_service(dispatch);
        match self.config.request_timeout {
            Some(timeout) => app.layer(TimeoutLayer::new(timeout)),
            None => app,
        }
    }
}
