//! Listening-server lifecycle controller.
//!
//! Runs an axum `Router` behind a controller that can start it, shut it down
//! gracefully on SIGINT/SIGTERM or on request, and restart it in place with
//! a new configuration without ever running two listeners at once.
//!
//! ```text
//!   Controller ──bake──▶ ServerConfig ──▶ HttpServer ──▶ ConnectionAcceptor
//!       ▲   │                                 │                │
//!       │   └── ServerBuilder (next run)      │                └─ plain | rustls
//!       │                                     ▼
//!   SignalSource ──▶ per-run channel ──▶ ServerHandle::shutdown(grace)
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::{load_config, ConfigError, ServiceConfig};
pub use http::{HttpServer, ServerBuilder, ServerConfig, ServerError, ServerHandle};
pub use lifecycle::{Controller, ManualSignals, OsSignals, Phase, Signal, SignalSource};
pub use net::{ConnState, ConnectionHooks, TlsMaterial};
