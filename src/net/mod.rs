//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → acceptor.rs (connection hooks, optional TLS handshake)
//!     → tls.rs (certificate material for the handshake)
//!     → connection.rs (lifecycle tracking, idle timeout, request context)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     New → Active ⇄ Idle → Closed
//! ```
//!
//! # Design Decisions
//! - Each connection tracked so shutdown can wait for the drain
//! - TLS is optional and handled transparently by the wrapped acceptor

pub mod acceptor;
pub mod connection;
pub mod tls;

pub use acceptor::ConnectionAcceptor;
pub use connection::{ConnState, ConnectionHooks, ConnectionTracker};
pub use tls::{load_client_roots, CertifiedKeyPair, ClientAuth, TlsError, TlsMaterial};
