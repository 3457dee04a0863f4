//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (net)
//!     → server.rs (hyper setup, header limits, timeouts, live handler)
//!     → middleware/ (request ID, timing, panic recovery, CORS, dump)
//!     → handler (opaque Router)
//!     → codec.rs (encode response values)
//!     → Send to client
//! ```

pub mod codec;
pub mod cors;
pub mod middleware;
pub mod request;
pub mod server;

pub use codec::{Codec, CodecError, Formatter, JsonCodec};
pub use cors::{CorsOptions, CorsPolicy};
pub use middleware::{sequence, MiddlewareOptions};
pub use request::{RequestId, RequestIdExt, RequestIdLayer, X_REQUEST_ID};
pub use server::{HttpServer, ServerBuilder, ServerConfig, ServerError, ServerHandle};
