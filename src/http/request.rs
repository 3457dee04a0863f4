//! Request identification.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) when the client sent none
//! - Make the ID available to handlers and middleware as an extension
//! - Echo the ID on the response for client-side correlation
//!
//! # Design Decisions
//! - Built on tower-http's `SetRequestId` and `PropagateRequestId`
//! - Request ID added as early as possible for tracing
//! - A client-supplied `x-request-id` is kept as sent

use axum::http::{HeaderName, Request};
use tower::Layer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestId, SetRequestId};

pub use tower_http::request_id::RequestId;

/// Header carrying the request ID.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Access to the request ID of a request.
pub trait RequestIdExt {
    /// The ID as text. `None` before the layer ran or when the header value
    /// is not visible ASCII.
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
    }
}

/// Layer that assigns request IDs and echoes them on the response.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = SetRequestId<PropagateRequestId<S>, MakeRequestUuid>;

    fn layer(&self, inner: S) -> Self::Service {
        SetRequestId::new(
            PropagateRequestId::new(inner, X_REQUEST_ID),
            X_REQUEST_ID,
            MakeRequestUuid,
        )
    }
}
