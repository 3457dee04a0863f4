//! Request timing.
//! Logs each finished request and records request metrics.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Level;

use crate::http::request::RequestIdExt;
use crate::observability::logging::{enabled_at, event_at};
use crate::observability::metrics;

/// Middleware measuring how long the inner handler takes.
/// Use with `from_fn_with_state(Some(level), timer)`; `None` records metrics
/// without logging.
pub async fn timer(State(level): State<Option<Level>>, request: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .request_id()
        .map(ToString::to_string)
        .unwrap_or_default();

    let response = next.run(request).await;
    let status = response.status().as_u16();

    metrics::record_request(method.as_str(), status, start_time);
    if let Some(level) = level.filter(|l| enabled_at(*l)) {
        event_at!(
            level,
            request_id = %request_id,
            method = %method,
            uri = %uri,
            status,
            duration = ?start_time.elapsed(),
            "finished"
        );
    }

    response
}
