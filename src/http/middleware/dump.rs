//! Request and response dumping.
//!
//! Only active while debug logging is enabled; otherwise requests stream
//! through untouched. A body is buffered for the log only when its content
//! type is human readable and its length is known and at most
//! [`MAX_BUFFERED_BODY`]. Everything else is logged as a placeholder and
//! passed through as it arrived, so streaming responses keep streaming.

use axum::body::{Body, Bytes, HttpBody};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::Level;

use crate::http::request::RequestIdExt;
use crate::observability::logging::enabled_at;

/// Largest body the dump will hold in memory.
pub const MAX_BUFFERED_BODY: usize = 1 << 20;

const BINARY_BODY: &str = "<binary body>";
const STREAMING_BODY: &str = "<streaming body>";

const READABLE_APPLICATION_TYPES: &[&str] = &[
    "json",
    "ld+json",
    "problem+json",
    "xml",
    "atom+xml",
    "problem+xml",
    "rss+xml",
    "soap+xml",
    "xhtml+xml",
    "graphql",
    "javascript",
    "x-javascript",
    "x-www-form-urlencoded",
];

/// Middleware logging heads and up to `limit` bytes of each body.
/// Use with `from_fn_with_state(limit, dump)`.
pub async fn dump(State(limit): State<usize>, request: Request, next: Next) -> Response {
    if !enabled_at(Level::DEBUG) {
        return next.run(request).await;
    }

    let request_id = request
        .request_id()
        .map(ToString::to_string)
        .unwrap_or_default();

    let (parts, body) = request.into_parts();
    let (body, dumped) = match capture(&parts.headers, body).await {
        Ok(captured) => captured,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Failed to buffer request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        uri = %parts.uri,
        version = ?parts.version,
        headers = ?parts.headers,
        body = %dumped.render(limit),
        "request dump"
    );

    let response = next.run(Request::from_parts(parts, body)).await;

    let (parts, body) = response.into_parts();
    let (body, dumped) = match capture(&parts.headers, body).await {
        Ok(captured) => captured,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    tracing::debug!(
        request_id = %request_id,
        status = %parts.status,
        headers = ?parts.headers,
        body = %dumped.render(limit),
        "response dump"
    );

    Response::from_parts(parts, body)
}

/// Whether a body with this `Content-Type` is worth logging as text.
/// A missing or malformed value counts as binary.
pub fn is_human_readable(content_type: Option<&HeaderValue>) -> bool {
    let Some(value) = content_type.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let essence = value.split(';').next().unwrap_or_default().trim();
    let Some((kind, subtype)) = essence.split_once('/') else {
        return false;
    };
    let subtype = subtype.to_ascii_lowercase();
    match kind.to_ascii_lowercase().as_str() {
        "text" => !subtype.is_empty(),
        "application" => READABLE_APPLICATION_TYPES.contains(&subtype.as_str()),
        _ => false,
    }
}

#[derive(Debug, PartialEq)]
enum Dumped {
    Empty,
    Text(Bytes),
    Placeholder(&'static str),
}

impl Dumped {
    fn render(&self, limit: usize) -> String {
        match self {
            Dumped::Empty => String::new(),
            Dumped::Text(bytes) => preview(bytes, limit),
            Dumped::Placeholder(text) => (*text).to_string(),
        }
    }
}

/// Take what the log needs from `body` and hand back a body to forward.
async fn capture(headers: &HeaderMap, body: Body) -> Result<(Body, Dumped), axum::Error> {
    let upper = body.size_hint().upper();
    if upper == Some(0) {
        return Ok((body, Dumped::Empty));
    }
    if !is_human_readable(headers.get(CONTENT_TYPE)) {
        return Ok((body, Dumped::Placeholder(BINARY_BODY)));
    }
    match upper {
        Some(len) if len <= MAX_BUFFERED_BODY as u64 => {
            let bytes = axum::body::to_bytes(body, MAX_BUFFERED_BODY).await?;
            Ok((Body::from(bytes.clone()), Dumped::Text(bytes)))
        }
        _ => Ok((body, Dumped::Placeholder(STREAMING_BODY))),
    }
}

fn preview(bytes: &Bytes, limit: usize) -> String {
    let shown = &bytes[..bytes.len().min(limit)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if bytes.len() > limit {
        text.push_str("...");
    }
    text
}
