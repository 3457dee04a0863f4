//! Body codecs and response formatting.
//!
//! # Responsibilities
//! - Encode handler values into response bodies and decode request bodies
//! - Advertise the content type of the encoding
//! - Log encoder and decoder traffic at a configurable level
//!
//! # Design Decisions
//! - `Codec` is generic over serde types, so handlers keep static types
//!   and the codec is chosen once per formatter
//! - An encode failure after the status was chosen answers 500 instead

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::Level;

use crate::observability::logging::{enabled_at, event_at};

/// Content type used when the codec names none.
pub const FALLBACK_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode: {0}")]
    Decode(#[source] serde_json::Error),
}

/// An encoding for request and response bodies.
pub trait Codec: Send + Sync {
    /// Value for the `content-type` header. May be empty.
    fn content_type(&self) -> &str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by serde_json.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    content_type: String,
    level: Level,
    raw: bool,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self {
            content_type: "application/json".to_string(),
            level: Level::TRACE,
            raw: false,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Level at which encoded and decoded payloads are logged.
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Log payloads as hex bytes instead of text.
    pub fn with_raw_bytes_logging(mut self) -> Self {
        self.raw = true;
        self
    }

    fn log_payload(&self, message: &'static str, bytes: &[u8]) {
        if !enabled_at(self.level) {
            return;
        }
        if self.raw {
            let hex = bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            event_at!(self.level, len = bytes.len(), bytes = %hex, "{}", message);
        } else {
            let text = String::from_utf8_lossy(bytes);
            event_at!(self.level, len = bytes.len(), value = %text, "{}", message);
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let bytes = serde_json::to_vec(value).map_err(CodecError::Encode)?;
        self.log_payload("encoder output", &bytes);
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.log_payload("decoder input", bytes);
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// Writes handler values as responses through a codec.
#[derive(Debug, Clone, Default)]
pub struct Formatter<C> {
    codec: C,
}

impl<C: Codec> Formatter<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Status with an optional encoded body.
    pub fn write_response<T: Serialize>(&self, status: StatusCode, value: Option<&T>) -> Response {
        self.respond(status, HeaderMap::new(), value)
    }

    /// Like [`write_response`](Self::write_response), keeping any headers
    /// already chosen by the handler. A preset `content-type` wins.
    pub fn respond<T: Serialize>(
        &self,
        status: StatusCode,
        mut headers: HeaderMap,
        value: Option<&T>,
    ) -> Response {
        let Some(value) = value else {
            return (status, headers).into_response();
        };

        let bytes = match self.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "encode response");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        if !headers.contains_key(header::CONTENT_TYPE) {
            let content_type = match self.codec.content_type() {
                "" => FALLBACK_CONTENT_TYPE,
                ct => ct,
            };
            let value = HeaderValue::from_str(content_type)
                .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_CONTENT_TYPE));
            headers.insert(header::CONTENT_TYPE, value);
        }

        (status, headers, Body::from(bytes)).into_response()
    }

    /// Decode a request body.
    pub fn decode<T: DeserializeOwned>(&self, body: &Bytes) -> Result<T, CodecError> {
        self.codec.decode(body)
    }
}
