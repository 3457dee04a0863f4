//! Request middleware stack.
//!
//! # Data Flow
//! ```text
//! Request
//!     → RequestIdLayer (assign or keep x-request-id)
//!     → TraceLayer (span per request)
//!     → timer.rs (request metrics, optional access log)
//!     → recover.rs (panic → 500)
//!     → cors (policy check, preflight answers)
//!     → dump.rs (debug dump of heads and bodies)
//!     → handler
//! ```
//!
//! # Design Decisions
//! - The order is fixed; options only switch layers on or off
//! - Panics are caught inside the timer so panicking requests are still
//!   logged and counted as 500s

pub mod dump;
pub mod recover;
pub mod timer;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::config::ObservabilityConfig;
use crate::http::cors::{self, CorsOptions, CorsPolicy};
use crate::http::request::RequestIdLayer;

pub use dump::dump;
pub use recover::handle_panic;
pub use timer::timer;

/// Which layers [`sequence`] applies.
#[derive(Debug, Clone)]
pub struct MiddlewareOptions {
    pub request_id: bool,
    pub trace: bool,
    /// Level of the access log written by the timer. `None` disables it.
    pub access_log: Option<Level>,
    pub catch_panics: bool,
    pub cors: Option<CorsOptions>,
    /// Body bytes shown by the dump. `None` disables dumping.
    pub dump_body_limit: Option<usize>,
}

impl Default for MiddlewareOptions {
    fn default() -> Self {
        Self {
            request_id: true,
            trace: true,
            access_log: Some(Level::INFO),
            catch_panics: true,
            cors: None,
            dump_body_limit: None,
        }
    }
}

impl MiddlewareOptions {
    pub fn from_config(config: &ObservabilityConfig, cors: Option<CorsOptions>) -> Self {
        Self {
            request_id: true,
            trace: true,
            access_log: config.access_log.then_some(Level::INFO),
            catch_panics: config.catch_panics,
            cors,
            dump_body_limit: config.dump_requests.then_some(config.dump_body_limit),
        }
    }
}

/// Wrap `router` in the middleware stack. The last layer added runs first.
pub fn sequence(router: Router, options: &MiddlewareOptions) -> Router {
    let mut router = router;

    if let Some(limit) = options.dump_body_limit {
        router = router.layer(from_fn_with_state(limit, dump));
    }
    if let Some(cors_options) = &options.cors {
        let policy = Arc::new(CorsPolicy::new(cors_options));
        router = router.layer(from_fn_with_state(policy, cors::enforce));
    }
    if options.catch_panics {
        router = router.layer(CatchPanicLayer::custom(handle_panic));
    }
    router = router.layer(from_fn_with_state(options.access_log, timer));
    if options.trace {
        router = router.layer(TraceLayer::new_for_http());
    }
    if options.request_id {
        router = router.layer(RequestIdLayer);
    }

    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{Body, Bytes};
    use axum::http::{header, Request, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use futures_util::{stream, StreamExt};
    use tower::ServiceExt;

    use crate::http::request::X_REQUEST_ID;

    async fn boom() -> &'static str {
        panic!("handler exploded")
    }

    /// One event, then the stream stays open.
    async fn events() -> impl IntoResponse {
        let first = stream::once(async {
            Ok::<_, std::io::Error>(Bytes::from_static(b"data: 1\n\n"))
        });
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(first.chain(stream::pending())),
        )
    }

    fn debug_subscriber() -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_test_writer()
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn app(options: &MiddlewareOptions) -> Router {
        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/echo", post(|body: Bytes| async move { body }))
            .route("/events", get(events))
            .route("/boom", get(boom));
        sequence(router, options)
    }

    async fn body_of(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn panics_become_500_with_request_id() {
        let response = app(&MiddlewareOptions::default())
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(&X_REQUEST_ID));
        assert_eq!(body_of(response).await, "Internal Server Error");
    }

    #[tokio::test]
    async fn cors_layer_answers_preflight() {
        let options = MiddlewareOptions {
            cors: Some(CorsOptions {
                allow_origins: vec!["https://app.example".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = app(&options)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/")
                    .header("origin", "https://app.example")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://app.example"
        );
    }

    #[tokio::test]
    async fn dump_re_emits_bodies_unchanged() {
        let _guard = debug_subscriber();

        let options = MiddlewareOptions {
            dump_body_limit: Some(4),
            ..Default::default()
        };
        let response = app(&options)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("a body longer than the limit"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "a body longer than the limit");
    }

    #[tokio::test]
    async fn dump_passes_binary_bodies_through() {
        let _guard = debug_subscriber();

        let options = MiddlewareOptions {
            dump_body_limit: Some(4),
            ..Default::default()
        };
        let payload = vec![0u8, 0xff, 0x10, 0x80, 0x7f];
        let response = app(&options)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.to_vec(), payload);
    }

    #[tokio::test]
    async fn dump_does_not_hold_back_streams() {
        let _guard = debug_subscriber();

        let options = MiddlewareOptions {
            dump_body_limit: Some(16),
            ..Default::default()
        };
        let response = tokio::time::timeout(
            Duration::from_secs(2),
            app(&options).oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap()),
        )
        .await
        .expect("stream response was held back")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("first event was held back")
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"data: 1\n\n");
    }

    #[tokio::test]
    async fn bare_stack_still_serves() {
        let options = MiddlewareOptions {
            request_id: false,
            trace: false,
            access_log: None,
            catch_panics: false,
            cors: None,
            dump_body_limit: None,
        };
        let response = app(&options)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(&X_REQUEST_ID));
    }

    #[test]
    fn options_follow_config() {
        let config = ObservabilityConfig {
            access_log: false,
            dump_requests: true,
            dump_body_limit: 128,
            catch_panics: false,
            ..Default::default()
        };
        let options = MiddlewareOptions::from_config(&config, None);
        assert_eq!(options.access_log, None);
        assert_eq!(options.dump_body_limit, Some(128));
        assert!(!options.catch_panics);
    }
}
