//! Cross-origin resource sharing.
//!
//! # Responsibilities
//! - Decide per request whether the origin, method and headers are allowed
//! - Answer preflight requests without reaching the handler
//! - Decorate allowed requests with the CORS response headers
//!
//! # Design Decisions
//! - Evaluation is a pure function of the request head (`CorsPolicy::evaluate`)
//!   so it can be tested without a server; `enforce` only applies the verdict
//! - A disallowed origin gets an empty 200 with no CORS headers, which the
//!   browser treats as a failure without leaking the policy
//! - Headers set by the handler win over the policy's headers

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

const VARY_VALUE: &str = "Origin, Access-Control-Request-Method, Access-Control-Request-Headers";
const PRIVATE_NETWORK: &str = "private-network";
const ALLOW_PRIVATE_NETWORK: &str = "access-control-allow-private-network";

/// Dynamic origin check, consulted before the static origin list.
pub type OriginPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// CORS configuration.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsOptions {
    /// Allowed origins. Containing `*` allows all; empty allows none unless
    /// `allow_origin_fn` accepts the origin.
    pub allow_origins: Vec<String>,

    /// Allowed methods. Empty or containing `*` allows all.
    pub allow_methods: Vec<String>,

    /// Allowed request headers. Empty or containing `*` allows all.
    pub allow_headers: Vec<String>,

    /// Response headers scripts may read.
    pub expose_headers: Vec<String>,

    /// Seconds a preflight answer may be cached. 0 omits the header.
    pub max_age: u64,

    pub allow_credentials: bool,

    /// Answer the Private Network Access preflight extension.
    pub allow_private_network: bool,

    /// Let non-preflight requests without an `Origin` header through.
    pub skip_strict_origin_check: bool,

    #[serde(skip)]
    pub allow_origin_fn: Option<OriginPredicate>,
}

impl CorsOptions {
    pub fn with_origin_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.allow_origin_fn = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for CorsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorsOptions")
            .field("allow_origins", &self.allow_origins)
            .field("allow_methods", &self.allow_methods)
            .field("allow_headers", &self.allow_headers)
            .field("expose_headers", &self.expose_headers)
            .field("max_age", &self.max_age)
            .field("allow_credentials", &self.allow_credentials)
            .field("allow_private_network", &self.allow_private_network)
            .field("skip_strict_origin_check", &self.skip_strict_origin_check)
            .field("allow_origin_fn", &self.allow_origin_fn.is_some())
            .finish()
    }
}

/// Outcome of evaluating a request against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsDecision {
    /// Stop with an empty 200 and no CORS headers.
    Reject,
    /// Call the handler without CORS headers.
    PassThrough,
    /// Answer 204 with these headers.
    Preflight(HeaderMap),
    /// Call the handler, then add these headers.
    Simple(HeaderMap),
}

enum Origins {
    Any,
    Listed {
        allowed: HashSet<String>,
        predicate: Option<OriginPredicate>,
    },
}

/// Compiled CORS policy.
pub struct CorsPolicy {
    origins: Origins,
    methods: Option<HashSet<String>>,
    allowed_methods: String,
    headers: Option<HashSet<String>>,
    allowed_headers: String,
    expose_headers: String,
    max_age: u64,
    allow_credentials: bool,
    allow_private_network: bool,
    skip_strict_origin_check: bool,
}

impl CorsPolicy {
    pub fn new(options: &CorsOptions) -> Self {
        let origins: Vec<String> = options
            .allow_origins
            .iter()
            .map(|o| o.trim().to_string())
            .collect();
        let origins = if origins.iter().any(|o| o == "*") {
            Origins::Any
        } else {
            Origins::Listed {
                allowed: origins.into_iter().collect(),
                predicate: options.allow_origin_fn.clone(),
            }
        };

        let methods: Vec<String> = options
            .allow_methods
            .iter()
            .map(|m| m.trim().to_uppercase())
            .collect();
        let (methods, allowed_methods) = restrict(methods);

        let headers: Vec<String> = options
            .allow_headers
            .iter()
            .map(|h| canonical_header_key(h.trim()))
            .collect();
        let (headers, allowed_headers) = restrict(headers);

        let expose_headers = options
            .expose_headers
            .iter()
            .map(|h| canonical_header_key(h.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            origins,
            methods,
            allowed_methods,
            headers,
            allowed_headers,
            expose_headers,
            max_age: options.max_age,
            allow_credentials: options.allow_credentials,
            allow_private_network: options.allow_private_network,
            skip_strict_origin_check: options.skip_strict_origin_check,
        }
    }

    /// Origin value to answer with, or `None` when the origin is not allowed.
    fn allowed_origin(&self, origin: &str) -> Option<String> {
        match &self.origins {
            Origins::Any if self.allow_credentials => {
                (!origin.is_empty()).then(|| origin.to_string())
            }
            Origins::Any => Some("*".to_string()),
            Origins::Listed { allowed, predicate } => {
                if origin.is_empty() {
                    return None;
                }
                let by_predicate = predicate.as_ref().is_some_and(|f| f(origin));
                (by_predicate || allowed.contains(origin)).then(|| origin.to_string())
            }
        }
    }

    fn method_allowed(&self, method: &str) -> bool {
        match &self.methods {
            None => true,
            Some(methods) => methods.contains(&method.to_uppercase()),
        }
    }

    fn headers_allowed(&self, requested: &str) -> bool {
        match &self.headers {
            None => true,
            Some(headers) => requested
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .all(|h| headers.contains(&canonical_header_key(h))),
        }
    }

    /// Evaluate a request head.
    pub fn evaluate(&self, method: &Method, headers: &HeaderMap) -> CorsDecision {
        let origin_header = header_str(headers, header::ORIGIN);
        let preflight = method == Method::OPTIONS;

        let Some(origin) = self.allowed_origin(origin_header) else {
            if !preflight && self.skip_strict_origin_check && origin_header.is_empty() {
                return CorsDecision::PassThrough;
            }
            return CorsDecision::Reject;
        };
        let Ok(origin) = HeaderValue::from_str(&origin) else {
            return CorsDecision::Reject;
        };

        let request_method = header_str(headers, header::ACCESS_CONTROL_REQUEST_METHOD);
        let request_headers = header_str(headers, header::ACCESS_CONTROL_REQUEST_HEADERS);
        if preflight && !(self.method_allowed(request_method) && self.headers_allowed(request_headers)) {
            return CorsDecision::Reject;
        }

        let mut out = HeaderMap::new();
        out.insert(header::VARY, HeaderValue::from_static(VARY_VALUE));
        out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        if self.allow_credentials {
            out.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }

        if !preflight {
            insert_str(&mut out, header::ACCESS_CONTROL_EXPOSE_HEADERS, &self.expose_headers);
            return CorsDecision::Simple(out);
        }

        if !self.allowed_methods.is_empty() {
            insert_str(&mut out, header::ACCESS_CONTROL_ALLOW_METHODS, &self.allowed_methods);
        } else {
            insert_str(
                &mut out,
                header::ACCESS_CONTROL_ALLOW_METHODS,
                &request_method.to_uppercase(),
            );
        }

        if !self.allowed_headers.is_empty() {
            insert_str(&mut out, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.allowed_headers);
        } else {
            insert_str(&mut out, header::ACCESS_CONTROL_ALLOW_HEADERS, request_headers);
        }

        if self.max_age > 0 {
            out.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age));
        }

        if self.allow_private_network
            && header_str(headers, PRIVATE_NETWORK).eq_ignore_ascii_case("true")
        {
            out.insert(ALLOW_PRIVATE_NETWORK, HeaderValue::from_static("true"));
        }

        CorsDecision::Preflight(out)
    }
}

impl From<&CorsOptions> for CorsPolicy {
    fn from(options: &CorsOptions) -> Self {
        Self::new(options)
    }
}

/// Middleware applying a [`CorsPolicy`]. Use with `from_fn_with_state`.
pub async fn enforce(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match policy.evaluate(request.method(), request.headers()) {
        CorsDecision::Reject => {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                "CORS check failed"
            );
            StatusCode::OK.into_response()
        }
        CorsDecision::PassThrough => next.run(request).await,
        CorsDecision::Preflight(headers) => (StatusCode::NO_CONTENT, headers).into_response(),
        CorsDecision::Simple(headers) => {
            let mut response = next.run(request).await;
            for (name, value) in &headers {
                if !response.headers().contains_key(name) {
                    response.headers_mut().insert(name.clone(), value.clone());
                }
            }
            response
        }
    }
}

/// `None` means "allow all"; otherwise the set and its joined display form.
fn restrict(values: Vec<String>) -> (Option<HashSet<String>>, String) {
    if values.is_empty() || values.iter().any(|v| v == "*") {
        return (None, String::new());
    }
    let joined = values.join(", ");
    (Some(values.into_iter().collect()), joined)
}

fn header_str<K: header::AsHeaderName>(headers: &HeaderMap, name: K) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn insert_str(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// `content-type` → `Content-Type`.
fn canonical_header_key(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
