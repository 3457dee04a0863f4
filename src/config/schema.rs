//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::loader::ConfigError;
use crate::config::validation::ValidationError;
use crate::http::cors::CorsOptions;

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener configuration (bind address, header limits).
    pub listener: ListenerConfig,

    /// Optional TLS configuration. Absent means plaintext.
    pub tls: Option<TlsConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Optional CORS policy applied to every response.
    pub cors: Option<CorsOptions>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Label attached to every log line of the server.
    pub name: String,

    /// HTTP/1 keep-alive.
    pub keep_alive: bool,

    /// Maximum size of request headers in bytes.
    pub max_header_bytes: usize,
}

impl ListenerConfig {
    /// Parsed bind address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address.parse().map_err(|_| {
            ConfigError::Validation(vec![ValidationError::InvalidBindAddress(
                self.bind_address.clone(),
            )])
        })
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            name: "rebind".to_string(),
            keep_alive: true,
            max_header_bytes: 1 << 20,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,

    /// ALPN protocols to advertise. Empty advertises h2 and http/1.1.
    #[serde(default)]
    pub alpn: Vec<String>,

    /// CA certificates (PEM) that client certificates must chain to.
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,

    /// Whether a client certificate is required once `client_ca_path` is set.
    #[serde(default)]
    pub client_auth: ClientAuthMode,
}

/// How client certificates are treated when client CAs are configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    #[default]
    Required,
    Optional,
}

/// Timeout configuration. A value of 0 disables the timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed for reading request headers, in seconds.
    pub read_header_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Idle keep-alive connection timeout in seconds.
    pub idle_secs: u64,

    /// Grace period for draining connections on shutdown, in seconds.
    pub graceful_secs: u64,
}

impl TimeoutConfig {
    pub fn read_header(&self) -> Option<Duration> {
        non_zero_secs(self.read_header_secs)
    }

    pub fn request(&self) -> Option<Duration> {
        non_zero_secs(self.request_secs)
    }

    pub fn idle(&self) -> Option<Duration> {
        non_zero_secs(self.idle_secs)
    }

    pub fn graceful(&self) -> Duration {
        Duration::from_secs(self.graceful_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_header_secs: 10,
            request_secs: 30,
            idle_secs: 60,
            graceful_secs: 30,
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON instead of the pretty format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Log every request with its status and duration.
    pub access_log: bool,

    /// Log request and response bodies at debug level.
    pub dump_requests: bool,

    /// Bytes of each body included in a dump.
    pub dump_body_limit: usize,

    /// Turn handler panics into 500 responses.
    pub catch_panics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            access_log: true,
            dump_requests: false,
            dump_body_limit: 4096,
            catch_panics: true,
        }
    }
}
