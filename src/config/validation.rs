//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses and value ranges
//! - Check TLS paths are present before any file is read
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ServiceConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBindAddress(String),
    InvalidMetricsAddress(String),
    ZeroMaxHeaderBytes,
    EmptyCertPath,
    EmptyKeyPath,
    EmptyClientCaPath,
    UnknownLogLevel(String),
    InvalidCorsMethod(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidBindAddress(addr) => {
                write!(f, "listener.bind_address '{}' is not a socket address", addr)
            }
            ValidationError::InvalidMetricsAddress(addr) => {
                write!(f, "observability.metrics_address '{}' is not a socket address", addr)
            }
            ValidationError::ZeroMaxHeaderBytes => {
                write!(f, "listener.max_header_bytes must be greater than 0")
            }
            ValidationError::EmptyCertPath => write!(f, "tls.cert_path is empty"),
            ValidationError::EmptyKeyPath => write!(f, "tls.key_path is empty"),
            ValidationError::EmptyClientCaPath => write!(f, "tls.client_ca_path is empty"),
            ValidationError::UnknownLogLevel(level) => {
                write!(f, "observability.log_level '{}' is not a known level", level)
            }
            ValidationError::InvalidCorsMethod(method) => {
                write!(f, "cors.allow_methods entry '{}' is not an HTTP method", method)
            }
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_header_bytes == 0 {
        errors.push(ValidationError::ZeroMaxHeaderBytes);
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyCertPath);
        }
        if tls.key_path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyKeyPath);
        }
        if tls
            .client_ca_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            errors.push(ValidationError::EmptyClientCaPath);
        }
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_lowercase().as_str()) {
        errors.push(ValidationError::UnknownLogLevel(observability.log_level.clone()));
    }
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if let Some(cors) = &config.cors {
        for method in &cors.allow_methods {
            if method != "*" && axum::http::Method::from_bytes(method.as_bytes()).is_err() {
                errors.push(ValidationError::InvalidCorsMethod(method.clone()));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
