//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the logging subsystem
//! - Configure the log level from config, overridable by `RUST_LOG`
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
}

/// `tracing::event!` at a level chosen at runtime.
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {{
        let level: ::tracing::Level = $level;
        if level == ::tracing::Level::ERROR {
            ::tracing::event!(::tracing::Level::ERROR, $($arg)+)
        } else if level == ::tracing::Level::WARN {
            ::tracing::event!(::tracing::Level::WARN, $($arg)+)
        } else if level == ::tracing::Level::INFO {
            ::tracing::event!(::tracing::Level::INFO, $($arg)+)
        } else if level == ::tracing::Level::DEBUG {
            ::tracing::event!(::tracing::Level::DEBUG, $($arg)+)
        } else {
            ::tracing::event!(::tracing::Level::TRACE, $($arg)+)
        }
    }};
}

pub(crate) use event_at;

/// Whether an event at `level` would be recorded here.
pub fn enabled_at(level: tracing::Level) -> bool {
    if level == tracing::Level::ERROR {
        tracing::enabled!(tracing::Level::ERROR)
    } else if level == tracing::Level::WARN {
        tracing::enabled!(tracing::Level::WARN)
    } else if level == tracing::Level::INFO {
        tracing::enabled!(tracing::Level::INFO)
    } else if level == tracing::Level::DEBUG {
        tracing::enabled!(tracing::Level::DEBUG)
    } else {
        tracing::enabled!(tracing::Level::TRACE)
    }
}

fn default_directives(level: &str) -> String {
    format!("rebind={level},tower_http={level}")
}
