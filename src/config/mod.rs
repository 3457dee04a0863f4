//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated)
//!     → ServerBuilder::from_config / apply_config
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Controller::update applies it to the next-run builder
//!     → Controller::restart rebinds with it
//! ```
//!
//! # Design Decisions
//! - A loaded config never changes a running server; it takes effect at the
//!   next run boundary
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ClientAuthMode, ListenerConfig, ObservabilityConfig, ServiceConfig, TimeoutConfig, TlsConfig,
};
pub use validation::ValidationError;
pub use watcher::ConfigWatcher;
