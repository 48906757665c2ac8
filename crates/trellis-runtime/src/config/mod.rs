//! Configuration module for the Trellis runtime.
//!
//! This module provides figment-based configuration loading and validation
//! for logging and plugin entry persistence.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, load_config, load_config_from_file};
pub use schema::{
    EntriesConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, SpanEventConfig,
    TrellisConfig,
};
pub use validation::validate_config;
