//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while assembling or checking a [`TrellisConfig`](super::TrellisConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// The file extension is unknown, or its format feature is disabled.
    #[error("Unsupported or disabled configuration format: {0}")]
    UnsupportedFormat(PathBuf),

    /// Merged sources could not be extracted into the schema.
    #[error("Failed to load configuration: {0}")]
    Extract(#[from] figment::Error),

    /// A value was loaded but is not acceptable.
    #[error("Invalid configuration at `{field}`: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
