//! Runtime error types.

use std::path::PathBuf;

use thiserror::Error;
use trellis_core::CoreError;

use crate::config::ConfigError;

/// Errors of the plugin entry loader and its stores.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Reading or writing the entry file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML entry file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON entry file: {0}")]
    Json(#[from] serde_json::Error),

    /// The store is read-only; the write was not performed.
    #[error("Cannot overwrite read-only entry file: {0}")]
    Unwritable(PathBuf),

    #[error("Unsupported entry file format: {0}")]
    UnsupportedFormat(PathBuf),

    /// No plugin is known under the referenced name.
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Unknown entry: {0}")]
    UnknownEntry(String),

    #[error("Duplicate entry id: {0}")]
    DuplicateEntry(String),

    /// A background write task did not run to completion.
    #[error("Entry write task failed: {0}")]
    WriteTask(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl LoaderError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// Installing a shutdown signal handler failed.
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
