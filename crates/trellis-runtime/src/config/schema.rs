//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrellisConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Plugin entry persistence settings.
    #[serde(default)]
    pub entries: EntriesConfig,
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Newline-delimited JSON; requires the `json-log` feature.
    #[cfg(feature = "json-log")]
    Json,
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Rotation policy of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global log level.
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Include thread IDs in log lines.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include source file and line number in log lines.
    #[serde(default)]
    pub file_location: bool,

    /// Log file, used when `output` is `file`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Per-module level overrides, e.g. `trellis_core: debug`.
    #[serde(default)]
    pub filters: BTreeMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::Never,
            filters: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Plugin entry persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesConfig {
    /// Entry file (`.yaml`, `.yml` or `.json`). No loader is created when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Window in milliseconds within which successive writes are coalesced.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for EntriesConfig {
    fn default() -> Self {
        Self {
            file: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_config() {
        let yaml = "logging:\n  level: debug\n  filters:\n    trellis_core: trace\nentries:\n  file: plugins.yml\n";
        let config: TrellisConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.logging.filters["trellis_core"], LogLevel::Trace);
        assert_eq!(config.entries.file, Some(PathBuf::from("plugins.yml")));
        assert_eq!(config.entries.debounce_ms, 100);
    }
}
