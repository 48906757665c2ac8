//! Logging setup for Trellis applications.
//!
//! Built on `tracing-subscriber`, driven by [`LoggingConfig`]. The core
//! crate logs fork creation and disposal at `debug`, registrations and the
//! start/stop barriers at `info`, and failing hooks at `error`, all with
//! structured `plugin` / `fork` / `service` fields.
//!
//! # Configuration-Based Initialization
//!
//! ```rust,ignore
//! use trellis_runtime::{config::load_config, logging};
//!
//! let config = load_config()?;
//! logging::init_from_config(&config.logging);
//! ```
//!
//! # Manual Initialization
//!
//! ```rust,ignore
//! use trellis_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .directive("trellis_core=debug")
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::Subscriber;
use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// Span creation and close only.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };

    fn to_fmt_span(self) -> FmtSpan {
        [
            (self.new, FmtSpan::NEW),
            (self.enter, FmtSpan::ENTER),
            (self.exit, FmtSpan::EXIT),
            (self.close, FmtSpan::CLOSE),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .fold(FmtSpan::NONE, |acc, (_, event)| acc | event)
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        Self {
            new: config.new,
            enter: config.enter,
            exit: config.exit,
            close: config.close,
        }
    }
}

/// Initializes logging from a `LoggingConfig`.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_from_config(config: &LoggingConfig) {
    let _ = LoggingBuilder::from_config(config).try_init();
}

/// A builder for the global tracing subscriber.
#[derive(Debug, Default)]
pub struct LoggingBuilder {
    level: Option<tracing::Level>,
    directives: Vec<String>,
    format: LogFormat,
    output: LogOutput,
    span_events: SpanEvents,
    show_target: bool,
    show_thread_ids: bool,
    show_location: bool,
    file_path: Option<PathBuf>,
    rotation: LogRotation,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            show_target: true,
            ..Default::default()
        }
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            level: Some(config.level.to_tracing_level()),
            directives: config
                .filters
                .iter()
                .map(|(target, level)| format!("{target}={level}"))
                .collect(),
            format: config.format,
            output: config.output,
            span_events: SpanEvents::from(&config.span_events),
            show_target: true,
            show_thread_ids: config.thread_ids,
            show_location: config.file_location,
            file_path: config.file_path.clone(),
            rotation: config.rotation,
        }
    }

    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Adds a filter directive such as `trellis_core=trace`.
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.show_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.show_thread_ids = enabled;
        self
    }

    /// Includes source file and line number.
    pub fn with_file_location(mut self, enabled: bool) -> Self {
        self.show_location = enabled;
        self
    }

    /// Sets the file used by [`LogOutput::File`].
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Installs the subscriber, ignoring failures.
    pub fn init(self) {
        let _ = self.try_init();
    }

    /// Installs the subscriber. Fails if one is already installed.
    pub fn try_init(self) -> Result<(), TryInitError> {
        let filter = self.filter();
        tracing_subscriber::registry()
            .with(self.fmt_layer())
            .with(filter)
            .try_init()
    }

    /// `RUST_LOG` replaces the base level when set; directives apply on top.
    fn filter(&self) -> EnvFilter {
        let base = self.level.unwrap_or(tracing::Level::INFO);
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(base.as_str().to_lowercase()));

        self.directives
            .iter()
            .fold(filter, |filter, directive| match directive.parse() {
                Ok(parsed) => filter.add_directive(parsed),
                Err(e) => {
                    eprintln!("Ignoring invalid log directive '{directive}': {e}");
                    filter
                }
            })
    }

    fn writer(&self) -> BoxMakeWriter {
        match (self.output, &self.file_path) {
            (LogOutput::Stdout, _) => BoxMakeWriter::new(std::io::stdout),
            (LogOutput::Stderr, _) => BoxMakeWriter::new(std::io::stderr),
            (LogOutput::File, Some(path)) => BoxMakeWriter::new(appender(path, self.rotation)),
            (LogOutput::File, None) => {
                eprintln!("Log output is `file` but no file path is set, using stdout");
                BoxMakeWriter::new(std::io::stdout)
            }
        }
    }

    fn fmt_layer<S>(&self) -> BoxedLayer<S>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    {
        let layer = fmt::layer()
            .with_writer(self.writer())
            .with_span_events(self.span_events.to_fmt_span())
            .with_target(self.show_target)
            .with_thread_ids(self.show_thread_ids)
            .with_file(self.show_location)
            .with_line_number(self.show_location);

        match self.format {
            LogFormat::Full => layer.boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            #[cfg(feature = "json-log")]
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

fn appender(path: &Path, rotation: LogRotation) -> rolling::RollingFileAppender {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path.file_name().unwrap_or_else(|| OsStr::new("trellis.log"));
    match rotation {
        LogRotation::Never => rolling::never(dir, file),
        LogRotation::Hourly => rolling::hourly(dir, file),
        LogRotation::Daily => rolling::daily(dir, file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_builder_from_config() {
        let mut config = LoggingConfig::default();
        config.level = LogLevel::Debug;
        config.thread_ids = true;
        config.filters.insert("trellis_core".into(), LogLevel::Trace);
        config.span_events.new = true;

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.level, Some(tracing::Level::DEBUG));
        assert!(builder.show_thread_ids);
        assert!(!builder.show_location);
        assert_eq!(builder.directives, vec!["trellis_core=trace"]);
        assert!(builder.span_events.new && !builder.span_events.close);
    }

    #[test]
    fn test_span_event_flags() {
        assert_eq!(SpanEvents::NONE.to_fmt_span(), FmtSpan::NONE);
        assert_eq!(
            SpanEvents::LIFECYCLE.to_fmt_span(),
            FmtSpan::NEW | FmtSpan::CLOSE
        );
    }
}
