//! Trellis Runtime - process-facing layer for the Trellis plugin framework.
//!
//! This crate provides:
//! - Configuration loading (`config`): figment layering of files, profiles
//!   and `TRELLIS_*` environment variables
//! - Logging setup (`logging`) on `tracing-subscriber`
//! - Plugin entry persistence (`loader`): entry records kept in a YAML or
//!   JSON file and registered on a context
//! - Runtime orchestration (`TrellisRuntime`)
//!
//! ```ignore
//! use std::sync::Arc;
//! use trellis_runtime::TrellisRuntime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = TrellisRuntime::builder()
//!         .plugin(Arc::new(echo_plugin()))
//!         .build()?;
//!
//!     // Registers the entries listed in `entries.file`, then runs
//!     // until Ctrl+C.
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod runtime;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, EntriesConfig, TrellisConfig};
pub use error::{LoaderError, LoaderResult, RuntimeError, RuntimeResult};
pub use loader::{EntryRecord, EntryStore, FileStore, Loader, PluginResolver, StaticResolver};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, TrellisRuntime};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// Provides the logging macros (`trace!` through `error!`), `span`,
/// `event`, the `instrument` attribute and `Level`.
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
