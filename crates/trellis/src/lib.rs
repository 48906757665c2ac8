//! # Trellis
//!
//! A reactive plugin framework for Rust.
//!
//! ## Overview
//!
//! Plugins declare the services they use. Trellis instantiates each
//! registration as soon as those services are present in its context, and
//! disposes and re-instantiates it whenever one of them changes or goes
//! away. Everything a plugin creates is owned by its fork and torn down
//! with it, children first.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌────────────────────────────────┐
//! │   Runtime   │────▶│ Root Context │────▶│ fork "db"      (own scope)     │──▶ services
//! │ (config,    │     │  services +  │────▶│ fork "http"    (uses "db")     │──▶ services
//! │  entries)   │     │  registry    │────▶│ fork ...                       │──▶ services
//! └─────────────┘     └──────────────┘     └────────────────────────────────┘
//! ```
//!
//! - **Runtime**: configuration, logging, persisted plugin entries, signals
//! - **Context**: scoping node with service slots and events
//! - **Plugins**: declare `using` / `isolate`, run a body per instantiation
//! - **Forks**: one per satisfied registration, disposed as a unit
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trellis::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let greeter = plugin_fn("greeter", |ctx: &Context, config: &Value| {
//!         info!(?config, "greeter forked");
//!         ctx.on_dispose(|| info!("greeter disposed"));
//!     })
//!     .using(["db"]);
//!
//!     let runtime = TrellisRuntime::builder()
//!         .plugin(Arc::new(greeter))
//!         .build()?;
//!     runtime.context().provide("db", Arc::new(String::from("sqlite::memory")));
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `yaml-config` (default): YAML configuration files
//! - `toml-config`: TOML configuration files
//! - `json-log`: JSON log output

pub use trellis_core as core;
pub use trellis_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use trellis::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use trellis_runtime::{EntryRecord, Loader, StaticResolver, TrellisRuntime};

    // Context, plugins and services
    pub use trellis_core::prelude::*;
    pub use trellis_core::{HookKind, PrivateKey, RegistryStats};

    // Config values handed to plugin bodies
    pub use trellis_core::serde_json::{Value, json};

    // Logging
    pub use trellis_runtime::prelude::*;
}
