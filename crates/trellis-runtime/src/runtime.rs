//! Main runtime orchestration.
//!
//! The runtime owns the root [`Context`] of an application, sets up logging
//! from its configuration, and optionally keeps a [`Loader`] that registers
//! the plugin entries listed in the configured entry file.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use trellis_runtime::TrellisRuntime;
//!
//! // Auto-loads trellis.yaml from the current directory
//! let runtime = TrellisRuntime::new();
//! runtime.add_plugin(Arc::new(plugin_fn("echo", echo)));
//! runtime.run().await?;
//!
//! // Custom configuration path
//! let runtime = TrellisRuntime::builder()
//!     .config_file("config/trellis.yaml")
//!     .build()?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::signal;
use tracing::{debug, error, info, warn};
use trellis_core::{Context, Plugin};

use crate::config::{ConfigLoader, TrellisConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::loader::{EntryStore, FileStore, Loader, StaticResolver};
use crate::logging;

/// The Trellis runtime: a root context plus its process-level plumbing.
///
/// # Usage
///
/// ```rust,ignore
/// let runtime = TrellisRuntime::builder()
///     .profile("production")
///     .build()?;
///
/// runtime.context().register(Arc::new(my_plugin), json!({}))?;
/// runtime.run().await?;
/// ```
pub struct TrellisRuntime {
    config: TrellisConfig,
    context: Context,
    /// Plugins available to entry records, by name.
    resolver: RwLock<StaticResolver>,
    /// Created on start when `entries.file` is configured.
    loader: RwLock<Option<Arc<Loader>>>,
    running: AtomicBool,
}

impl TrellisRuntime {
    /// Creates a runtime, loading configuration from the current directory.
    ///
    /// Falls back to default settings when no valid configuration is found.
    pub fn new() -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .map_err(RuntimeError::from)
            .and_then(|config| {
                validate_config(&config)?;
                Ok(config)
            })
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                TrellisConfig::default()
            });
        Self::from_config(&config)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration.
    ///
    /// Initializes logging unless a global subscriber is already installed.
    pub fn from_config(config: &TrellisConfig) -> Self {
        logging::init_from_config(&config.logging);

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            entries = ?config.entries.file,
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            context: Context::new(),
            resolver: RwLock::new(StaticResolver::new()),
            loader: RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TrellisConfig {
        &self.config
    }

    /// The root context owned by this runtime.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Makes `plugin` available to entry records under its own name.
    ///
    /// Only plugins added before [`start`](Self::start) are visible to the
    /// loader.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        debug!(plugin = %plugin.name(), "Plugin made available to entries");
        let name = plugin.name().to_string();
        self.resolver.write().insert(name, plugin);
    }

    /// The entry loader, once the runtime has started with an entry file.
    pub fn loader(&self) -> Option<Arc<Loader>> {
        self.loader.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Loads the configured entries, then starts the root context.
    ///
    /// Entry loading failures leave the runtime stopped. Failing start hooks
    /// are reported, but the context stays started and needs a
    /// [`stop`](Self::stop).
    pub async fn start(&self) -> RuntimeResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Runtime is already running");
            return Ok(());
        }

        info!("Starting Trellis runtime");

        if let Err(e) = self.load_entries().await {
            error!(error = %e, "Failed to load plugin entries");
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

        self.context.start().await?;
        info!("Runtime started");
        Ok(())
    }

    async fn load_entries(&self) -> RuntimeResult<()> {
        let Some(path) = &self.config.entries.file else {
            debug!("No entry file configured");
            return Ok(());
        };

        let debounce = Duration::from_millis(self.config.entries.debounce_ms);
        let store = FileStore::open(path, debounce).await?;
        if !store.is_writable() {
            warn!(path = %path.display(), "Entry file is read-only, changes will be rejected");
        }

        let resolver = Arc::new(self.resolver.read().clone());
        let loader = Arc::new(Loader::new(self.context.clone(), Arc::new(store), resolver));
        let count = loader.load().await?;
        info!(path = %path.display(), entries = count, "Plugin entries loaded");

        *self.loader.write() = Some(loader);
        Ok(())
    }

    /// Unloads entries, stops the root context and waits for pending
    /// entry writes.
    pub async fn stop(&self) -> RuntimeResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            warn!("Runtime is not running");
            return Ok(());
        }

        info!("Stopping Trellis runtime");

        let loader = self.loader.write().take();
        if let Some(loader) = &loader {
            let count = loader.unload();
            debug!(entries = count, "Plugin entries unloaded");
        }

        let stopped = self.context.stop().await;
        if let Err(e) = &stopped {
            error!(error = %e, "Error during context shutdown");
        }

        if let Some(loader) = loader {
            loader.flush().await?;
        }

        stopped?;
        info!("Runtime stopped");
        Ok(())
    }

    /// Runs the runtime until a shutdown signal is received.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;

        info!("Trellis runtime is now running. Press Ctrl+C to stop.");

        let waited = self.wait_for_shutdown().await;
        self.stop().await?;
        waited
    }

    /// Runs the runtime until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    /// Waits for Ctrl+C, or SIGTERM on unix.
    async fn wait_for_shutdown(&self) -> RuntimeResult<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .map_err(RuntimeError::Signal)?;

            tokio::select! {
                result = signal::ctrl_c() => {
                    result.map_err(RuntimeError::Signal)?;
                    info!("Received Ctrl+C, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await.map_err(RuntimeError::Signal)?;
            info!("Received Ctrl+C, shutting down");
        }

        Ok(())
    }
}

impl Default for TrellisRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrellisRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrellisRuntime")
            .field("context", &self.context)
            .field("resolver", &*self.resolver.read())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a `TrellisRuntime` with custom configuration.
///
/// ```rust,ignore
/// let runtime = TrellisRuntime::builder()
///     .config_file("config/production.yaml")
///     .profile("production")
///     .plugin(Arc::new(echo))
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    resolver: StaticResolver,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            resolver: StaticResolver::new(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g. "development", "production").
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Enables loading environment variables (enabled by default).
    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: TrellisConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Makes `plugin` available to entry records under its own name.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.resolver = self.resolver.with_plugin(plugin);
        self
    }

    /// Replaces the plugin table used for entry records.
    pub fn resolver(mut self, resolver: StaticResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Loads and validates the configuration, then builds the runtime.
    pub fn build(self) -> RuntimeResult<TrellisRuntime> {
        let config = self.config_loader.load()?;
        validate_config(&config)?;
        let runtime = TrellisRuntime::from_config(&config);
        *runtime.resolver.write() = self.resolver;
        Ok(runtime)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use serde_json::{Value, json};
    use trellis_core::plugin_fn;

    use crate::config::EntriesConfig;
    use crate::loader::EntryRecord;

    fn counting_plugin(name: &str, applied: Arc<AtomicUsize>) -> Arc<dyn Plugin> {
        let plugin = plugin_fn(name, move |_: &Context, _: &Value| {
            applied.fetch_add(1, Ordering::SeqCst);
        });
        Arc::new(plugin.reusable(true))
    }

    fn config_with_entries(path: std::path::PathBuf) -> TrellisConfig {
        TrellisConfig {
            entries: EntriesConfig {
                file: Some(path),
                debounce_ms: 5,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_stop_without_entry_file() {
        let runtime = TrellisRuntime::from_config(&TrellisConfig::default());
        runtime.start().await.unwrap();
        assert!(runtime.is_running());
        assert!(runtime.context().is_started());
        assert!(runtime.loader().is_none());

        // Second start is a no-op.
        runtime.start().await.unwrap();

        runtime.stop().await.unwrap();
        assert!(!runtime.is_running());
        assert!(!runtime.context().is_started());
    }

    #[tokio::test]
    async fn test_entries_are_registered_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.yaml");
        std::fs::write(
            &path,
            "- id: a\n  plugin: echo\n- id: b\n  plugin: echo\n  disabled: true\n",
        )
        .unwrap();

        let applied = Arc::new(AtomicUsize::new(0));
        let runtime = TrellisRuntime::from_config(&config_with_entries(path.clone()));
        runtime.add_plugin(counting_plugin("echo", Arc::clone(&applied)));

        runtime.start().await.unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);

        let loader = runtime.loader().unwrap();
        assert!(loader.handle("a").is_some());
        assert!(loader.handle("b").is_none());

        loader.set_disabled("b", false).unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 2);

        runtime.stop().await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("disabled"));
    }

    #[tokio::test]
    async fn test_unknown_plugin_keeps_runtime_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, r#"[{ "id": "a", "plugin": "missing" }]"#).unwrap();

        let runtime = TrellisRuntime::from_config(&config_with_entries(path));
        let err = runtime.start().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Loader(_)));
        assert!(!runtime.is_running());
        assert!(!runtime.context().is_started());
    }

    #[tokio::test]
    async fn test_run_until_stops_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");

        let applied = Arc::new(AtomicUsize::new(0));
        let runtime = TrellisRuntime::from_config(&config_with_entries(path.clone()));
        runtime.add_plugin(counting_plugin("echo", Arc::clone(&applied)));

        runtime
            .run_until(async {
                let loader = runtime.loader().unwrap();
                loader
                    .add(EntryRecord::new("a", "echo").with_config(json!({ "n": 1 })))
                    .unwrap();
            })
            .await
            .unwrap();

        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert!(runtime.loader().is_none());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"n\": 1"));
    }
}
