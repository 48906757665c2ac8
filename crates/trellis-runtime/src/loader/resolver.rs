//! Mapping from entry plugin references to plugin definitions.

use std::collections::HashMap;
use std::sync::Arc;

use trellis_core::Plugin;

use crate::error::{LoaderError, LoaderResult};

/// Resolves the `plugin` field of an [`EntryRecord`](super::EntryRecord).
pub trait PluginResolver: Send + Sync + 'static {
    fn resolve(&self, reference: &str) -> LoaderResult<Arc<dyn Plugin>>;
}

/// A resolver backed by a fixed name → plugin table.
///
/// The same `Arc` is returned for every lookup of a name, so all entries
/// referencing one plugin share its runtime in the registry.
#[derive(Default, Clone)]
pub struct StaticResolver {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `plugin` under `name`, replacing any previous plugin.
    pub fn insert(&mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(name.into(), plugin);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        self.insert(name, plugin);
        self
    }

    /// Adds `plugin` under its own name.
    pub fn with_plugin(self, plugin: Arc<dyn Plugin>) -> Self {
        let name = plugin.name().to_string();
        self.with(name, plugin)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl PluginResolver for StaticResolver {
    fn resolve(&self, reference: &str) -> LoaderResult<Arc<dyn Plugin>> {
        self.plugins
            .get(reference)
            .cloned()
            .ok_or_else(|| LoaderError::UnknownPlugin(reference.to_string()))
    }
}

impl std::fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("StaticResolver").field("plugins", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use trellis_core::{Context, plugin_fn};

    #[test]
    fn test_resolve_returns_the_same_definition() {
        let echo: Arc<dyn Plugin> = Arc::new(plugin_fn("echo", |_: &Context, _: &Value| {}));
        let resolver = StaticResolver::new().with_plugin(Arc::clone(&echo));

        let resolved = resolver.resolve("echo").unwrap();
        assert!(Arc::ptr_eq(&resolved, &echo));
        assert!(matches!(
            resolver.resolve("missing"),
            Err(LoaderError::UnknownPlugin(name)) if name == "missing"
        ));
    }
}
