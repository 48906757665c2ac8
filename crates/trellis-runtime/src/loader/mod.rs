//! Plugin entry loader.
//!
//! A [`Loader`] keeps a list of [`EntryRecord`]s in sync with a
//! [`Context`]: every enabled entry is registered under the context with
//! its config, and every change made through the loader is persisted to
//! the [`EntryStore`] and announced with a `config` event on the context.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::{sync::Arc, time::Duration};
//! use trellis_runtime::loader::{FileStore, Loader, StaticResolver};
//!
//! let store = FileStore::open("plugins.yaml", Duration::from_millis(100)).await?;
//! let resolver = StaticResolver::new().with_plugin(Arc::new(echo));
//! let loader = Loader::new(app.clone(), Arc::new(store), Arc::new(resolver));
//!
//! loader.load().await?;
//! loader.update("echo-1", json!({ "prefix": ">" }))?;
//! loader.flush().await?;
//! ```

mod resolver;
mod store;

pub use resolver::{PluginResolver, StaticResolver};
pub use store::{EntryRecord, EntryStore, FileStore};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use trellis_core::{Context, PluginHandle};

use crate::error::{LoaderError, LoaderResult};

/// Event emitted on the loader's context after every persisted change.
pub const CONFIG_EVENT: &str = "config";

#[derive(Default)]
struct LoaderState {
    records: Vec<EntryRecord>,
    active: HashMap<String, PluginHandle>,
}

/// Registers persisted plugin entries on a context.
pub struct Loader {
    ctx: Context,
    store: Arc<dyn EntryStore>,
    resolver: Arc<dyn PluginResolver>,
    state: Mutex<LoaderState>,
}

impl Loader {
    pub fn new(ctx: Context, store: Arc<dyn EntryStore>, resolver: Arc<dyn PluginResolver>) -> Self {
        Self {
            ctx,
            store,
            resolver,
            state: Mutex::new(LoaderState::default()),
        }
    }

    /// Reads the store and registers every enabled entry.
    ///
    /// All references are resolved before anything is registered, so an
    /// unknown plugin leaves the context untouched. Entries registered by a
    /// previous `load` are disposed first. Returns the number of entries
    /// registered.
    pub async fn load(&self) -> LoaderResult<usize> {
        let records = self.store.read().await?;

        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.id.as_str()) {
                return Err(LoaderError::DuplicateEntry(record.id.clone()));
            }
        }
        let resolved = records
            .iter()
            .filter(|record| !record.disabled)
            .map(|record| Ok((record.clone(), self.resolver.resolve(&record.plugin)?)))
            .collect::<LoaderResult<Vec<_>>>()?;

        self.unload();
        self.state.lock().records = records;

        let mut count = 0;
        for (record, plugin) in resolved {
            let handle = self.ctx.register(plugin, record.config.clone())?;
            debug!(entry = %record.id, plugin = %record.plugin, "entry registered");
            self.state.lock().active.insert(record.id, handle);
            count += 1;
        }
        info!(entries = count, "plugin entries loaded");
        Ok(count)
    }

    /// Current records, in store order.
    pub fn entries(&self) -> Vec<EntryRecord> {
        self.state.lock().records.clone()
    }

    /// The registration of entry `id`, if it is enabled and loaded.
    pub fn handle(&self, id: &str) -> Option<PluginHandle> {
        self.state.lock().active.get(id).cloned()
    }

    /// Adds a new entry, registering it unless it is disabled.
    pub fn add(&self, record: EntryRecord) -> LoaderResult<()> {
        let mut records = self.entries();
        if records.iter().any(|r| r.id == record.id) {
            return Err(LoaderError::DuplicateEntry(record.id));
        }
        let plugin = self.resolver.resolve(&record.plugin)?;
        let previous = records.clone();
        records.push(record.clone());
        self.persist(records)?;

        if !record.disabled {
            match self.ctx.register(plugin, record.config.clone()) {
                Ok(handle) => {
                    self.state.lock().active.insert(record.id.clone(), handle);
                }
                Err(err) => {
                    self.rollback(previous);
                    return Err(err.into());
                }
            }
        }
        info!(entry = %record.id, plugin = %record.plugin, "entry added");
        Ok(())
    }

    /// Replaces the config of entry `id`, re-registering it if enabled.
    pub fn update(&self, id: &str, config: Value) -> LoaderResult<()> {
        let previous = self.entries();
        let record = self.modify(id, |record| record.config = config)?;
        if !record.disabled {
            self.reload_or_rollback(&record, previous)?;
        }
        debug!(entry = %id, "entry config updated");
        Ok(())
    }

    /// Enables or disables entry `id`.
    pub fn set_disabled(&self, id: &str, disabled: bool) -> LoaderResult<()> {
        let previous = self.entries();
        let record = self.modify(id, |record| record.disabled = disabled)?;
        if disabled {
            self.deactivate(id);
        } else {
            self.reload_or_rollback(&record, previous)?;
        }
        info!(entry = %id, disabled, "entry toggled");
        Ok(())
    }

    /// Removes entry `id` from the store and disposes its registration.
    pub fn remove(&self, id: &str) -> LoaderResult<()> {
        let mut records = self.entries();
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(LoaderError::UnknownEntry(id.to_string()));
        }
        self.persist(records)?;
        self.deactivate(id);
        info!(entry = %id, "entry removed");
        Ok(())
    }

    /// Disposes every registration made by this loader. Records are kept.
    pub fn unload(&self) -> usize {
        let active = std::mem::take(&mut self.state.lock().active);
        let count = active.len();
        for (id, handle) in active {
            if !handle.dispose() {
                warn!(entry = %id, "entry was already disposed");
            }
        }
        count
    }

    /// Waits for pending store writes.
    pub async fn flush(&self) -> LoaderResult<()> {
        self.store.flush().await
    }

    pub fn is_writable(&self) -> bool {
        self.store.is_writable()
    }

    /// Applies `change` to a copy of entry `id`, persists, then commits it.
    fn modify<F>(&self, id: &str, change: F) -> LoaderResult<EntryRecord>
    where
        F: FnOnce(&mut EntryRecord),
    {
        let mut records = self.entries();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LoaderError::UnknownEntry(id.to_string()))?;
        change(record);
        let record = record.clone();
        self.persist(records)?;
        Ok(record)
    }

    fn persist(&self, records: Vec<EntryRecord>) -> LoaderResult<()> {
        self.store.write(records.clone())?;
        self.state.lock().records = records;
        self.ctx.emit(CONFIG_EVENT, &[]);
        Ok(())
    }

    fn deactivate(&self, id: &str) {
        let handle = self.state.lock().active.remove(id);
        if let Some(handle) = handle {
            handle.dispose();
        }
    }

    /// Re-registers `record`; if that fails, the records persisted before
    /// the change are written back and the old entry re-registered.
    fn reload_or_rollback(
        &self,
        record: &EntryRecord,
        previous: Vec<EntryRecord>,
    ) -> LoaderResult<()> {
        let Err(err) = self.reload(record) else {
            return Ok(());
        };
        let old = previous.iter().find(|r| r.id == record.id).cloned();
        self.rollback(previous);
        if let Some(old) = old.filter(|old| !old.disabled) {
            if let Err(restore) = self.reload(&old) {
                warn!(entry = %old.id, error = %restore, "failed to restore entry");
            }
        }
        Err(err)
    }

    /// Writes back the records of a change that could not be applied.
    fn rollback(&self, previous: Vec<EntryRecord>) {
        if let Err(err) = self.persist(previous) {
            warn!(error = %err, "failed to roll back entry records");
        }
    }

    fn reload(&self, record: &EntryRecord) -> LoaderResult<()> {
        let plugin = self.resolver.resolve(&record.plugin)?;
        self.deactivate(&record.id);
        let handle = self.ctx.register(plugin, record.config.clone())?;
        self.state.lock().active.insert(record.id.clone(), handle);
        Ok(())
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Loader")
            .field("entries", &state.records.len())
            .field("active", &state.active.len())
            .finish_non_exhaustive()
    }
}
