//! Entry records and the stores that persist them.
//!
//! [`FileStore`] keeps entries in a YAML (`.yaml`, `.yml`) or JSON
//! (`.json`) file. Writes are debounced: [`EntryStore::write`] only records
//! the latest entry list and makes sure one background write is scheduled
//! for the current window, so a burst of changes produces a single file
//! write holding the final list.
//!
//! ```text
//! write(a) ─┐
//! write(b) ─┼── debounce ──► file contains c
//! write(c) ─┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::error::{LoaderError, LoaderResult};

/// One persisted plugin entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Identifier of the entry, unique within a store.
    pub id: String,
    /// Reference resolved to a plugin by a [`PluginResolver`](super::PluginResolver).
    pub plugin: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl EntryRecord {
    pub fn new(id: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin: plugin.into(),
            config: Value::Null,
            disabled: false,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

/// Persistence backend for entry records.
#[async_trait]
pub trait EntryStore: Send + Sync + 'static {
    /// Reads every record.
    async fn read(&self) -> LoaderResult<Vec<EntryRecord>>;

    /// Schedules `records` to replace the stored list.
    ///
    /// Fails with [`LoaderError::Unwritable`] when the store is read-only.
    fn write(&self, records: Vec<EntryRecord>) -> LoaderResult<()>;

    /// Waits for every scheduled write and reports the first failure.
    async fn flush(&self) -> LoaderResult<()> {
        Ok(())
    }

    fn is_writable(&self) -> bool;
}

// =============================================================================
// FileStore
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    fn detect(path: &Path) -> LoaderResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(LoaderError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    fn parse(self, text: &str) -> LoaderResult<Vec<EntryRecord>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(match self {
            Self::Yaml => serde_yaml::from_str(text)?,
            Self::Json => serde_json::from_str(text)?,
        })
    }

    fn render(self, records: &[EntryRecord]) -> LoaderResult<String> {
        Ok(match self {
            Self::Yaml => serde_yaml::to_string(records)?,
            Self::Json => serde_json::to_string_pretty(records)?,
        })
    }
}

#[derive(Default)]
struct WriteState {
    /// Latest records not yet handed to a write task.
    records: Option<Vec<EntryRecord>>,
    /// Whether a write task is waiting for the current window to close.
    scheduled: bool,
    tasks: Vec<JoinHandle<LoaderResult<()>>>,
}

struct FileInner {
    path: PathBuf,
    format: FileFormat,
    writable: bool,
    debounce: Duration,
    state: Mutex<WriteState>,
}

impl FileInner {
    async fn write_now(&self, records: &[EntryRecord]) -> LoaderResult<()> {
        let text = self.format.render(records)?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| LoaderError::io(&self.path, e))?;
        debug!(path = %self.path.display(), entries = records.len(), "entry file written");
        Ok(())
    }
}

/// An [`EntryStore`] backed by a YAML or JSON file.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileInner>,
}

impl FileStore {
    /// Opens `path`, detecting its format from the extension.
    ///
    /// A missing file is treated as an empty, writable store; an existing
    /// read-only file makes the store read-only.
    pub async fn open(path: impl Into<PathBuf>, debounce: Duration) -> LoaderResult<Self> {
        let path = path.into();
        let format = FileFormat::detect(&path)?;
        let writable = match tokio::fs::metadata(&path).await {
            Ok(meta) => !meta.permissions().readonly(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(LoaderError::io(&path, e)),
        };
        debug!(path = %path.display(), ?format, writable, "entry store opened");

        Ok(Self {
            inner: Arc::new(FileInner {
                path,
                format,
                writable,
                debounce,
                state: Mutex::new(WriteState::default()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn schedule(&self) -> JoinHandle<LoaderResult<()>> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let records = {
                let mut state = inner.state.lock();
                state.scheduled = false;
                state.records.take()
            };
            match records {
                Some(records) => {
                    let result = inner.write_now(&records).await;
                    if let Err(e) = &result {
                        error!(path = %inner.path.display(), error = %e, "failed to write entry file");
                    }
                    result
                }
                None => Ok(()),
            }
        })
    }
}

#[async_trait]
impl EntryStore for FileStore {
    async fn read(&self) -> LoaderResult<Vec<EntryRecord>> {
        let path = &self.inner.path;
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %path.display(), "entry file missing, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(LoaderError::io(path, e)),
        };
        self.inner.format.parse(&text)
    }

    fn write(&self, records: Vec<EntryRecord>) -> LoaderResult<()> {
        if !self.inner.writable {
            return Err(LoaderError::Unwritable(self.inner.path.clone()));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            // No runtime to debounce on: write through.
            let text = self.inner.format.render(&records)?;
            return std::fs::write(&self.inner.path, text)
                .map_err(|e| LoaderError::io(&self.inner.path, e));
        }

        let mut state = self.inner.state.lock();
        state.records = Some(records);
        if state.scheduled {
            trace!("entry write coalesced into the pending one");
            return Ok(());
        }
        state.scheduled = true;
        state.tasks.retain(|task| !task.is_finished());
        let task = self.schedule();
        state.tasks.push(task);
        Ok(())
    }

    async fn flush(&self) -> LoaderResult<()> {
        let tasks = std::mem::take(&mut self.inner.state.lock().tasks);
        let mut outcome = Ok(());
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(LoaderError::WriteTask(e.to_string())),
            };
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    fn is_writable(&self) -> bool {
        self.inner.writable
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.inner.path)
            .field("format", &self.inner.format)
            .field("writable", &self.inner.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(n: usize) -> Vec<EntryRecord> {
        (0..n)
            .map(|i| EntryRecord::new(format!("e{i}"), "echo").with_config(json!({ "n": i })))
            .collect()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::detect(Path::new("a.yml")).unwrap(), FileFormat::Yaml);
        assert_eq!(FileFormat::detect(Path::new("a.json")).unwrap(), FileFormat::Json);
        assert!(matches!(
            FileFormat::detect(Path::new("a.toml")),
            Err(LoaderError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_default_fields_are_omitted() {
        let yaml = FileFormat::Yaml.render(&[EntryRecord::new("a", "echo")]).unwrap();
        assert!(!yaml.contains("disabled"));
        assert!(!yaml.contains("config"));

        let parsed = FileFormat::Yaml.parse("- id: a\n  plugin: echo\n  disabled: true\n").unwrap();
        assert!(parsed[0].disabled);
        assert!(FileFormat::Json.parse("  \n").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_are_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");
        let store = FileStore::open(&path, Duration::from_millis(20)).await.unwrap();

        store.write(records(1)).unwrap();
        store.write(records(2)).unwrap();
        store.write(records(3)).unwrap();
        assert_eq!(store.inner.state.lock().tasks.len(), 1);

        store.flush().await.unwrap();
        assert_eq!(store.read().await.unwrap(), records(3));
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("none.yaml"), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.is_writable());
        assert!(store.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_file_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.yaml");
        std::fs::write(&path, "- id: a\n  plugin: echo\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let store = FileStore::open(&path, Duration::ZERO).await.unwrap();
        assert!(!store.is_writable());
        assert_eq!(store.read().await.unwrap().len(), 1);
        assert!(matches!(
            store.write(records(1)),
            Err(LoaderError::Unwritable(_))
        ));
    }
}
