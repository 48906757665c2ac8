//! Layered configuration loading.
//!
//! A [`TrellisConfig`] is assembled with figment from, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. Overrides handed to [`ConfigLoader::merge`]
//! 3. `trellis.{profile}.{ext}` next to the main file
//! 4. The main file `trellis.{ext}`
//! 5. `TRELLIS_*` environment variables, `__` separating nested keys
//!    (`TRELLIS_ENTRIES__DEBOUNCE_MS=250` sets `entries.debounce_ms`)
//!
//! Which extensions are searched depends on the enabled features:
//! `toml-config` adds `.toml`, `yaml-config` *(default)* adds `.yaml` and
//! `.yml`. The first search directory holding a candidate wins.
//!
//! ```rust,ignore
//! use trellis_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .search_path("/etc/trellis")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::TrellisConfig;

const FILE_STEM: &str = "trellis";
const ENV_PREFIX: &str = "TRELLIS_";
const PROFILE_VAR: &str = "TRELLIS_PROFILE";
const DEFAULT_PROFILE: &str = "development";

/// Searched in this order within each directory.
const EXTENSIONS: &[&str] = &[
    #[cfg(feature = "toml-config")]
    "toml",
    #[cfg(feature = "yaml-config")]
    "yaml",
    #[cfg(feature = "yaml-config")]
    "yml",
];

/// Lowercases a profile name and expands the `dev` / `prod` shorthands.
fn normalize_profile(name: &str) -> String {
    match name.trim().to_lowercase().as_str() {
        "dev" => "development".to_string(),
        "prod" => "production".to_string(),
        other => other.to_string(),
    }
}

/// Builder collecting configuration sources.
#[derive(Debug)]
pub struct ConfigLoader {
    overrides: Figment,
    profile: String,
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    read_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Starts with the profile named by `TRELLIS_PROFILE`, or `development`.
    pub fn new() -> Self {
        let profile = std::env::var(PROFILE_VAR)
            .map(|p| normalize_profile(&p))
            .unwrap_or_else(|_| DEFAULT_PROFILE.to_string());
        Self {
            overrides: Figment::new(),
            profile,
            search_paths: Vec::new(),
            explicit_file: None,
            read_env: true,
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = normalize_profile(profile.as_ref());
        self
    }

    pub fn profile_name(&self) -> &str {
        &self.profile
    }

    /// Adds a directory to search. Without any, the current directory and
    /// the user config directory (`~/.config/trellis` on Linux) are used.
    pub fn search_path(mut self, path: impl AsRef<Path>) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    /// Loads exactly this file instead of searching. It must exist.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.read_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    pub fn merge(mut self, config: TrellisConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    pub fn load(self) -> ConfigResult<TrellisConfig> {
        let profile = self.profile.clone();
        let config: TrellisConfig = self.into_figment()?.extract()?;

        debug!(
            %profile,
            level = %config.logging.level,
            entries = ?config.entries.file,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn into_figment(self) -> ConfigResult<Figment> {
        let files = match &self.explicit_file {
            Some(path) if !path.exists() => return Err(ConfigError::FileNotFound(path.clone())),
            Some(path) => vec![path.clone()],
            None => self.discover(),
        };

        let mut figment = Figment::from(Serialized::defaults(TrellisConfig::default()))
            .merge(self.overrides);

        if files.is_empty() {
            warn!(profile = %self.profile, "No configuration file found, using defaults");
        }
        for path in &files {
            info!(path = %path.display(), "Loading configuration file");
            figment = merge_file(figment, path)?;
        }

        if self.read_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["PROFILE"]).split("__"));
        }
        Ok(figment)
    }

    /// Candidate files in merge order: the profile variant, then the main
    /// file, for the first directory and extension holding either.
    fn discover(&self) -> Vec<PathBuf> {
        for dir in self.directories() {
            for ext in EXTENSIONS {
                let found: Vec<PathBuf> = [
                    format!("{FILE_STEM}.{}.{ext}", self.profile),
                    format!("{FILE_STEM}.{ext}"),
                ]
                .into_iter()
                .map(|name| dir.join(name))
                .filter(|path| path.is_file())
                .collect();

                if !found.is_empty() {
                    return found;
                }
            }
        }
        Vec::new()
    }

    fn directories(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        std::env::current_dir()
            .ok()
            .into_iter()
            .chain(dirs::config_dir().map(|dir| dir.join(FILE_STEM)))
            .collect()
    }
}

fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    match path.extension().and_then(|e| e.to_str()) {
        #[cfg(feature = "toml-config")]
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        Some("yaml" | "yml") => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Loads configuration from the default locations.
pub fn load_config() -> ConfigResult<TrellisConfig> {
    ConfigLoader::new().load()
}

/// Loads configuration from `path`, plus environment overrides.
pub fn load_config_from_file(path: impl AsRef<Path>) -> ConfigResult<TrellisConfig> {
    ConfigLoader::new().file(path).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.logging.level.as_str(), "info");
        assert!(config.entries.file.is_none());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = ConfigLoader::new()
            .file("/definitely/not/here/trellis.yaml")
            .without_env()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellis.ini");
        std::fs::write(&path, "level = debug\n").unwrap();

        let err = ConfigLoader::new().file(&path).without_env().load().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(p) if p == path));
    }

    #[cfg(feature = "yaml-config")]
    #[test]
    fn test_profile_file_is_overridden_by_main_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("trellis.staging.yaml"),
            "logging:\n  level: trace\n  thread_ids: true\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("trellis.yaml"), "logging:\n  level: warn\n").unwrap();

        let config = ConfigLoader::new()
            .profile("staging")
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(config.logging.thread_ids);
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(ConfigLoader::new().profile("PROD").profile_name(), "production");
        assert_eq!(ConfigLoader::new().profile("dev").profile_name(), "development");
        assert_eq!(ConfigLoader::new().profile("Staging").profile_name(), "staging");
    }
}
