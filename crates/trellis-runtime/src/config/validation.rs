//! Checks applied to a loaded configuration.

use super::error::{ConfigError, ConfigResult};
use super::schema::{EntriesConfig, LogOutput, LoggingConfig, TrellisConfig};

/// Longest accepted write debounce window.
const MAX_DEBOUNCE_MS: u64 = 60_000;

/// Validates the entire configuration.
pub fn validate_config(config: &TrellisConfig) -> ConfigResult<()> {
    validate_logging(&config.logging)?;
    validate_entries(&config.entries)
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::invalid(
            "logging.file_path",
            "required when output is `file`",
        ));
    }

    if let Some(target) = logging
        .filters
        .keys()
        .find(|target| target.trim().is_empty() || target.contains(char::is_whitespace))
    {
        return Err(ConfigError::invalid(
            "logging.filters",
            format!("'{target}' is not a valid filter target"),
        ));
    }

    Ok(())
}

fn validate_entries(entries: &EntriesConfig) -> ConfigResult<()> {
    if let Some(file) = &entries.file {
        let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !matches!(ext, "yaml" | "yml" | "json") {
            return Err(ConfigError::invalid(
                "entries.file",
                format!("expected a .yaml, .yml or .json file, got {}", file.display()),
            ));
        }
    }

    if entries.debounce_ms > MAX_DEBOUNCE_MS {
        return Err(ConfigError::invalid(
            "entries.debounce_ms",
            format!("must not exceed {MAX_DEBOUNCE_MS}"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn invalid_field(config: &TrellisConfig) -> Option<String> {
        match validate_config(config) {
            Err(ConfigError::Invalid { field, .. }) => Some(field),
            _ => None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&TrellisConfig::default()).is_ok());
    }

    #[test]
    fn test_file_output_requires_path() {
        let mut config = TrellisConfig::default();
        config.logging.output = LogOutput::File;
        assert_eq!(invalid_field(&config).as_deref(), Some("logging.file_path"));

        config.logging.file_path = Some(PathBuf::from("logs/trellis.log"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_filter_targets() {
        let mut config = TrellisConfig::default();
        config
            .logging
            .filters
            .insert("trellis core".into(), Default::default());
        assert_eq!(invalid_field(&config).as_deref(), Some("logging.filters"));
    }

    #[test]
    fn test_entry_file_format() {
        let mut config = TrellisConfig::default();
        config.entries.file = Some(PathBuf::from("plugins.toml"));
        assert_eq!(invalid_field(&config).as_deref(), Some("entries.file"));

        config.entries.file = Some(PathBuf::from("plugins.yml"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_debounce_bound() {
        let mut config = TrellisConfig::default();
        config.entries.debounce_ms = MAX_DEBOUNCE_MS + 1;
        assert_eq!(
            invalid_field(&config).as_deref(),
            Some("entries.debounce_ms")
        );
    }
}
