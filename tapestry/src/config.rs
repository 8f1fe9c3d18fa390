//! Engine configuration, loaded from YAML.
//!
//! Every field has a default, so an empty document (or no file at all)
//! yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub handles: HandleConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Agendas running longer than this are reported as slow
    #[serde(default = "default_agenda_timeout_ms")]
    pub agenda_timeout_ms: u64,
}

fn default_agenda_timeout_ms() -> u64 {
    5000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            agenda_timeout_ms: default_agenda_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Raise the default filter to `debug`
    #[serde(default)]
    pub verbose: bool,
}

fn default_filter() -> String {
    String::from("info")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleConfig {
    /// TTL applied to handles created without one, e.g. `"2d"`
    #[serde(default)]
    pub default_ttl: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Protocol used for backing keys built by `StorageKey::reference_mode_for`
    #[serde(default = "default_backing_protocol")]
    pub reference_mode_backing_protocol: String,
}

fn default_backing_protocol() -> String {
    String::from("ram")
}

impl StorageConfig {
    /// Reference-mode key named `name` on the configured backing protocol
    pub fn reference_mode_key(&self, name: &str) -> crate::storage::StorageKey {
        crate::storage::StorageKey::reference_mode_for(name, &self.reference_mode_backing_protocol)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            reference_mode_backing_protocol: default_backing_protocol(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if contents.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.agenda_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.agenda_timeout_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(ttl) = &self.handles.default_ttl {
            crate::data::Ttl::parse(ttl).map_err(|e| ConfigError::InvalidValue {
                field: "handles.default_ttl".into(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Default filter directive after applying `verbose`
    pub fn log_filter(&self) -> &str {
        if self.logging.verbose {
            "debug"
        } else {
            self.logging.filter.as_str()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.scheduler.agenda_timeout_ms, 5000);
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_yaml_str(
            "scheduler:\n  agenda_timeout_ms: 250\nlogging:\n  verbose: true\nhandles:\n  default_ttl: 2d\n",
        )
        .unwrap();
        assert_eq!(config.scheduler.agenda_timeout_ms, 250);
        assert_eq!(config.log_filter(), "debug");
        assert_eq!(config.handles.default_ttl.as_deref(), Some("2d"));
        assert_eq!(config.storage.reference_mode_backing_protocol, "ram");
    }

    #[test]
    fn test_rejects_bad_ttl() {
        let err = EngineConfig::from_yaml_str("handles:\n  default_ttl: forever\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err =
            EngineConfig::from_yaml_str("scheduler:\n  agenda_timeout_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("agenda_timeout_ms"));
    }

    #[test]
    fn test_reference_mode_key_uses_backing_protocol() {
        let config =
            EngineConfig::from_yaml_str("storage:\n  reference_mode_backing_protocol: memdb\n")
                .unwrap();
        let key = config.storage.reference_mode_key("people");
        match key {
            crate::storage::StorageKey::ReferenceMode(key) => {
                assert_eq!(key.backing_key.to_string(), "memdb://people-backing");
                assert_eq!(key.storage_key.to_string(), "memdb://people");
            }
            other => panic!("expected a reference-mode key, got {}", other),
        }
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  filter: tapestry=trace").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_filter(), "tapestry=trace");
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_file("/definitely/not/here.yml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
