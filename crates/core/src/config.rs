//! TOML-based configuration for the resolution engine and its reference store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Conflict resolution settings.
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Local revision store settings.
    #[serde(default)]
    pub store: StoreConfig,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// How many times a resolver may be invoked for one conflict before the
    /// resolution gives up because the document keeps changing (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Local SQLite store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. The store lives in memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Milliseconds to wait on a locked database (default 5000).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Use WAL journaling for on-disk stores (default true).
    #[serde(default = "default_true")]
    pub wal: bool,
}

fn default_busy_timeout() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout(),
            wal: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load an [`EngineConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolution.max_attempts".into(),
                detail: "at least one resolver attempt is required".into(),
            });
        }
        if self.store.busy_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.busy_timeout_ms".into(),
                detail: "busy timeout must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[resolution]
max_attempts = 3

[store]
path = "/tmp/docsync/local.db"
busy_timeout_ms = 2000
wal = false
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: EngineConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.resolution.max_attempts, 3);
        assert_eq!(
            config.store.path.as_deref(),
            Some(Path::new("/tmp/docsync/local.db"))
        );
        assert_eq!(config.store.busy_timeout_ms, 2000);
        assert!(!config.store.wal);
    }

    #[test]
    fn test_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.resolution.max_attempts, 5);
        assert!(config.store.path.is_none());
        assert_eq!(config.store.busy_timeout_ms, 5000);
        assert!(config.store.wal);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = EngineConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.resolution.max_attempts, 3);
    }

    #[test]
    fn test_file_not_found() {
        let result = EngineConfig::load_from_file("/nonexistent/engine.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[resolution\nmax_attempts = ").unwrap();
        let result = EngineConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.resolution.max_attempts = 0;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "resolution.max_attempts"
        ));
    }
}
