//! Engine configuration
//!
//! Every setting has a default derived from a single root directory. A TOML
//! document may override any subset; relative paths in it resolve against the root.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PENDING_CAPACITY: usize = 64;
pub const DEFAULT_KEYSTORE_SERVICE: &str = "clipstash";
pub const DEFAULT_KEY_NAME: &str = "clipboard-data-key";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Blob directory, one file per offer id
    pub data_dir: PathBuf,
    /// Initial state of the monitoring toggle
    pub monitoring: bool,
    /// Persist every offer of a selection, not only the chosen one
    pub record_all_offers: bool,
    /// Retention limit; pinned entries never count against eviction
    pub max_entries: Option<usize>,
    /// Selections held while the encryption key is pending
    pub pending_capacity: usize,
    pub keystore_service: String,
    pub key_name: String,
}

/// On-disk shape: everything optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    monitoring: Option<bool>,
    record_all_offers: Option<bool>,
    max_entries: Option<usize>,
    pending_capacity: Option<usize>,
    keystore_service: Option<String>,
    key_name: Option<String>,
}

impl EngineConfig {
    /// Defaults: `<root>/clipboard.db` and `<root>/clipboard-data`
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            database_path: root.join("clipboard.db"),
            data_dir: root.join("clipboard-data"),
            monitoring: true,
            record_all_offers: false,
            max_entries: None,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            keystore_service: DEFAULT_KEYSTORE_SERVICE.to_string(),
            key_name: DEFAULT_KEY_NAME.to_string(),
        }
    }

    pub fn from_toml_str(text: &str, root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        let file: ConfigFile = toml::from_str(text)?;
        let defaults = Self::new(root);

        let config = Self {
            database_path: file
                .database_path
                .map(|p| root.join(p))
                .unwrap_or(defaults.database_path),
            data_dir: file.data_dir.map(|p| root.join(p)).unwrap_or(defaults.data_dir),
            monitoring: file.monitoring.unwrap_or(defaults.monitoring),
            record_all_offers: file.record_all_offers.unwrap_or(defaults.record_all_offers),
            max_entries: file.max_entries.or(defaults.max_entries),
            pending_capacity: file.pending_capacity.unwrap_or(defaults.pending_capacity),
            keystore_service: file.keystore_service.unwrap_or(defaults.keystore_service),
            key_name: file.key_name.unwrap_or(defaults.key_name),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>, root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text, root)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_capacity == 0 {
            return Err(ConfigError::Invalid("pending_capacity must be at least 1".into()));
        }
        if self.max_entries == Some(0) {
            return Err(ConfigError::Invalid("max_entries must be at least 1".into()));
        }
        if self.keystore_service.trim().is_empty() || self.key_name.trim().is_empty() {
            return Err(ConfigError::Invalid("keystore entry names must not be empty".into()));
        }
        // Sweeps and wipes treat everything under data_dir as blobs
        if self.database_path.starts_with(&self.data_dir) {
            return Err(ConfigError::Invalid(format!(
                "data_dir {} must not contain database_path {}",
                self.data_dir.display(),
                self.database_path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_under_root() {
        let config = EngineConfig::new("/var/lib/clipstash");
        assert_eq!(config.database_path, PathBuf::from("/var/lib/clipstash/clipboard.db"));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/clipstash/clipboard-data"));
        assert!(config.monitoring);
        assert!(!config.record_all_offers);
        assert_eq!(config.max_entries, None);
        assert_eq!(config.pending_capacity, 64);
        assert_eq!(config.key_name, "clipboard-data-key");
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_overlay() {
        let toml_str = r#"
            data_dir = "blobs"
            monitoring = false
            record_all_offers = true
            max_entries = 500
        "#;
        let config = EngineConfig::from_toml_str(toml_str, "/root").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/root/blobs"));
        assert_eq!(config.database_path, PathBuf::from("/root/clipboard.db"));
        assert!(!config.monitoring);
        assert!(config.record_all_offers);
        assert_eq!(config.max_entries, Some(500));
    }

    #[test]
    fn test_absolute_path_kept() {
        let config = EngineConfig::from_toml_str(r#"database_path = "/tmp/x.db""#, "/root").unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("pending_capacity = 0", "/root"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("max_entries = 0", "/root"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("unknown_key = 1", "/root"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("monitoring = \"yes\"", "/root"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_data_dir_containing_database() {
        for toml_str in [
            r#"data_dir = ".""#,
            r#"data_dir = "/root""#,
            r#"data_dir = "/var"
               database_path = "/var/lib/clipstash/clipboard.db""#,
            r#"data_dir = "shared"
               database_path = "shared""#,
        ] {
            assert!(
                matches!(EngineConfig::from_toml_str(toml_str, "/root"), Err(ConfigError::Invalid(_))),
                "accepted {}",
                toml_str
            );
        }

        let sibling = EngineConfig::from_toml_str(r#"data_dir = "clipboard-db-blobs""#, "/root").unwrap();
        assert_eq!(sibling.data_dir, PathBuf::from("/root/clipboard-db-blobs"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clipstash.toml");
        std::fs::write(&path, "max_entries = 42\nmonitoring = false\n").unwrap();

        let config = EngineConfig::load(&path, dir.path()).unwrap();
        assert_eq!(config.max_entries, Some(42));
        assert!(!config.monitoring);
        assert_eq!(config.database_path, dir.path().join("clipboard.db"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = EngineConfig::load(dir.path().join("absent.toml"), dir.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
