//! Configuration for a tagged memory instance.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::directory::{DEFAULT_MAX_CONTEXT_KEYS, EXPIRY_EXEMPT_IMPORTANCE};
use crate::error::{MemoryError, MemoryResult};

/// File name of the persisted arenas inside a storage directory.
pub const MEMORY_FILE_NAME: &str = "memory.json";
/// File name of the persisted key directory inside a storage directory.
pub const CONTEXT_KEYS_FILE_NAME: &str = "context_keys.json";

/// Settings for [`TaggedMemory`](crate::TaggedMemory).
///
/// Every field has a default, so a TOML file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Path of `memory.json` (working, disk and archived arenas).
    pub memory_file: PathBuf,
    /// Path of `context_keys.json` (the metadata directory).
    pub context_keys_file: PathBuf,
    /// Directory that receives `<key>.archive` files.
    pub archive_dir: PathBuf,
    /// Directory that receives timestamped backups.
    pub backup_dir: PathBuf,
    /// Budget for the working layer, in bytes.
    pub max_working_size: usize,
    /// Budget for the disk layer, in bytes.
    pub max_disk_size: usize,
    /// Maximum number of keys the directory may hold.
    pub max_context_keys: usize,
    /// Timestamped backups retained per file family.
    pub max_backups: usize,
    /// Keys at or above this importance survive expiry sweeps.
    pub expiry_exemption_importance: u8,
    /// Size of the LLM context window, in characters.
    pub context_window_max_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::in_dir(".")
    }
}

impl MemoryConfig {
    /// Place both data files and the archive/backup directories under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            memory_file: dir.join(MEMORY_FILE_NAME),
            context_keys_file: dir.join(CONTEXT_KEYS_FILE_NAME),
            archive_dir: dir.join("archive"),
            backup_dir: dir.join("backups"),
            max_working_size: 256 * 1024,
            max_disk_size: 4 * 1024 * 1024,
            max_context_keys: DEFAULT_MAX_CONTEXT_KEYS,
            max_backups: 10,
            expiry_exemption_importance: EXPIRY_EXEMPT_IMPORTANCE,
            context_window_max_size: 512 * 1024,
        }
    }

    pub fn from_toml_str(text: &str) -> MemoryResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if self.max_context_keys == 0 {
            return Err(MemoryError::invalid("max_context_keys must be positive"));
        }
        if self.expiry_exemption_importance > 100 {
            return Err(MemoryError::invalid(
                "expiry_exemption_importance must be within 0..=100",
            ));
        }
        if self.max_working_size == 0 || self.max_disk_size == 0 {
            return Err(MemoryError::invalid("layer budgets must be positive"));
        }
        if self.context_window_max_size == 0 {
            return Err(MemoryError::invalid(
                "context_window_max_size must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_live_in_current_dir() {
        let config = MemoryConfig::default();
        assert_eq!(config.memory_file, PathBuf::from("./memory.json"));
        assert_eq!(config.context_keys_file, PathBuf::from("./context_keys.json"));
        assert_eq!(config.max_backups, 10);
        assert_eq!(config.expiry_exemption_importance, 80);
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let config = MemoryConfig::from_toml_str(
            r#"
            memory_file = "/var/lib/agent/memory.json"
            max_disk_size = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.memory_file, PathBuf::from("/var/lib/agent/memory.json"));
        assert_eq!(config.max_disk_size, 100);
        assert_eq!(config.max_context_keys, DEFAULT_MAX_CONTEXT_KEYS);
    }

    #[test]
    fn rejects_out_of_range_exemption() {
        let err = MemoryConfig::from_toml_str("expiry_exemption_importance = 120").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_zero_layer_budget() {
        let err = MemoryConfig::from_toml_str("max_working_size = 0").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = MemoryConfig::from_toml_str("max_backups = \"ten\"").unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }
}
