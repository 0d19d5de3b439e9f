//! Storage configuration

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override for the data directory
pub const DATA_DIR_ENV: &str = "TASKFREE_DATA_DIR";

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Private application data directory
    pub data_dir: PathBuf,
    /// Live database file name
    pub database_name: String,
    /// Temporary encrypted database built during migration
    pub temp_database_name: String,
    /// Backup of the plaintext database held during the swap
    pub backup_database_name: String,
    /// Backup-eligible preferences file
    pub flags_file: String,
    /// Backup-excluded preferences file
    pub secret_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_name: "checklists.db".to_string(),
            temp_database_name: "checklists_temp.db".to_string(),
            backup_database_name: "checklists_backup.db".to_string(),
            flags_file: "settings_flags.json".to_string(),
            secret_file: "encryption_secret.json".to_string(),
        }
    }
}

impl StorageConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Resolve the data directory from the environment or platform defaults
    pub fn from_env() -> Self {
        Self::with_data_dir(default_data_dir())
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations where two roles share a file
    pub fn validate(&self) -> Result<()> {
        let names = [
            &self.database_name,
            &self.temp_database_name,
            &self.backup_database_name,
            &self.flags_file,
            &self.secret_file,
        ];
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(Error::Config("File names must not be empty".to_string()));
        }
        for (i, a) in names.iter().enumerate() {
            if names[i + 1..].contains(a) {
                return Err(Error::Config(format!("File name '{}' is used twice", a)));
            }
        }
        Ok(())
    }

    /// The three database paths
    pub fn db_paths(&self) -> DbPaths {
        DbPaths {
            live: self.data_dir.join(&self.database_name),
            temp: self.data_dir.join(&self.temp_database_name),
            backup: self.data_dir.join(&self.backup_database_name),
        }
    }

    /// Backup-eligible preferences path
    pub fn flags_path(&self) -> PathBuf {
        self.data_dir.join(&self.flags_file)
    }

    /// Backup-excluded preferences path
    pub fn secret_path(&self) -> PathBuf {
        self.data_dir.join(&self.secret_file)
    }
}

/// Well-known database paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPaths {
    /// Live store
    pub live: PathBuf,
    /// Newly built encrypted store
    pub temp: PathBuf,
    /// Plaintext original during the swap
    pub backup: PathBuf,
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from("com", "TaskFree", "TaskFree")
        .map(|dirs| dirs.data_local_dir().join("databases"))
        .unwrap_or_else(|| PathBuf::from("."))
}
