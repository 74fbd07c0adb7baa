// sitesnap/src/settings/mod.rs
//! Name/value settings persisted as one JSON document and cached in-process.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{AppError, Result};
use crate::storage::StorageConnection;

pub const BACKUP_FILE_SETTING: &str = "backup_file_setting";
pub const BACKUP_SCHEDULE_SETTING: &str = "backup_schedule_setting";
pub const BACKUP_STORAGE_SETTING: &str = "backup_storage_setting";
pub const APP_VERSION: &str = "app_version";

const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_APP_VERSION: &str = "1.0.0";

/// What a backup contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupContent {
    #[default]
    All,
    Files,
    Database,
}

impl BackupContent {
    pub fn includes_files(&self) -> bool {
        matches!(self, BackupContent::All | BackupContent::Files)
    }

    pub fn includes_database(&self) -> bool {
        matches!(self, BackupContent::All | BackupContent::Database)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupContent::All => "all",
            BackupContent::Files => "files",
            BackupContent::Database => "database",
        }
    }
}

/// Primary disk a finished backup goes to (besides the local copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupStorage {
    #[default]
    Local,
    Ftp,
    Sftp,
    S3,
}

impl BackupStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStorage::Local => "local",
            BackupStorage::Ftp => "ftp",
            BackupStorage::Sftp => "sftp",
            BackupStorage::S3 => "s3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupFileSetting {
    #[serde(rename = "type", default)]
    pub content: BackupContent,
    #[serde(default)]
    pub storage: BackupStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum ScheduleInterval {
    #[serde(rename = "12_hours")]
    #[value(name = "12_hours")]
    TwelveHours,
    #[default]
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "fortnightly")]
    Fortnightly,
    #[serde(rename = "monthly")]
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackupScheduleSetting {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: ScheduleInterval,
}

pub struct SettingsStore {
    path: PathBuf,
    cache: RwLock<Option<Map<String, Value>>>,
}

impl SettingsStore {
    pub fn new(state_dir: &Path) -> Self {
        SettingsStore {
            path: state_dir.join(SETTINGS_FILE),
            cache: RwLock::new(None),
        }
    }

    /// Every stored setting, read through the cache.
    pub fn all(&self) -> Result<Map<String, Value>> {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            return Ok(cached.clone());
        }

        let loaded = match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %self.path.display(), "Settings loaded");
        *self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(loaded.clone());
        Ok(loaded)
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.all()?.remove(name) {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| {
                AppError::Config(format!("Setting '{}' is malformed: {}", name, e))
            })?)),
            None => Ok(None),
        }
    }

    /// Writes one setting and invalidates the cache.
    pub fn set<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let mut settings = self.all()?;
        settings.insert(name.to_string(), serde_json::to_value(value)?);

        let dir = self
            .path
            .parent()
            .ok_or_else(|| AppError::Config(format!("Invalid settings path {}", self.path.display())))?;
        fs::create_dir_all(dir)?;
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&serde_json::to_vec_pretty(&settings)?)?;
        staged.persist(&self.path).map_err(|e| AppError::Io(e.error))?;

        *self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }

    pub fn backup_file_setting(&self) -> Result<BackupFileSetting> {
        Ok(self.get(BACKUP_FILE_SETTING)?.unwrap_or_default())
    }

    pub fn backup_schedule_setting(&self) -> Result<BackupScheduleSetting> {
        Ok(self.get(BACKUP_SCHEDULE_SETTING)?.unwrap_or_default())
    }

    pub fn storage_connections(&self) -> Result<Vec<StorageConnection>> {
        Ok(self.get(BACKUP_STORAGE_SETTING)?.unwrap_or_default())
    }

    pub fn set_storage_connections(&self, connections: &[StorageConnection]) -> Result<()> {
        let mut seen = HashSet::new();
        for connection in connections {
            if connection.key.trim().is_empty() {
                return Err(AppError::InvalidInput("Storage connection key cannot be empty".to_string()));
            }
            if !seen.insert(connection.key.as_str()) {
                return Err(AppError::InvalidInput(format!(
                    "Duplicate storage connection key '{}'",
                    connection.key
                )));
            }
        }
        self.set(BACKUP_STORAGE_SETTING, &connections)
    }

    pub fn app_version(&self) -> Result<String> {
        Ok(self
            .get::<String>(APP_VERSION)?
            .unwrap_or_else(|| DEFAULT_APP_VERSION.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskConfig, LocalDiskConfig};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_empty() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let settings = SettingsStore::new(dir.path());

        let file = settings.backup_file_setting()?;
        assert_eq!(file.content, BackupContent::All);
        assert_eq!(file.storage, BackupStorage::Local);
        assert!(!settings.backup_schedule_setting()?.enabled);
        assert!(settings.storage_connections()?.is_empty());
        assert_eq!(settings.app_version()?, "1.0.0");
        Ok(())
    }

    #[test]
    fn test_write_invalidates_cache() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let settings = SettingsStore::new(dir.path());
        assert_eq!(settings.app_version()?, "1.0.0");

        settings.set(APP_VERSION, &"1.2.0")?;
        assert_eq!(settings.app_version()?, "1.2.0");

        let reopened = SettingsStore::new(dir.path());
        assert_eq!(reopened.app_version()?, "1.2.0");
        Ok(())
    }

    #[test]
    fn test_wire_format() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let settings = SettingsStore::new(dir.path());
        settings.set(
            BACKUP_FILE_SETTING,
            &BackupFileSetting {
                content: BackupContent::Database,
                storage: BackupStorage::S3,
            },
        )?;
        settings.set(
            BACKUP_SCHEDULE_SETTING,
            &BackupScheduleSetting {
                enabled: true,
                schedule: ScheduleInterval::TwelveHours,
            },
        )?;

        let stored = settings.all()?;
        assert_eq!(stored[BACKUP_FILE_SETTING], json!({"type": "database", "storage": "s3"}));
        assert_eq!(stored[BACKUP_SCHEDULE_SETTING], json!({"enabled": true, "schedule": "12_hours"}));
        Ok(())
    }

    #[test]
    fn test_duplicate_connection_keys_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let settings = SettingsStore::new(dir.path());
        let connection = StorageConnection {
            key: "mirror".to_string(),
            enabled: true,
            config: DiskConfig::Local(LocalDiskConfig {
                root: dir.path().join("mirror"),
            }),
        };

        assert!(settings
            .set_storage_connections(&[connection.clone(), connection.clone()])
            .is_err());
        settings.set_storage_connections(&[connection])?;
        assert_eq!(settings.storage_connections()?.len(), 1);
        Ok(())
    }
}
