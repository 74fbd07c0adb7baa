// sitesnap/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const DEFAULT_CHUNK_SIZE_MB: u64 = 50;
const DEFAULT_PROCESS_TTL_HOURS: i64 = 5;
const DEFAULT_MIN_FREE_DISK_MB: u64 = 500;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Paths (relative to the application root) that never belong in a snapshot.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".github",
    ".idea",
    ".vscode",
    ".cagefs",
    "node_modules",
    "tests",
    "logs",
    "access-logs",
    "storage/logs",
    "storage/framework/cache",
    "storage/framework/sessions",
    "storage/framework/views",
    "public/.well-known",
];

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    pub snapshot_before_restore: Option<bool>,
    pub cache_clear_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonUpdateOptions {
    pub manifest_url: Option<String>,
    pub migrate_command: Option<Vec<String>>,
    pub download_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub app_name: Option<String>,
    pub app_root: Option<PathBuf>,
    pub storage_root: Option<PathBuf>,
    pub database_url: Option<String>,
    pub chunk_size_mb: Option<u64>,
    pub process_ttl_hours: Option<i64>,
    pub min_free_disk_mb: Option<u64>,
    pub exclude_paths: Option<Vec<PathBuf>>,
    pub restore: Option<JsonRestoreOptions>,
    pub update: Option<JsonUpdateOptions>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub snapshot_before_restore: bool,
    pub cache_clear_command: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub manifest_url: Option<String>,
    pub migrate_command: Option<Vec<String>>,
    pub download_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub app_root: PathBuf,
    pub storage_root: PathBuf,
    pub database_url: Option<String>,
    pub chunk_size_bytes: u64,
    pub process_ttl: chrono::Duration,
    pub min_free_disk_bytes: u64,
    pub exclude_paths: Vec<PathBuf>,
    pub restore: RestoreOptions,
    pub update: UpdateOptions,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let app_root = raw
            .app_root
            .context("app_root must be set in config.json")?;
        if app_root.as_os_str().is_empty() {
            anyhow::bail!("app_root cannot be empty in config.json.");
        }
        let storage_root = raw
            .storage_root
            .context("storage_root must be set in config.json")?;
        if storage_root.as_os_str().is_empty() {
            anyhow::bail!("storage_root cannot be empty in config.json.");
        }

        // Exclusions are matched component-wise against walked paths, so both
        // roots must be in the same canonical form as the walk.
        let app_root = resolve_path(&app_root)
            .with_context(|| format!("Failed to resolve app_root {}", app_root.display()))?;
        let storage_root = resolve_path(&storage_root)
            .with_context(|| format!("Failed to resolve storage_root {}", storage_root.display()))?;
        let exclude_paths = raw
            .exclude_paths
            .unwrap_or_default()
            .into_iter()
            .map(|path| {
                if path.is_absolute() {
                    resolve_path(&path)
                        .with_context(|| format!("Failed to resolve exclude path {}", path.display()))
                } else {
                    Ok(path)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let chunk_size_mb = raw.chunk_size_mb.unwrap_or(DEFAULT_CHUNK_SIZE_MB);
        if chunk_size_mb == 0 {
            anyhow::bail!("chunk_size_mb must be greater than zero in config.json.");
        }
        let chunk_size_bytes = megabytes(chunk_size_mb, "chunk_size_mb")?;
        let min_free_disk_bytes = megabytes(
            raw.min_free_disk_mb.unwrap_or(DEFAULT_MIN_FREE_DISK_MB),
            "min_free_disk_mb",
        )?;
        let ttl_hours = raw.process_ttl_hours.unwrap_or(DEFAULT_PROCESS_TTL_HOURS);
        if ttl_hours <= 0 {
            anyhow::bail!("process_ttl_hours must be greater than zero in config.json.");
        }
        let process_ttl = chrono::Duration::try_hours(ttl_hours)
            .context("process_ttl_hours is too large in config.json")?;

        // The environment is a fallback only; the file wins when both are present.
        let database_url = raw
            .database_url
            .filter(|s| !s.trim().is_empty())
            .or_else(|| env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()));

        let restore = raw.restore.unwrap_or_default();
        let update = raw.update.unwrap_or_default();

        Ok(AppConfig {
            app_name: raw
                .app_name
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "site".to_string()),
            app_root,
            storage_root,
            database_url,
            chunk_size_bytes,
            process_ttl,
            min_free_disk_bytes,
            exclude_paths,
            restore: RestoreOptions {
                snapshot_before_restore: restore.snapshot_before_restore.unwrap_or(false),
                cache_clear_command: restore.cache_clear_command.filter(|c| !c.is_empty()),
            },
            update: UpdateOptions {
                manifest_url: update.manifest_url.filter(|s| !s.trim().is_empty()),
                migrate_command: update.migrate_command.filter(|c| !c.is_empty()),
                download_timeout: Duration::from_secs(
                    update.download_timeout_secs.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
                ),
            },
        })
    }

    /// Root of the always-present local disk.
    pub fn local_disk_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.storage_root.join(crate::storage::BACKUP_FOLDER)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.storage_root.join("tmp")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.storage_root.join("state")
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.storage_root.join("updates")
    }

    pub fn rollback_dir(&self) -> PathBuf {
        self.storage_root.join("rollback")
    }

    /// Absolute exclusion prefixes for walking `app_root`.
    ///
    /// Includes every directory this tool writes to, so a snapshot never
    /// contains its own output.
    pub fn exclusions(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = DEFAULT_EXCLUDES
            .iter()
            .map(|rel| self.app_root.join(rel))
            .collect();
        out.extend(self.exclude_paths.iter().map(|rel| {
            if rel.is_absolute() {
                rel.clone()
            } else {
                self.app_root.join(rel)
            }
        }));
        out.extend([
            self.backups_dir(),
            self.tmp_dir(),
            self.state_dir(),
            self.updates_dir(),
            self.rollback_dir(),
        ]);
        out
    }
}

fn megabytes(value: u64, field: &str) -> Result<u64> {
    value
        .checked_mul(1024 * 1024)
        .with_context(|| format!("{} must be at most {} in config.json", field, u64::MAX / (1024 * 1024)))
}

/// Absolute, symlink-free form of `path`. The longest existing ancestor is
/// canonicalized and the rest is appended with `.` and `..` folded, so
/// directories that do not exist yet resolve the same way they will once
/// created.
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .context("Failed to read the current directory")?
            .join(path)
    };

    let components: Vec<Component> = absolute.components().collect();
    for keep in (1..=components.len()).rev() {
        let prefix: PathBuf = components[..keep].iter().collect();
        if let Ok(base) = fs::canonicalize(&prefix) {
            return Ok(fold_components(base, &components[keep..]));
        }
    }
    Ok(fold_components(PathBuf::new(), &components))
}

fn fold_components(mut base: PathBuf, rest: &[Component]) -> PathBuf {
    for component in rest {
        match component {
            Component::ParentDir => {
                base.pop();
            }
            Component::CurDir => {}
            other => base.push(other.as_os_str()),
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).expect("valid raw config")
    }

    #[test]
    fn test_defaults_applied() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "app_name": "My CMS",
            "app_root": "/srv/site",
            "storage_root": "/srv/site/storage/app",
            "database_url": "postgres://u:p@localhost/site"
        })))?;

        assert_eq!(config.chunk_size_bytes, 50 * 1024 * 1024);
        assert_eq!(config.process_ttl, chrono::Duration::hours(5));
        assert_eq!(config.min_free_disk_bytes, 500 * 1024 * 1024);
        assert!(!config.restore.snapshot_before_restore);
        assert_eq!(config.update.download_timeout, Duration::from_secs(300));
        assert_eq!(config.backups_dir(), PathBuf::from("/srv/site/storage/app/backups"));
        Ok(())
    }

    #[test]
    fn test_missing_app_root_is_rejected() {
        let result = AppConfig::from_raw(raw(json!({ "storage_root": "/tmp/x" })));
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("app_root must be set"));
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let result = AppConfig::from_raw(raw(json!({
            "app_root": "/srv/site",
            "storage_root": "/srv/data",
            "chunk_size_mb": 0
        })));
        assert!(result.is_err());
    }

    #[test]
    fn test_exclusions_cover_own_output() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "app_root": "/srv/site",
            "storage_root": "/srv/site/storage/app",
            "exclude_paths": ["public/uploads/cache", "/opt/elsewhere"]
        })))?;
        let exclusions = config.exclusions();

        assert!(exclusions.contains(&PathBuf::from("/srv/site/.git")));
        assert!(exclusions.contains(&PathBuf::from("/srv/site/public/uploads/cache")));
        assert!(exclusions.contains(&PathBuf::from("/opt/elsewhere")));
        assert!(exclusions.contains(&PathBuf::from("/srv/site/storage/app/backups")));
        assert!(exclusions.contains(&PathBuf::from("/srv/site/storage/app/tmp")));
        Ok(())
    }

    #[test]
    fn test_restore_and_update_options() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "app_root": "/srv/site",
            "storage_root": "/srv/data",
            "restore": {
                "snapshot_before_restore": true,
                "cache_clear_command": ["php", "artisan", "optimize:clear"]
            },
            "update": {
                "manifest_url": "https://updates.example.com/latest.json",
                "migrate_command": [],
                "download_timeout_secs": 30
            }
        })))?;

        assert!(config.restore.snapshot_before_restore);
        assert_eq!(
            config.restore.cache_clear_command.as_deref(),
            Some(&["php".to_string(), "artisan".to_string(), "optimize:clear".to_string()][..])
        );
        assert_eq!(config.update.migrate_command, None);
        assert_eq!(config.update.download_timeout, Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn test_roots_are_normalized_before_matching() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let site = dir.path().join("site");
        fs::create_dir_all(site.join("app"))?;
        let canonical_site = fs::canonicalize(&site)?;

        let config = AppConfig::from_raw(raw(json!({
            "app_root": dir.path().join("site/../site"),
            "storage_root": dir.path().join("site/./storage/app"),
            "exclude_paths": [dir.path().join("site/app/../vendor")]
        })))?;

        assert_eq!(config.app_root, canonical_site);
        assert_eq!(config.storage_root, canonical_site.join("storage/app"));
        let exclusions = config.exclusions();
        assert!(exclusions.contains(&canonical_site.join("vendor")));
        assert!(exclusions.contains(&canonical_site.join("storage/app/tmp")));
        assert!(exclusions.contains(&canonical_site.join("storage/app/state")));
        Ok(())
    }

    #[test]
    fn test_oversized_byte_values_are_rejected() {
        let result = AppConfig::from_raw(raw(json!({
            "app_root": "/srv/site",
            "storage_root": "/srv/data",
            "chunk_size_mb": u64::MAX
        })));
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("chunk_size_mb must be at most"));
    }
}
