// sitesnap/src/storage/mod.rs
//! Storage disks that finished backups are published to and fetched from.

pub mod ftp;
pub mod local;
pub mod s3;
pub mod sftp;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path};
use tracing::warn;

use crate::errors::AppError;

pub use ftp::FtpDiskConfig;
pub use local::{LocalDisk, LocalDiskConfig};
pub use s3::S3DiskConfig;
pub use sftp::SftpDiskConfig;

/// Folder under every disk root that holds backup containers.
pub const BACKUP_FOLDER: &str = "backups";

#[async_trait]
pub trait Disk: Send + Sync {
    fn name(&self) -> &str;

    /// Streams `source` to `remote_path`, creating parent folders as needed.
    async fn put_file(&self, remote_path: &str, source: &Path) -> Result<()>;

    /// Streams `remote_path` into `dest`.
    async fn get_file(&self, remote_path: &str, dest: &Path) -> Result<()>;

    async fn delete(&self, remote_path: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DiskConfig {
    Local(LocalDiskConfig),
    Ftp(FtpDiskConfig),
    Sftp(SftpDiskConfig),
    S3(S3DiskConfig),
}

impl DiskConfig {
    pub fn driver(&self) -> &'static str {
        match self {
            DiskConfig::Local(_) => "local",
            DiskConfig::Ftp(_) => "ftp",
            DiskConfig::Sftp(_) => "sftp",
            DiskConfig::S3(_) => "s3",
        }
    }

    pub async fn connect(&self, name: &str) -> Result<Box<dyn Disk>> {
        Ok(match self {
            DiskConfig::Local(cfg) => Box::new(LocalDisk::new(name, &cfg.root)),
            DiskConfig::Ftp(cfg) => Box::new(ftp::FtpDisk::new(name, cfg.clone())),
            DiskConfig::Sftp(cfg) => Box::new(sftp::SftpDisk::new(name, cfg.clone())),
            DiskConfig::S3(cfg) => Box::new(
                s3::S3Disk::connect(name, cfg)
                    .await
                    .with_context(|| format!("Failed to configure S3 disk '{}'", name))?,
            ),
        })
    }
}

/// A named remote destination as stored in the settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConnection {
    pub key: String,
    #[serde(default)]
    pub enabled: bool,
    pub config: DiskConfig,
}

/// Joins a disk root and a relative path with forward slashes.
pub fn remote_join(root: Option<&str>, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    match root.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty()) {
        Some(root) => format!("{root}/{rel}"),
        None => rel.to_string(),
    }
}

/// Relative paths only; anything that could climb out of a disk root is refused.
pub fn ensure_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.is_empty()
        || p.components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(AppError::Storage(format!("refusing unsafe path '{}'", path)).into());
    }
    Ok(())
}

/// Downloads `remote_path` from `disk` into `staging`, then moves it to
/// `dest`. `dest` only ever appears complete; a failed transfer leaves
/// nothing behind. Both paths must be on the same filesystem.
pub async fn fetch_file(disk: &dyn Disk, remote_path: &str, staging: &Path, dest: &Path) -> Result<()> {
    for dir in [staging.parent(), dest.parent()].into_iter().flatten() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    if let Err(e) = disk.get_file(remote_path, staging).await {
        if let Err(rm) = tokio::fs::remove_file(staging).await {
            if rm.kind() != ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %rm, "Failed to remove partial download");
            }
        }
        return Err(e.context(format!("Failed to fetch {} from '{}'", remote_path, disk.name())));
    }
    tokio::fs::rename(staging, dest).await.with_context(|| {
        format!("Failed to move {} into place at {}", staging.display(), dest.display())
    })?;
    Ok(())
}

/// Parent folders of a slash-separated remote path, outermost first.
pub(crate) fn remote_parents(remote_path: &str) -> Vec<String> {
    let absolute = remote_path.starts_with('/');
    let segments: Vec<&str> = remote_path.split('/').filter(|s| !s.is_empty()).collect();
    let mut parents = Vec::new();
    let mut acc = String::new();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        if absolute || !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(segment);
        parents.push(acc.clone());
    }
    parents
}
