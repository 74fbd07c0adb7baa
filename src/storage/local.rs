// sitesnap/src/storage/local.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Disk, ensure_relative};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDiskConfig {
    pub root: PathBuf,
}

pub struct LocalDisk {
    name: String,
    root: PathBuf,
}

impl LocalDisk {
    pub fn new(name: &str, root: &Path) -> Self {
        LocalDisk {
            name: name.to_string(),
            root: root.to_path_buf(),
        }
    }

    pub fn resolve(&self, remote_path: &str) -> Result<PathBuf> {
        ensure_relative(remote_path)?;
        Ok(self.root.join(remote_path))
    }
}

#[async_trait]
impl Disk for LocalDisk {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_file(&self, remote_path: &str, source: &Path) -> Result<()> {
        let target = self.resolve(remote_path)?;
        if target == source {
            debug!(disk = %self.name, path = %target.display(), "Source already in place");
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::copy(source, &target).await.with_context(|| {
            format!("Failed to copy {} to {}", source.display(), target.display())
        })?;
        Ok(())
    }

    async fn get_file(&self, remote_path: &str, dest: &Path) -> Result<()> {
        let source = self.resolve(remote_path)?;
        if source == dest {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::copy(&source, dest).await.with_context(|| {
            format!("Failed to copy {} to {}", source.display(), dest.display())
        })?;
        Ok(())
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let target = self.resolve(remote_path)?;
        tokio::fs::remove_file(&target)
            .await
            .with_context(|| format!("Failed to delete {}", target.display()))
    }
}
