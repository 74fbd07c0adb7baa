// sitesnap/src/backup/publish.rs
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::errors::AppError;
use crate::settings::BackupStorage;
use crate::storage::{BACKUP_FOLDER, Disk, StorageConnection};

/// Remote connections a finished backup goes to, besides the local copy:
/// the primary disk first, then every other enabled connection. Keys are
/// unique in the result.
pub fn remote_destinations(
    primary: BackupStorage,
    connections: &[StorageConnection],
) -> Result<Vec<StorageConnection>> {
    let mut out = Vec::new();
    let mut seen: HashSet<&str> = HashSet::from(["local"]);

    if primary != BackupStorage::Local {
        let connection = connections
            .iter()
            .find(|c| c.enabled && c.key == primary.as_str())
            .ok_or_else(|| {
                AppError::Config(format!(
                    "Backup storage '{}' is selected but no enabled storage connection with that key exists",
                    primary.as_str()
                ))
            })?;
        seen.insert(connection.key.as_str());
        out.push(connection.clone());
    }

    for connection in connections.iter().filter(|c| c.enabled) {
        if seen.insert(connection.key.as_str()) {
            out.push(connection.clone());
        }
    }
    Ok(out)
}

/// Copies `container` into the backup folder of every disk, in order.
/// The first failing disk aborts the publish with its error.
pub async fn publish(container: &Path, disks: &[Box<dyn Disk>]) -> Result<Vec<String>> {
    let file_name = container
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid container path {}", container.display()))?;
    let remote_path = format!("{}/{}", BACKUP_FOLDER, file_name);

    let mut stored_on = Vec::with_capacity(disks.len());
    for disk in disks {
        disk.put_file(&remote_path, container)
            .await
            .with_context(|| format!("Failed to store backup on '{}'", disk.name()))?;
        info!(disk = disk.name(), path = %remote_path, "Backup stored");
        stored_on.push(disk.name().to_string());
    }
    Ok(stored_on)
}
