// sitesnap/src/restore/mod.rs
//! Restore process: unpack a backup container and overlay its files and
//! database onto the live site while maintenance mode is held.

pub(crate) mod db_restore;
pub(crate) mod files;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppContext;
use crate::backup::archive::{self, MANIFEST_NAME, Manifest};
use crate::backup::backup_file_path;
use crate::engine::state::ProcessState;
use crate::engine::{LockAttempt, Process, ProcessKind, StepContext, StepOutcome, step_sequence};
use crate::errors::AppError;
use crate::storage::{self, ensure_relative};
use crate::utils::run_command;

step_sequence! {
    pub enum RestoreStep {
        Start => "start",
        UnzipBackup => "unzip_backup",
        BackupFiles => "backup_files",
        BackupDatabase => "backup_database",
        RestoreFiles => "restore_files",
        RestoreDatabase => "restore_database",
        Clean => "clean",
        Finished => "finished",
    }
}

// Payload keys
const FILE: &str = "file";
const DISK: &str = "disk";
const TMP_DIR: &str = "tmp_dir";
const ARCHIVE_PATH: &str = "archive_path";
const HAS_FILES: &str = "has_files";
const HAS_DATABASE: &str = "has_database";
const ROLLBACK_DIR: &str = "rollback_dir";

/// Payload recording which container to restore and the disk it lives on.
pub fn selection(file: &str, disk: Option<&str>) -> Result<Map<String, Value>> {
    let file = backup_file_path(file);
    ensure_relative(&file)?;
    let mut payload = Map::new();
    payload.insert(FILE.to_string(), Value::from(file));
    payload.insert(DISK.to_string(), Value::from(disk.unwrap_or("local")));
    Ok(payload)
}

pub struct RestoreProcess {
    app: Arc<AppContext>,
}

impl RestoreProcess {
    pub fn new(app: Arc<AppContext>) -> Self {
        RestoreProcess { app }
    }

    fn tmp_dir(&self, actor: &str) -> PathBuf {
        self.app.config.tmp_dir().join(format!("restore-{actor}"))
    }

    fn extracted_dir(tmp_dir: &Path) -> PathBuf {
        tmp_dir.join("extracted")
    }

    /// Makes the selected container available locally. Remote containers are
    /// downloaded through the actor's temp dir and land next to the local
    /// ones only once complete.
    async fn locate_archive(&self, actor: &str, file: &str, disk: &str) -> Result<Option<PathBuf>> {
        let local = self.app.local_disk().resolve(file)?;
        if disk == "local" {
            return Ok(local.is_file().then_some(local));
        }
        let remote = self.app.disk(disk).await?;
        let download_dir = self.tmp_dir(actor).join("download");
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup.zip".to_string());
        let staging = download_dir.join(format!("{file_name}.partial"));
        let fetched = storage::fetch_file(&*remote, file, &staging, &local).await;
        if let Err(e) = fs::remove_dir_all(&download_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %download_dir.display(), error = %e, "Failed to remove download directory");
            }
        }
        match fetched {
            Ok(()) => {
                info!(disk, file, path = %local.display(), "Backup file downloaded");
                Ok(Some(local))
            }
            Err(e) => {
                warn!(disk, file, error = %format!("{e:#}"), "Backup file could not be fetched");
                Ok(None)
            }
        }
    }

    async fn start(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<RestoreStep>> {
        if let Some(held) = ctx.system_lock() {
            if held.holder != ctx.state.holder() && !held.is_expired(Utc::now()) {
                return Ok(StepOutcome::reject(held.busy_message()));
            }
        }

        let Some(file) = ctx.state.get::<String>(FILE) else {
            return Ok(StepOutcome::reject(
                "No backup file selected; select one before restoring",
            ));
        };
        let disk = ctx.state.get::<String>(DISK).unwrap_or_else(|| "local".to_string());
        let Some(archive_path) = self.locate_archive(ctx.actor(), &file, &disk).await? else {
            return Ok(StepOutcome::reject(format!(
                "Backup file '{}' was not found on '{}'",
                file, disk
            )));
        };

        if let LockAttempt::Busy(held) = ctx.acquire_lock()? {
            return Ok(StepOutcome::reject(held.busy_message()));
        }

        let tmp_dir = self.tmp_dir(ctx.actor());
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)
                .with_context(|| format!("Failed to clear {}", tmp_dir.display()))?;
        }
        fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("Failed to create temporary directory {}", tmp_dir.display()))?;

        ctx.state.set(TMP_DIR, &tmp_dir)?;
        ctx.state.set(ARCHIVE_PATH, &archive_path)?;
        info!(actor = ctx.actor(), file = %file, disk = %disk, "Restore started, maintenance mode on");
        Ok(StepOutcome::advance(RestoreStep::UnzipBackup, "Restore started"))
    }

    async fn unzip_backup(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<RestoreStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        let archive_path: PathBuf = ctx.state.require(ARCHIVE_PATH)?;
        let extracted = Self::extracted_dir(&tmp_dir);

        archive::extract_archive(&archive_path, &extracted)?;
        read_manifest(&extracted);

        for (_, part) in inner_parts(&extracted)? {
            archive::extract_archive(&part, &extracted)?;
            fs::remove_file(&part)
                .with_context(|| format!("Failed to delete extracted part {}", part.display()))?;
        }

        let has_files = extracted.join("files").is_dir();
        let has_database = extracted.join("database").is_dir();
        if !has_files && !has_database {
            return Err(AppError::Integrity(format!(
                "backup {} contains neither files nor a database dump",
                archive_path.display()
            ))
            .into());
        }
        ctx.state.set(HAS_FILES, has_files)?;
        ctx.state.set(HAS_DATABASE, has_database)?;

        let next = if self.app.config.restore.snapshot_before_restore {
            let rollback = self
                .app
                .config
                .rollback_dir()
                .join(Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string());
            ctx.state.set(ROLLBACK_DIR, &rollback)?;
            if has_files {
                RestoreStep::BackupFiles
            } else {
                RestoreStep::BackupDatabase
            }
        } else if has_files {
            RestoreStep::RestoreFiles
        } else {
            RestoreStep::RestoreDatabase
        };
        Ok(StepOutcome::advance(next, "Backup extracted"))
    }

    async fn backup_files(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<RestoreStep>> {
        let rollback: PathBuf = ctx.state.require(ROLLBACK_DIR)?;
        let has_database: bool = ctx.state.require(HAS_DATABASE)?;
        let config = &self.app.config;
        let copied = files::snapshot_tree(&config.app_root, &config.exclusions(), &rollback.join("files"))?;

        let next = if has_database {
            RestoreStep::BackupDatabase
        } else {
            RestoreStep::RestoreFiles
        };
        Ok(StepOutcome::advance(
            next,
            format!("Snapshot of {} live file(s) saved to {}", copied, rollback.display()),
        ))
    }

    async fn backup_database(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<RestoreStep>> {
        let rollback: PathBuf = ctx.state.require(ROLLBACK_DIR)?;
        let has_files: bool = ctx.state.require(HAS_FILES)?;
        let dump_dir = rollback.join("database");
        fs::create_dir_all(&dump_dir)
            .with_context(|| format!("Failed to create {}", dump_dir.display()))?;
        self.app
            .database()?
            .dump_to_file(&dump_dir.join("dump.sql"))
            .await
            .context("Failed to snapshot the live database")?;

        let next = if has_files {
            RestoreStep::RestoreFiles
        } else {
            RestoreStep::RestoreDatabase
        };
        Ok(StepOutcome::advance(next, "Live database snapshotted"))
    }

    async fn restore_files(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<RestoreStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        let has_database: bool = ctx.state.require(HAS_DATABASE)?;
        let config = &self.app.config;

        let copied = files::overlay_tree(&Self::extracted_dir(&tmp_dir).join("files"), &config.app_root)?;
        if let Some(command) = &config.restore.cache_clear_command {
            run_command(command, &config.app_root)
                .await
                .context("Failed to clear application caches")?;
        }

        let next = if has_database {
            RestoreStep::RestoreDatabase
        } else {
            RestoreStep::Clean
        };
        Ok(StepOutcome::advance(next, format!("{} file(s) restored", copied)))
    }

    async fn restore_database(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<RestoreStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        let database_dir = Self::extracted_dir(&tmp_dir).join("database");
        let sql_file = db_restore::find_sql_file(&database_dir)?.ok_or_else(|| {
            AppError::Integrity("no SQL dump file found in the backup".to_string())
        })?;

        let executed = self.app.database()?.replay_file(&sql_file).await?;
        Ok(StepOutcome::advance(
            RestoreStep::Clean,
            format!("Database restored ({} statements)", executed),
        ))
    }

    async fn clean(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<RestoreStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)
                .with_context(|| format!("Failed to remove {}", tmp_dir.display()))?;
        }
        Ok(StepOutcome::advance(RestoreStep::Finished, "Temporary files removed"))
    }
}

#[async_trait]
impl Process for RestoreProcess {
    type Step = RestoreStep;
    const KIND: ProcessKind = ProcessKind::Restore;

    async fn run_step(
        &self,
        step: RestoreStep,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepOutcome<RestoreStep>> {
        match step {
            RestoreStep::Start => self.start(ctx).await,
            RestoreStep::UnzipBackup => self.unzip_backup(ctx).await,
            RestoreStep::BackupFiles => self.backup_files(ctx).await,
            RestoreStep::BackupDatabase => self.backup_database(ctx).await,
            RestoreStep::RestoreFiles => self.restore_files(ctx).await,
            RestoreStep::RestoreDatabase => self.restore_database(ctx).await,
            RestoreStep::Clean => self.clean(ctx).await,
            RestoreStep::Finished => Ok(StepOutcome::finish(
                "Restore completed, maintenance mode off",
            )),
        }
    }

    async fn cleanup(&self, state: &ProcessState) {
        let tmp_dir = state
            .get::<PathBuf>(TMP_DIR)
            .unwrap_or_else(|| self.tmp_dir(&state.actor));
        if tmp_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&tmp_dir) {
                warn!(path = %tmp_dir.display(), error = %e, "Failed to remove restore temp directory");
            }
        }
    }
}

/// Inner `<base>-partN.zip` files at the top of the extracted tree, in part
/// order. Other archives the container may carry are left alone.
fn inner_parts(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut parts = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let number = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(archive::part_number);
        if let Some(number) = number.filter(|_| path.is_file()) {
            parts.push((number, path));
        }
    }
    parts.sort();
    Ok(parts)
}

fn read_manifest(extracted: &Path) {
    let path = extracted.join(MANIFEST_NAME);
    let Ok(raw) = fs::read(&path) else {
        return;
    };
    match serde_json::from_slice::<Manifest>(&raw) {
        Ok(manifest) => info!(
            app = %manifest.app_name,
            version = %manifest.app_version,
            created_at = %manifest.created_at,
            content = %manifest.content,
            parts = manifest.parts.len(),
            "Restoring backup"
        ),
        Err(e) => warn!(error = %e, "Backup manifest is unreadable"),
    }
}
