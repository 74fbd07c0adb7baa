// sitesnap/src/backup/mod.rs
//! Backup process: dump the database, archive the site into size-bounded
//! parts, package them into one container and publish it.

pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod publish;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppContext;
use crate::engine::state::ProcessState;
use crate::engine::{LockAttempt, Process, ProcessKind, StepContext, StepOutcome, step_sequence};
use crate::errors::AppError;
use crate::settings::{BackupContent, BackupStorage};
use crate::storage::{BACKUP_FOLDER, Disk};
use crate::utils::{human_size, slugify};
use archive::{Manifest, PlanEntry};

step_sequence! {
    pub enum BackupStep {
        Start => "start",
        CheckRequirements => "check_requirements",
        DumpingDatabase => "dumping_database",
        ZippingFiles => "zipping_files",
        PackagingParts => "packaging_parts",
        SaveBackup => "save_backup",
        Clean => "clean",
        Finished => "finished",
    }
}

const DUMP_ARCHIVE_PATH: &str = "database/dump.sql";

// Payload keys
const TMP_DIR: &str = "tmp_dir";
const BASE_NAME: &str = "base_name";
const CONTENT: &str = "content";
const STORAGE: &str = "storage";
const DUMP_PATH: &str = "dump_path";
const PART_PATHS: &str = "part_paths";
const CONTAINER_PATH: &str = "container_path";

pub struct BackupProcess {
    app: Arc<AppContext>,
}

impl BackupProcess {
    pub fn new(app: Arc<AppContext>) -> Self {
        BackupProcess { app }
    }

    fn tmp_dir(&self, actor: &str) -> PathBuf {
        self.app.config.tmp_dir().join(format!("backup-{actor}"))
    }

    async fn start(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
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

        let file_setting = self.app.settings.backup_file_setting()?;
        let base_name = format!(
            "{}-backup-{}",
            slugify(&self.app.config.app_name),
            Utc::now().format("%Y-%m-%d_%H-%M-%S")
        );
        ctx.state.set(TMP_DIR, &tmp_dir)?;
        ctx.state.set(BASE_NAME, &base_name)?;
        ctx.state.set(CONTENT, file_setting.content)?;
        ctx.state.set(STORAGE, file_setting.storage)?;

        info!(actor = ctx.actor(), base_name = %base_name, content = file_setting.content.as_str(), "Backup started");
        Ok(StepOutcome::advance(
            BackupStep::CheckRequirements,
            "Backup started",
        ))
    }

    async fn check_requirements(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
        let content: BackupContent = ctx.state.require(CONTENT)?;
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;

        let required = self.app.config.min_free_disk_bytes;
        if required > 0 {
            match available_space(&tmp_dir) {
                Some(available) if available < required => {
                    return Err(AppError::Precondition(format!(
                        "Not enough free disk space: {} available, {} required",
                        human_size(available),
                        human_size(required)
                    ))
                    .into());
                }
                Some(_) => {}
                None => warn!(path = %tmp_dir.display(), "Could not determine free disk space"),
            }
        }

        if content.includes_database() {
            self.app
                .database()?
                .check_connection()
                .await
                .context("Database is not reachable")?;
            Ok(StepOutcome::advance(
                BackupStep::DumpingDatabase,
                "Requirements met",
            ))
        } else {
            Ok(StepOutcome::advance(BackupStep::ZippingFiles, "Requirements met"))
        }
    }

    async fn dumping_database(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        let dump_path = tmp_dir.join("dump.sql");
        let summary = self.app.database()?.dump_to_file(&dump_path).await?;
        ctx.state.set(DUMP_PATH, &dump_path)?;
        Ok(StepOutcome::advance(
            BackupStep::ZippingFiles,
            format!("Database dumped ({} tables, {} rows)", summary.tables, summary.rows),
        ))
    }

    async fn zipping_files(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        let base_name: String = ctx.state.require(BASE_NAME)?;
        let content: BackupContent = ctx.state.require(CONTENT)?;
        let dump_path: Option<PathBuf> = ctx.state.get(DUMP_PATH);

        // Always rebuilt from scratch; partial parts from a failed attempt are dropped.
        let parts_dir = tmp_dir.join("parts");
        if parts_dir.exists() {
            fs::remove_dir_all(&parts_dir)?;
        }

        let config = &self.app.config;
        let exclusions = config.exclusions();
        let dump_entry = dump_path.map(|source| PlanEntry {
            source,
            dest: DUMP_ARCHIVE_PATH.to_string(),
        });
        let files = content
            .includes_files()
            .then(|| archive::plan(&config.app_root, &exclusions, "files"))
            .into_iter()
            .flatten();

        let report = archive::pack_into(
            dump_entry.into_iter().chain(files),
            &parts_dir,
            &base_name,
            config.chunk_size_bytes,
        )?;
        ctx.state.set(PART_PATHS, &report.parts)?;

        let mut message = format!("Files archived into {} part(s)", report.parts.len());
        if !report.skipped.is_empty() {
            message.push_str(&format!(
                "; {} unreadable file(s) left out: {}",
                report.skipped.len(),
                skipped_preview(&report.skipped)
            ));
        }
        Ok(StepOutcome::advance(BackupStep::PackagingParts, message))
    }

    async fn packaging_parts(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        let base_name: String = ctx.state.require(BASE_NAME)?;
        let content: BackupContent = ctx.state.require(CONTENT)?;
        let parts: Vec<PathBuf> = ctx.state.get(PART_PATHS).unwrap_or_default();
        let container = tmp_dir.join(format!("{base_name}.zip"));

        let resumed = container.exists() && !parts.is_empty() && parts.iter().all(|p| !p.exists());
        if !resumed {
            let manifest = Manifest {
                app_name: self.app.config.app_name.clone(),
                app_version: self.app.settings.app_version()?,
                created_at: Utc::now(),
                content: content.as_str().to_string(),
                parts: parts
                    .iter()
                    .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
                    .collect(),
            };
            archive::package_parts(&parts, &container, &manifest)?;
        }

        ctx.state.remove(PART_PATHS);
        ctx.state.set(CONTAINER_PATH, &container)?;
        Ok(StepOutcome::advance(BackupStep::SaveBackup, "Parts packaged"))
    }

    async fn save_backup(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
        let container: PathBuf = ctx.state.require(CONTAINER_PATH)?;
        let primary: BackupStorage = ctx.state.require(STORAGE)?;

        let connections = self.app.settings.storage_connections()?;
        let mut disks: Vec<Box<dyn Disk>> = vec![Box::new(self.app.local_disk())];
        for connection in publish::remote_destinations(primary, &connections)? {
            disks.push(connection.config.connect(&connection.key).await?);
        }

        let stored_on = publish::publish(&container, &disks).await?;
        Ok(StepOutcome::advance(
            BackupStep::Clean,
            format!("Backup saved to {}", stored_on.join(", ")),
        ))
    }

    async fn clean(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
        let tmp_dir: PathBuf = ctx.state.require(TMP_DIR)?;
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)
                .with_context(|| format!("Failed to remove {}", tmp_dir.display()))?;
        }
        Ok(StepOutcome::advance(BackupStep::Finished, "Temporary files removed"))
    }

    async fn finished(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<BackupStep>> {
        let base_name: String = ctx.state.require(BASE_NAME)?;
        Ok(StepOutcome::finish(format!("Backup {base_name}.zip completed")))
    }
}

#[async_trait]
impl Process for BackupProcess {
    type Step = BackupStep;
    const KIND: ProcessKind = ProcessKind::Backup;

    async fn run_step(
        &self,
        step: BackupStep,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepOutcome<BackupStep>> {
        match step {
            BackupStep::Start => self.start(ctx).await,
            BackupStep::CheckRequirements => self.check_requirements(ctx).await,
            BackupStep::DumpingDatabase => self.dumping_database(ctx).await,
            BackupStep::ZippingFiles => self.zipping_files(ctx).await,
            BackupStep::PackagingParts => self.packaging_parts(ctx).await,
            BackupStep::SaveBackup => self.save_backup(ctx).await,
            BackupStep::Clean => self.clean(ctx).await,
            BackupStep::Finished => self.finished(ctx).await,
        }
    }

    async fn cleanup(&self, state: &ProcessState) {
        let tmp_dir = state
            .get::<PathBuf>(TMP_DIR)
            .unwrap_or_else(|| self.tmp_dir(&state.actor));
        if tmp_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&tmp_dir) {
                warn!(path = %tmp_dir.display(), error = %e, "Failed to remove backup temp directory");
            }
        }
    }
}

fn skipped_preview(skipped: &[PathBuf]) -> String {
    const SHOWN: usize = 5;
    let mut listed: Vec<String> = skipped
        .iter()
        .take(SHOWN)
        .map(|p| p.display().to_string())
        .collect();
    if skipped.len() > SHOWN {
        listed.push(format!("and {} more", skipped.len() - SHOWN));
    }
    listed.join(", ")
}

/// Free space on the disk whose mount point is the longest prefix of `path`.
fn available_space(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// A finished backup container in the local backup folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub name: String,
    pub created_at: chrono::DateTime<Utc>,
    pub size: String,
    pub path: String,
}

/// Containers in the local backup folder, newest first.
pub fn list_backups(app: &AppContext) -> Result<Vec<BackupFile>> {
    let dir = app.config.backups_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "zip") {
            continue;
        }
        let metadata = entry.metadata()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push(BackupFile {
            path: format!("{}/{}", BACKUP_FOLDER, name),
            name,
            created_at: metadata.modified()?.into(),
            size: human_size(metadata.len()),
        });
    }
    files.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
    Ok(files)
}

/// Disk-relative path of a container; bare file names live in the backup folder.
pub fn backup_file_path(name: &str) -> String {
    if name.starts_with(&format!("{}/", BACKUP_FOLDER)) {
        name.to_string()
    } else {
        format!("{}/{}", BACKUP_FOLDER, name)
    }
}

/// Deletes one container from the local backup folder.
pub async fn delete_backup(app: &AppContext, path: &str) -> Result<()> {
    let rel = backup_file_path(path);
    app.local_disk().delete(&rel).await?;
    info!(path = %rel, "Backup deleted");
    Ok(())
}

/// Copies one container from the disk named `disk` to `to`, which may be a
/// directory. Returns the written path; nothing is left at `to` on failure.
pub async fn download_backup(app: &AppContext, path: &str, disk: &str, to: &Path) -> Result<PathBuf> {
    let rel = backup_file_path(path);
    let name = Path::new(&rel)
        .file_name()
        .ok_or_else(|| AppError::InvalidInput(format!("Invalid backup path '{}'", path)))?;
    let dest = if to.is_dir() { to.join(name) } else { to.to_path_buf() };
    let mut staging = dest.clone().into_os_string();
    staging.push(".partial");

    let source = app.disk(disk).await?;
    crate::storage::fetch_file(&*source, &rel, Path::new(&staging), &dest).await?;
    info!(path = %rel, disk, dest = %dest.display(), "Backup downloaded");
    Ok(dest)
}
