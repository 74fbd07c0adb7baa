// sitesnap/src/engine/lock.rs
//! The system lock replaces the old `backup_running` / `maintenance_mode`
//! flags with one record that is created atomically (hard link onto the
//! lock path fails when it already exists), so two processes can never both
//! observe the lock as free and take it.
//!
//! Taking over an expired record is a rename followed by a check that the
//! record moved was the expired one; a fresh lock moved by mistake is linked
//! back. Two callers racing on the same expired record can still both
//! succeed if a third creates a lock between those two operations, so
//! takeover is best effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::engine::ProcessKind;
use crate::errors::{AppError, Result};

const LOCK_FILE: &str = "system.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockName {
    BackupRunning,
    MaintenanceMode,
}

impl LockName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::BackupRunning => "backup_running",
            LockName::MaintenanceMode => "maintenance_mode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    pub process_key: String,
    pub kind: ProcessKind,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub name: LockName,
    pub holder: LockHolder,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Operator-facing explanation of why another process cannot start.
    pub fn busy_message(&self) -> String {
        match self.name {
            LockName::BackupRunning => format!(
                "A backup is currently running (started by {}). Try again later.",
                self.holder.actor
            ),
            LockName::MaintenanceMode => format!(
                "The site is in maintenance mode while a {} runs (started by {}).",
                self.holder.kind, self.holder.actor
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemLock {
    path: PathBuf,
    ttl: chrono::Duration,
}

impl SystemLock {
    pub fn new(state_dir: &Path, ttl: chrono::Duration) -> Self {
        SystemLock {
            path: state_dir.join(LOCK_FILE),
            ttl,
        }
    }

    /// Live lock record, if any. Expired records are reported as absent.
    pub fn current(&self) -> Result<Option<LockRecord>> {
        Ok(self
            .read()?
            .filter(|record| !record.is_expired(Utc::now())))
    }

    pub fn is_maintenance_mode(&self) -> Result<bool> {
        Ok(matches!(
            self.current()?,
            Some(LockRecord { name: LockName::MaintenanceMode, .. })
        ))
    }

    /// Takes the lock for `holder`, or refreshes it when `holder` already
    /// owns it. Fails with [`AppError::LockBusy`] when someone else does.
    pub fn acquire(&self, name: LockName, holder: &LockHolder) -> Result<LockRecord> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let now = Utc::now();
        let record = LockRecord {
            name,
            holder: holder.clone(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };

        // Second pass only happens after a stale record was moved aside.
        for _ in 0..2 {
            match self.create_exclusive(&record) {
                Ok(()) => {
                    info!(lock = name.as_str(), actor = %holder.actor, "System lock acquired");
                    return Ok(record);
                }
                Err(AppError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            match self.read()? {
                Some(existing) if existing.holder == *holder => {
                    let refreshed = LockRecord {
                        acquired_at: existing.acquired_at,
                        ..record
                    };
                    self.overwrite(&refreshed)?;
                    debug!(lock = name.as_str(), actor = %holder.actor, "System lock refreshed");
                    return Ok(refreshed);
                }
                Some(existing) if !existing.is_expired(now) => {
                    return Err(AppError::LockBusy(existing));
                }
                Some(existing) => {
                    warn!(
                        lock = existing.name.as_str(),
                        actor = %existing.holder.actor,
                        "Taking over expired system lock"
                    );
                    self.move_aside_if(&existing)?;
                }
                None => {}
            }
        }

        match self.read()? {
            Some(existing) => Err(AppError::LockBusy(existing)),
            None => Err(AppError::Precondition(
                "System lock could not be acquired; try again".to_string(),
            )),
        }
    }

    /// Releases the lock if `holder` owns it. Returns whether anything was removed.
    pub fn release(&self, holder: &LockHolder) -> Result<bool> {
        match self.read()? {
            Some(existing) if existing.holder == *holder => {
                self.remove()?;
                info!(lock = existing.name.as_str(), actor = %holder.actor, "System lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Unconditionally clears the lock (operator action).
    pub fn force_release(&self) -> Result<Option<LockRecord>> {
        let existing = self.read()?;
        self.remove()?;
        if let Some(record) = &existing {
            warn!(lock = record.name.as_str(), actor = %record.holder.actor, "System lock force-released");
        }
        Ok(existing)
    }

    fn read(&self) -> Result<Option<LockRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding unreadable lock record");
                self.move_aside()?;
                Ok(None)
            }
        }
    }

    fn create_exclusive(&self, record: &LockRecord) -> Result<()> {
        let staged = self.stage(record)?;
        fs::hard_link(staged.path(), &self.path)?;
        Ok(())
    }

    fn overwrite(&self, record: &LockRecord) -> Result<()> {
        let staged = self.stage(record)?;
        staged
            .persist(&self.path)
            .map_err(|e| AppError::Io(e.error))?;
        Ok(())
    }

    fn stage(&self, record: &LockRecord) -> Result<NamedTempFile> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&serde_json::to_vec_pretty(record)?)?;
        staged.as_file().sync_all()?;
        Ok(staged)
    }

    fn aside_path(&self) -> PathBuf {
        self.path
            .with_extension(format!("stale-{}", uuid::Uuid::new_v4()))
    }

    fn move_aside(&self) -> Result<()> {
        let aside = self.aside_path();
        match fs::rename(&self.path, &aside) {
            Ok(()) => {
                discard_file(&aside);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves the lock file aside only if it still holds `expected`. A record
    /// that changed since it was read is put back untouched.
    fn move_aside_if(&self, expected: &LockRecord) -> Result<()> {
        let aside = self.aside_path();
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let moved: Option<LockRecord> = fs::read_to_string(&aside)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());
        if moved.as_ref() != Some(expected) {
            debug!(path = %self.path.display(), "Lock changed during takeover, restoring it");
            match fs::hard_link(&aside, &self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!(path = %self.path.display(), "Lock replaced twice during takeover");
                }
                Err(e) => {
                    discard_file(&aside);
                    return Err(e.into());
                }
            }
        }
        discard_file(&aside);
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn discard_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove stale lock file");
        }
    }
}
