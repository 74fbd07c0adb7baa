// sitesnap/src/engine/history.rs
//! Outcome of every run, kept after the process state itself is gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::engine::ProcessKind;
use crate::engine::state::ProcessState;
use crate::errors::{AppError, Result};

/// Runs kept per process kind; older ones are pruned on write.
const MAX_RUNS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Processing,
    Finished,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub key: String,
    pub kind: ProcessKind,
    pub actor: String,
    pub status: RunStatus,
    pub step: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    fn new(state: &ProcessState) -> Self {
        RunRecord {
            key: state.key.clone(),
            kind: state.kind,
            actor: state.actor.clone(),
            status: RunStatus::Processing,
            step: state.current_step.clone(),
            result: None,
            errors: Vec::new(),
            started_at: state.created_at,
            updated_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn progress(&mut self, step: &str) {
        self.status = RunStatus::Processing;
        self.step = step.to_string();
    }

    pub fn finish(&mut self, step: &str, message: &str) {
        self.status = RunStatus::Finished;
        self.step = step.to_string();
        self.result = Some(message.to_string());
        self.finished_at = Some(Utc::now());
    }

    /// `terminal` is false when the run keeps its step pointer and can be retried.
    pub fn fail(&mut self, step: &str, message: &str, terminal: bool) {
        self.status = RunStatus::Failed;
        self.step = step.to_string();
        self.errors.push(message.to_string());
        if terminal {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn abort(&mut self, reason: &str) {
        self.status = RunStatus::Aborted;
        self.errors.push(reason.to_string());
        self.finished_at = Some(Utc::now());
    }
}

/// One JSON document per run under `history/<kind>/<key>.json`.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    pub fn new(state_dir: &Path) -> Self {
        HistoryStore {
            root: state_dir.join("history"),
        }
    }

    fn path(&self, kind: ProcessKind, key: &str) -> Result<PathBuf> {
        uuid::Uuid::parse_str(key)
            .map_err(|_| AppError::InvalidInput(format!("Invalid run key '{}'", key)))?;
        Ok(self.root.join(kind.as_str()).join(format!("{key}.json")))
    }

    fn load(&self, path: &Path) -> Result<Option<RunRecord>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Applies `change` to the record of the run `state` belongs to,
    /// creating it on first use.
    pub fn update(&self, state: &ProcessState, change: impl FnOnce(&mut RunRecord)) -> Result<RunRecord> {
        let path = self.path(state.kind, &state.key)?;
        let mut record = self.load(&path)?.unwrap_or_else(|| RunRecord::new(state));
        change(&mut record);
        record.updated_at = Utc::now();

        let dir = path
            .parent()
            .ok_or_else(|| AppError::Config(format!("Invalid history path {}", path.display())))?;
        fs::create_dir_all(dir)?;
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&serde_json::to_vec_pretty(&record)?)?;
        staged.persist(&path).map_err(|e| AppError::Io(e.error))?;

        self.prune(state.kind);
        Ok(record)
    }

    /// Runs of `kind`, newest first, optionally for one actor only.
    pub fn list(&self, kind: ProcessKind, actor: Option<&str>) -> Result<Vec<RunRecord>> {
        let dir = self.root.join(kind.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.load(&path) {
                Ok(Some(record)) if actor.is_none_or(|a| a == record.actor) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run record"),
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    fn prune(&self, kind: ProcessKind) {
        let records = match self.list(kind, None) {
            Ok(records) => records,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to list run history for pruning");
                return;
            }
        };
        for old in records.iter().skip(MAX_RUNS) {
            if let Ok(path) = self.path(kind, &old.key) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to prune run record");
                }
            }
        }
    }
}
