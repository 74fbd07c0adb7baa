// sitesnap/src/engine/state.rs
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::engine::ProcessKind;
use crate::engine::lock::LockHolder;
use crate::errors::{AppError, Result};

const MAX_ACTOR_LEN: usize = 64;

/// Persisted progress of one process kind for one actor. `expires_at` is
/// fixed at creation; a run that outlives it starts over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    pub key: String,
    pub actor: String,
    pub kind: ProcessKind,
    pub current_step: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProcessState {
    pub fn new(actor: &str, kind: ProcessKind, first_step: &str, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        ProcessState {
            key: uuid::Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            kind,
            current_step: first_step.to_string(),
            payload: Map::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn holder(&self) -> LockHolder {
        LockHolder {
            process_key: self.key.clone(),
            kind: self.kind,
            actor: self.actor.clone(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.payload
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Like [`get`](Self::get) but a missing value means an earlier step did
    /// not complete, which is an integrity failure for the current one.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key).ok_or_else(|| {
            AppError::Integrity(format!(
                "'{}' is missing from the {} process state",
                key, self.kind
            ))
        })
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        self.payload.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        self.payload.remove(key);
    }
}

/// Rejects actor ids that could escape the state directory.
pub fn validate_actor(actor: &str) -> Result<()> {
    if actor.is_empty()
        || actor.len() > MAX_ACTOR_LEN
        || actor.contains(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
    {
        return Err(AppError::InvalidInput(format!(
            "Invalid actor id '{}': use 1-{} characters from [A-Za-z0-9_-]",
            actor, MAX_ACTOR_LEN
        )));
    }
    Ok(())
}

/// One JSON document per (kind, actor), replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        StateStore {
            root: state_dir.join("processes"),
        }
    }

    fn path(&self, kind: ProcessKind, actor: &str) -> Result<PathBuf> {
        validate_actor(actor)?;
        Ok(self.root.join(kind.as_str()).join(format!("{actor}.json")))
    }

    /// Loads the stored state as-is, expired or not.
    pub fn load(&self, kind: ProcessKind, actor: &str) -> Result<Option<ProcessState>> {
        let path = self.path(kind, actor)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, state: &ProcessState) -> Result<()> {
        let path = self.path(state.kind, &state.actor)?;
        let dir = path
            .parent()
            .ok_or_else(|| AppError::Config(format!("Invalid state path {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&serde_json::to_vec_pretty(state)?)?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|e| AppError::Io(e.error))?;
        Ok(())
    }

    pub fn delete(&self, kind: ProcessKind, actor: &str) -> Result<()> {
        match fs::remove_file(self.path(kind, actor)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
