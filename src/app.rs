// sitesnap/src/app.rs
use anyhow::Result;
use std::sync::Arc;

use crate::backup::BackupProcess;
use crate::config::AppConfig;
use crate::database::{Database, PgDatabase};
use crate::engine::history::HistoryStore;
use crate::engine::lock::SystemLock;
use crate::engine::state::StateStore;
use crate::engine::{Engine, Process};
use crate::errors::AppError;
use crate::restore::RestoreProcess;
use crate::settings::SettingsStore;
use crate::storage::{Disk, LocalDisk};
use crate::update::UpdateProcess;

/// Everything a step handler may reach: configuration, settings and the
/// site database.
pub struct AppContext {
    pub config: AppConfig,
    pub settings: SettingsStore,
    database: Option<Arc<dyn Database>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let database = config
            .database_url
            .as_deref()
            .map(|url| Arc::new(PgDatabase::new(url)) as Arc<dyn Database>);
        Self::with_database(config, database)
    }

    pub fn with_database(config: AppConfig, database: Option<Arc<dyn Database>>) -> Self {
        let settings = SettingsStore::new(&config.state_dir());
        AppContext {
            config,
            settings,
            database,
        }
    }

    pub fn database(&self) -> Result<&dyn Database> {
        self.database.as_deref().ok_or_else(|| {
            AppError::Config(
                "database_url is not set in config.json or the DATABASE_URL environment variable"
                    .to_string(),
            )
            .into()
        })
    }

    pub fn local_disk(&self) -> LocalDisk {
        LocalDisk::new("local", self.config.local_disk_root())
    }

    /// Connects the storage connection named `key`; `local` is always available.
    pub async fn disk(&self, key: &str) -> Result<Box<dyn Disk>> {
        if key == "local" {
            return Ok(Box::new(self.local_disk()));
        }
        let connection = self
            .settings
            .storage_connections()?
            .into_iter()
            .find(|c| c.key == key)
            .ok_or_else(|| AppError::Config(format!("No storage connection named '{}'", key)))?;
        connection.config.connect(&connection.key).await
    }

    pub fn system_lock(&self) -> SystemLock {
        SystemLock::new(&self.config.state_dir(), self.config.process_ttl)
    }

    fn engine<P: Process>(&self, process: P) -> Engine<P> {
        Engine::new(
            process,
            StateStore::new(&self.config.state_dir()),
            HistoryStore::new(&self.config.state_dir()),
            self.system_lock(),
            self.config.process_ttl,
        )
    }
}

pub fn backup_engine(ctx: &Arc<AppContext>) -> Engine<BackupProcess> {
    ctx.engine(BackupProcess::new(ctx.clone()))
}

pub fn restore_engine(ctx: &Arc<AppContext>) -> Engine<RestoreProcess> {
    ctx.engine(RestoreProcess::new(ctx.clone()))
}

pub fn update_engine(ctx: &Arc<AppContext>) -> Engine<UpdateProcess> {
    ctx.engine(UpdateProcess::new(ctx.clone()))
}

#[cfg(test)]
pub mod testing {
    //! Scratch site layout shared by the process tests.

    use super::*;
    use crate::config::RawJsonConfig;
    use serde_json::json;
    use std::path::Path;

    pub fn config_for(root: &Path, extra: serde_json::Value) -> AppConfig {
        let mut raw = json!({
            "app_name": "Test Site",
            "app_root": root.join("site"),
            "storage_root": root.join("site/storage/app"),
            "min_free_disk_mb": 0,
            "chunk_size_mb": 1
        });
        if let (Some(base), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let raw: RawJsonConfig = serde_json::from_value(raw).unwrap();
        AppConfig::from_raw(raw).unwrap()
    }

    pub fn context(root: &Path, database: Option<Arc<dyn Database>>) -> Arc<AppContext> {
        context_with(root, json!({}), database)
    }

    pub fn context_with(
        root: &Path,
        extra: serde_json::Value,
        database: Option<Arc<dyn Database>>,
    ) -> Arc<AppContext> {
        Arc::new(AppContext::with_database(config_for(root, extra), database))
    }
}
