//! Site snapshot tool
//!
//! Resumable backup, restore and self-update of a CMS installation, driven
//! one step at a time from the command line.

// sitesnap/src/main.rs
mod app;
mod backup;
mod config;
mod database;
mod engine;
mod errors;
mod restore;
mod settings;
mod storage;
mod update;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::AppContext;
use config::AppConfig;
use engine::{Engine, Process, StepId};
use settings::{
    APP_VERSION, BACKUP_FILE_SETTING, BACKUP_SCHEDULE_SETTING, BACKUP_STORAGE_SETTING,
    BackupContent, BackupFileSetting, BackupScheduleSetting, BackupStorage, ScheduleInterval,
};
use storage::StorageConnection;

#[derive(Parser)]
#[command(name = "sitesnap", version, about = "Resumable site backup, restore and self-update")]
struct Cli {
    /// Path to config.json
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Back up the database and files
    Backup {
        #[command(subcommand)]
        action: StepAction,
    },
    /// Restore a backup container
    Restore {
        #[command(subcommand)]
        action: RestoreAction,
    },
    /// Update the application to the newest release
    Update {
        #[command(subcommand)]
        action: UpdateAction,
    },
    /// Manage finished backups in the local backup folder
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },
    /// Read and change backup settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Inspect or clear the system lock
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum StepAction {
    /// Run the current step once
    Step {
        #[arg(long)]
        actor: String,
    },
    /// Keep running steps until the process finishes or fails
    Run {
        #[arg(long)]
        actor: String,
    },
    /// Show the persisted process state and past runs
    Status {
        #[arg(long)]
        actor: String,
    },
    /// Drop the process, its temp files and the lock it holds
    Abort {
        #[arg(long)]
        actor: String,
    },
}

#[derive(Subcommand)]
enum RestoreAction {
    /// Choose the backup container to restore
    Select {
        #[arg(long)]
        actor: String,
        /// Container name or path relative to the disk root
        #[arg(long)]
        file: String,
        /// Storage connection holding the container
        #[arg(long)]
        disk: Option<String>,
    },
    #[command(flatten)]
    Step(StepAction),
}

#[derive(Subcommand)]
enum UpdateAction {
    /// Show the installed and published versions
    Versions,
    #[command(flatten)]
    Step(StepAction),
}

#[derive(Subcommand)]
enum FilesAction {
    List,
    Delete { path: String },
    /// Copy a container from a storage connection to a local path
    Download {
        path: String,
        #[arg(long)]
        to: PathBuf,
        #[arg(long, default_value = "local")]
        disk: String,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    File {
        #[arg(long = "type", value_enum)]
        content: BackupContent,
        #[arg(long, value_enum)]
        storage: BackupStorage,
    },
    Schedule {
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
        #[arg(long, value_enum)]
        schedule: ScheduleInterval,
    },
    /// Replace the storage connections with the JSON list in a file
    Storage {
        #[arg(long)]
        from: PathBuf,
    },
}

#[derive(Subcommand)]
enum LockAction {
    Status,
    /// Force-release the lock (operator action)
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run_app(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns `false` when the command ran but the step it drove failed.
async fn run_app(cli: Cli) -> Result<bool> {
    let config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!("Failed to load application configuration from {}", cli.config.display())
    })?;
    let app = Arc::new(AppContext::new(config));

    match cli.command {
        Command::Backup { action } => drive(&app::backup_engine(&app), action).await,
        Command::Restore { action } => match action {
            RestoreAction::Select { actor, file, disk } => {
                let payload = restore::selection(&file, disk.as_deref())?;
                let state = app::restore_engine(&app).begin(&actor, payload).await?;
                print_json(&state)?;
                Ok(true)
            }
            RestoreAction::Step(action) => drive(&app::restore_engine(&app), action).await,
        },
        Command::Update { action } => match action {
            UpdateAction::Versions => {
                print_json(&update::versions(&app).await?)?;
                Ok(true)
            }
            UpdateAction::Step(action) => drive(&app::update_engine(&app), action).await,
        },
        Command::Files { action } => {
            match action {
                FilesAction::List => print_json(&backup::list_backups(&app)?)?,
                FilesAction::Delete { path } => backup::delete_backup(&app, &path).await?,
                FilesAction::Download { path, to, disk } => {
                    let written = backup::download_backup(&app, &path, &disk, &to).await?;
                    print_json(&json!({ "path": written }))?
                }
            }
            Ok(true)
        }
        Command::Settings { action } => {
            settings_command(&app, action)?;
            Ok(true)
        }
        Command::Lock { action } => {
            let lock = app.system_lock();
            match action {
                LockAction::Status => print_json(&json!({
                    "maintenanceMode": lock.is_maintenance_mode()?,
                    "lock": lock.current()?,
                }))?,
                LockAction::Clear => print_json(&lock.force_release()?)?,
            }
            Ok(true)
        }
    }
}

async fn drive<P: Process>(engine: &Engine<P>, action: StepAction) -> Result<bool> {
    match action {
        StepAction::Step { actor } => {
            let result = engine.advance(&actor).await?;
            print_json(&result)?;
            Ok(result.success)
        }
        StepAction::Run { actor } => loop {
            let result = engine.advance(&actor).await?;
            print_json(&result)?;
            if !result.success {
                return Ok(false);
            }
            if result.next_step.is_none() {
                return Ok(true);
            }
        },
        StepAction::Status { actor } => {
            let step = engine.current_step(&actor).await?;
            print_json(&json!({
                "currentStep": step.as_str(),
                "percentage": step.percentage(),
                "state": engine.state(&actor).await?,
                "runs": engine.history(&actor)?,
            }))?;
            Ok(true)
        }
        StepAction::Abort { actor } => {
            let aborted = engine.abort(&actor, "operator request").await?;
            info!(actor = %actor, aborted, "Abort requested");
            Ok(true)
        }
    }
}

fn settings_command(app: &AppContext, action: SettingsAction) -> Result<()> {
    let store = &app.settings;
    match action {
        SettingsAction::Show => {
            let connections: Vec<_> = store
                .storage_connections()?
                .into_iter()
                .map(|c| json!({ "key": c.key, "driver": c.config.driver(), "enabled": c.enabled }))
                .collect();
            print_json(&json!({
                BACKUP_FILE_SETTING: store.backup_file_setting()?,
                BACKUP_SCHEDULE_SETTING: store.backup_schedule_setting()?,
                BACKUP_STORAGE_SETTING: connections,
                APP_VERSION: store.app_version()?,
            }))?
        }
        SettingsAction::File { content, storage } => {
            store.set(BACKUP_FILE_SETTING, &BackupFileSetting { content, storage })?
        }
        SettingsAction::Schedule { enabled, schedule } => {
            store.set(BACKUP_SCHEDULE_SETTING, &BackupScheduleSetting { enabled, schedule })?
        }
        SettingsAction::Storage { from } => {
            let raw = std::fs::read_to_string(&from)
                .with_context(|| format!("Failed to read {}", from.display()))?;
            let connections: Vec<StorageConnection> = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid storage connections in {}", from.display()))?;
            store.set_storage_connections(&connections)?;
            for connection in &connections {
                info!(
                    key = %connection.key,
                    driver = connection.config.driver(),
                    enabled = connection.enabled,
                    "Storage connection saved"
                );
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
