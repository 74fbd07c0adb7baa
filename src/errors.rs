use thiserror::Error;

use crate::engine::lock::LockRecord;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    /// A gate the step depends on is closed (another process holds the lock,
    /// the chosen file is missing, the site is already up to date, ...).
    #[error("{0}")]
    Precondition(String),

    /// Data produced by an earlier step is missing or unusable.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("{}", .0.busy_message())]
    LockBusy(LockRecord),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
