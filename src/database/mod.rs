// sitesnap/src/database/mod.rs
//! The relational store behind the site, as seen by backup and restore.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::path::Path;
use tracing::info;

use crate::backup::db_dump;
use crate::restore::db_restore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub tables: usize,
    pub rows: u64,
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn check_connection(&self) -> Result<()>;

    /// Writes a self-contained SQL dump where every statement ends with `;`
    /// at the end of a line.
    async fn dump_to_file(&self, dest: &Path) -> Result<DumpSummary>;

    /// Replays a dump produced by [`dump_to_file`](Self::dump_to_file).
    /// Returns the number of statements executed.
    async fn replay_file(&self, sql_file: &Path) -> Result<usize>;
}

pub struct PgDatabase {
    url: String,
}

impl PgDatabase {
    pub fn new(url: &str) -> Self {
        PgDatabase {
            url: url.to_string(),
        }
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect(&self.url)
            .await
            .with_context(|| format!("Failed to connect to database on {}", redact_url(&self.url)))
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn check_connection(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .context("Database connection check failed")?;
        info!(database = %redact_url(&self.url), "Database connection OK");
        Ok(())
    }

    async fn dump_to_file(&self, dest: &Path) -> Result<DumpSummary> {
        let mut conn = self.connect().await?;
        db_dump::dump_database(&mut conn, dest).await
    }

    async fn replay_file(&self, sql_file: &Path) -> Result<usize> {
        let mut conn = self.connect().await?;
        db_restore::replay_sql_file(&mut conn, sql_file).await
    }
}

/// Connection URL with the password masked, for logs and messages.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid database url>".to_string(),
    }
}
