// sitesnap/src/restore/db_restore.rs
use anyhow::{Context, Result};
use sqlx::{Executor, PgConnection};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Splits a dump into statements line by line: `--` comment lines and blank
/// lines are dropped, and a statement ends on a line whose last non-blank
/// character is `;`. Text left over at end of input is yielded as a final
/// statement.
pub struct StatementReader<R> {
    lines: io::Lines<R>,
    done: bool,
}

impl<R: BufRead> StatementReader<R> {
    pub fn new(reader: R) -> Self {
        StatementReader {
            lines: reader.lines(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for StatementReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buffer = String::new();
        loop {
            match self.lines.next() {
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with("--") {
                        continue;
                    }
                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(line.trim_end());
                    if trimmed.ends_with(';') {
                        return Some(Ok(buffer));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return (!buffer.is_empty()).then_some(Ok(buffer));
                }
            }
        }
    }
}

/// First `*.sql` file (by name) directly under `dir`.
pub fn find_sql_file(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            candidates.push(path);
        }
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Executes every statement of `sql_file` on one connection with foreign key
/// enforcement switched off, switching it back on whatever happens.
pub async fn replay_sql_file(conn: &mut PgConnection, sql_file: &Path) -> Result<usize> {
    let file = File::open(sql_file)
        .with_context(|| format!("Failed to open SQL file: {}", sql_file.display()))?;

    if let Err(e) = (&mut *conn).execute("SET session_replication_role = replica").await {
        warn!(error = %e, "Could not disable foreign key checks; replaying with them enabled");
    }

    let result = execute_statements(conn, StatementReader::new(BufReader::new(file))).await;

    if let Err(e) = (&mut *conn).execute("SET session_replication_role = DEFAULT").await {
        warn!(error = %e, "Failed to reset session_replication_role");
    }

    let executed = result
        .with_context(|| format!("Failed to replay SQL file {}", sql_file.display()))?;
    info!(statements = executed, path = %sql_file.display(), "SQL file replayed");
    Ok(executed)
}

async fn execute_statements<R: BufRead>(
    conn: &mut PgConnection,
    statements: StatementReader<R>,
) -> Result<usize> {
    let mut executed = 0;
    for statement in statements {
        let statement = statement.context("Failed to read SQL statement")?;
        (&mut *conn).execute(statement.as_str())
            .await
            .with_context(|| format!("Statement {} failed: {}", executed + 1, preview(&statement)))?;
        executed += 1;
    }
    Ok(executed)
}

fn preview(statement: &str) -> String {
    const MAX: usize = 120;
    let single: String = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    match single.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &single[..idx]),
        None => single,
    }
}
