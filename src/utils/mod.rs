use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use which::which;

/// Resolves `program` through `PATH` unless it already names a path.
pub fn find_executable(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which(program).with_context(|| format!("{} executable not found in PATH", program))
}

/// Runs an argv-style command in `cwd` and fails on a non-zero exit status,
/// carrying stderr in the error.
pub async fn run_command(argv: &[String], cwd: &Path) -> Result<String> {
    let (program, args) = argv.split_first().context("Command cannot be empty")?;
    let executable = find_executable(program)?;
    debug!(command = %argv.join(" "), cwd = %cwd.display(), "Running command");

    let output = Command::new(&executable)
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", executable.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "`{}` exited with {}: {}",
            argv.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    info!(command = %argv.join(" "), "Command finished");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `1536` -> `1.50 KB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

/// Lowercase, dash-separated form of an application name for file names.
pub fn slugify(name: &str) -> String {
    let slug = match Regex::new(r"[^a-z0-9]+") {
        Ok(re) => re
            .replace_all(&name.to_lowercase(), "-")
            .trim_matches('-')
            .to_string(),
        Err(_) => String::new(),
    };
    if slug.is_empty() {
        "site".to_string()
    } else {
        slug
    }
}
