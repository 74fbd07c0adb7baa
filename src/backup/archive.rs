// sitesnap/src/backup/archive.rs
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::AppError;

pub const MANIFEST_NAME: &str = "manifest.json";

/// One file to archive and its slash-separated path inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub source: PathBuf,
    pub dest: String,
}

/// Lazily walks `root` depth-first and yields every regular file that is not
/// under one of the `exclusions` prefixes.
///
/// Symlinks are never followed nor archived. Entries that cannot be read
/// (permission denied, vanished while walking) are skipped.
pub fn plan<'a>(
    root: &'a Path,
    exclusions: &'a [PathBuf],
    dest_prefix: &'a str,
) -> impl Iterator<Item = PlanEntry> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| !is_excluded(entry.path(), exclusions))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(move |entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            let rel = slash_path(rel);
            let dest = if dest_prefix.is_empty() {
                rel
            } else {
                format!("{}/{}", dest_prefix.trim_end_matches('/'), rel)
            };
            Some(PlanEntry {
                source: entry.into_path(),
                dest,
            })
        })
}

fn is_excluded(path: &Path, exclusions: &[PathBuf]) -> bool {
    exclusions.iter().any(|prefix| path.starts_with(prefix))
}

fn slash_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Writes plan entries into `<base>-partN.zip` files, starting a new part
/// whenever the next file would push a non-empty part over `chunk_size`.
/// A file larger than `chunk_size` gets a part of its own.
pub struct PartWriter {
    dir: PathBuf,
    base_name: String,
    chunk_size: u64,
    index: usize,
    current_size: u64,
    entries: usize,
    writer: ZipWriter<File>,
    finished: Vec<PathBuf>,
}

impl PartWriter {
    pub fn new(dir: &Path, base_name: &str, chunk_size: u64) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        let first = part_path(dir, base_name, 1);
        let writer = open_part(&first)?;
        Ok(PartWriter {
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            chunk_size,
            index: 1,
            current_size: 0,
            entries: 0,
            writer,
            finished: Vec::new(),
        })
    }

    /// Adds one file. Returns `false` when the source could not be read and
    /// was left out.
    pub fn add(&mut self, entry: &PlanEntry) -> Result<bool> {
        let file = match File::open(&entry.source) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %entry.source.display(), error = %e, "Skipping unreadable file");
                return Ok(false);
            }
        };
        let size = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.source.display()))?
            .len();

        if self.entries > 0 && self.current_size + size > self.chunk_size {
            self.rotate()?;
        }

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size > u32::MAX as u64);
        self.writer
            .start_file(entry.dest.as_str(), options)
            .with_context(|| format!("Failed to add {} to archive", entry.dest))?;
        io::copy(&mut BufReader::new(file), &mut self.writer)
            .with_context(|| format!("Failed to archive {}", entry.source.display()))?;

        self.current_size += size;
        self.entries += 1;
        Ok(true)
    }

    fn rotate(&mut self) -> Result<()> {
        let next_index = self.index + 1;
        let next_path = part_path(&self.dir, &self.base_name, next_index);
        let next = open_part(&next_path)?;
        let mut done = std::mem::replace(&mut self.writer, next);
        done.finish().context("Failed to close archive part")?;
        self.finished.push(part_path(&self.dir, &self.base_name, self.index));
        debug!(part = self.index, bytes = self.current_size, files = self.entries, "Archive part closed");

        self.index = next_index;
        self.current_size = 0;
        self.entries = 0;
        Ok(())
    }

    /// Closes the last part and returns every part path in order.
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        self.writer.finish().context("Failed to close archive part")?;
        self.finished
            .push(part_path(&self.dir, &self.base_name, self.index));
        Ok(self.finished)
    }
}

fn part_path(dir: &Path, base_name: &str, index: usize) -> PathBuf {
    dir.join(format!("{}-part{}.zip", base_name, index))
}

fn open_part(path: &Path) -> Result<ZipWriter<File>> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create archive part {}", path.display()))?;
    Ok(ZipWriter::new(file))
}

#[derive(Debug, Default)]
pub struct PackReport {
    pub parts: Vec<PathBuf>,
    pub files: usize,
    /// Planned files that could not be opened and are missing from the parts.
    pub skipped: Vec<PathBuf>,
}

/// Packs every plan entry into size-bounded parts under `dest_dir`.
pub fn pack_into(
    entries: impl IntoIterator<Item = PlanEntry>,
    dest_dir: &Path,
    base_name: &str,
    chunk_size: u64,
) -> Result<PackReport> {
    let mut writer = PartWriter::new(dest_dir, base_name, chunk_size)?;
    let mut report = PackReport::default();
    for entry in entries {
        if writer.add(&entry)? {
            report.files += 1;
        } else {
            report.skipped.push(entry.source);
        }
    }
    report.parts = writer.finish()?;
    if report.skipped.is_empty() {
        info!(files = report.files, parts = report.parts.len(), "Files archived");
    } else {
        warn!(
            files = report.files,
            skipped = report.skipped.len(),
            parts = report.parts.len(),
            "Files archived with unreadable files left out"
        );
    }
    Ok(report)
}

/// Restore hints stored next to the parts in the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub app_name: String,
    pub app_version: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub content: String,
    pub parts: Vec<String>,
}

/// Stores `parts` (by file name only) plus the manifest in `container`,
/// then deletes the parts. The container only appears under its final name
/// once it is completely written.
pub fn package_parts(parts: &[PathBuf], container: &Path, manifest: &Manifest) -> Result<PathBuf> {
    if parts.is_empty() {
        return Err(AppError::Integrity("no parts to package".to_string()).into());
    }
    let staging = container.with_extension("zip.partial");
    if let Err(e) = write_container(parts, &staging, manifest) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    fs::rename(&staging, container).with_context(|| {
        format!("Failed to move container into place at {}", container.display())
    })?;

    for part in parts {
        if let Err(e) = fs::remove_file(part) {
            warn!(path = %part.display(), error = %e, "Failed to delete packaged part");
        }
    }
    info!(path = %container.display(), parts = parts.len(), "Container created");
    Ok(container.to_path_buf())
}

fn write_container(parts: &[PathBuf], staging: &Path, manifest: &Manifest) -> Result<()> {
    let file = File::create(staging)
        .with_context(|| format!("Failed to create container {}", staging.display()))?;
    let mut zip = ZipWriter::new(file);

    for part in parts {
        let name = part
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid part file name {}", part.display()))?;
        let mut source =
            File::open(part).with_context(|| format!("Failed to open part {}", part.display()))?;
        let size = source.metadata()?.len();
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(size > u32::MAX as u64);
        zip.start_file(name, options)
            .with_context(|| format!("Failed to add {} to container", name))?;
        io::copy(&mut source, &mut zip)
            .with_context(|| format!("Failed to copy {} into container", name))?;
    }

    zip.start_file(MANIFEST_NAME, FileOptions::default())?;
    serde_json::to_writer_pretty(&mut zip, manifest).context("Failed to write manifest")?;
    zip.finish().context("Failed to close container")?;
    Ok(())
}

/// Extracts every entry of `archive` into `dest`. Entries whose path would
/// land outside `dest` abort the extraction.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Failed to read archive {}", archive.display()))?;
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create extraction directory {}", dest.display()))?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(AppError::Integrity(format!(
                "archive {} contains unsafe entry '{}'",
                archive.display(),
                entry.name()
            ))
            .into());
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to extract {}", target.display()))?;
        files += 1;
    }
    debug!(archive = %archive.display(), files, "Archive extracted");
    Ok(files)
}

/// `site-backup-2025-01-01_00-00-00-part12.zip` -> `Some(12)`.
pub fn part_number(file_name: &str) -> Option<u32> {
    let re = Regex::new(r"-part(\d+)\.zip$").ok()?;
    re.captures(file_name)?.get(1)?.as_str().parse().ok()
}
