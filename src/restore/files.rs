// sitesnap/src/restore/files.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::backup::archive;

/// Copies every regular file under `src` onto `dest`, creating directories
/// as needed and overwriting files in place. Nothing under `dest` is removed.
pub fn overlay_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("Walked outside the overlay source")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to overwrite {}", target.display()))?;
            copied += 1;
        }
    }
    info!(from = %src.display(), to = %dest.display(), files = copied, "Tree overlaid");
    Ok(copied)
}

/// Copies the live tree at `root` (minus `exclusions`) to `dest` so an
/// operator can roll back by hand.
pub fn snapshot_tree(root: &Path, exclusions: &[PathBuf], dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in archive::plan(root, exclusions, "") {
        let target = dest.join(&entry.dest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&entry.source, &target)
            .with_context(|| format!("Failed to snapshot {}", entry.source.display()))?;
        copied += 1;
    }
    info!(root = %root.display(), dest = %dest.display(), files = copied, "Live files snapshotted");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_overlay_overwrites_and_keeps_extra_files() -> Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::create_dir_all(src.join("app/empty"))?;
        fs::write(src.join("app/a.php"), "new")?;
        fs::create_dir_all(dest.join("app"))?;
        fs::write(dest.join("app/a.php"), "old")?;
        fs::write(dest.join("local.txt"), "keep")?;

        assert_eq!(overlay_tree(&src, &dest)?, 1);
        assert_eq!(fs::read_to_string(dest.join("app/a.php"))?, "new");
        assert_eq!(fs::read_to_string(dest.join("local.txt"))?, "keep");
        assert!(dest.join("app/empty").is_dir());
        Ok(())
    }

    #[test]
    fn test_snapshot_honours_exclusions() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("site");
        fs::create_dir_all(root.join("node_modules/x"))?;
        fs::write(root.join("node_modules/x/index.js"), "")?;
        fs::write(root.join("index.php"), "live")?;

        let dest = dir.path().join("rollback/files");
        let copied = snapshot_tree(&root, &[root.join("node_modules")], &dest)?;
        assert_eq!(copied, 1);
        assert_eq!(fs::read_to_string(dest.join("index.php"))?, "live");
        assert!(!dest.join("node_modules").exists());
        Ok(())
    }
}
