//! Atomic file write utility.
//!
//! Write-to-temp-then-rename for every file peerdrop persists: the session
//! store and files materialized into the download directory.
//!
//! Invariants:
//! - Write goes to a sibling `<name>.tmp` file first, then an atomic rename
//!   replaces the target.
//! - On rename failure, the temp file is cleaned up.
//! - Parent directories are created if absent.

use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::error;

/// Atomically write `content` to `path` via a temporary file and rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_sibling(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

/// `dir/name.ext` → `dir/name.ext.tmp`, keeping the full original name.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("peerdrop_test")
            .join("atomic")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn creates_file_and_parents() {
        let dir = test_dir("create");
        let path = dir.join("nested").join("state.json");
        let _ = std::fs::remove_file(&path);

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overwrites_existing() {
        let dir = test_dir("overwrite");
        let path = dir.join("photo.jpg");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn no_temp_file_remains() {
        let dir = test_dir("notmp");
        let path = dir.join("archive.tar.gz");

        atomic_write(&path, b"data").unwrap();
        assert!(!dir.join("archive.tar.gz.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
