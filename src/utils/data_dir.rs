//! Global data directory for persistent storage.
//!
//! Defaults to `~/.peerdrop/` but can be overridden via `--data-dir`.
//! Initialized once at startup via `init()`; holds the session store and
//! the log file.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the global data directory.
///
/// If `custom` is `Some`, uses that path. Otherwise falls back to
/// `~/.peerdrop/`. Fails when no home directory is known or when called
/// twice.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("No home directory found, pass --data-dir"))?
            .join(".peerdrop"),
    };
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data_dir::init() called more than once"))?;
    get()
}

/// Returns the global data directory path.
pub fn get() -> Result<&'static Path> {
    DATA_DIR
        .get()
        .map(PathBuf::as_path)
        .ok_or_else(|| anyhow!("data_dir not initialized"))
}
