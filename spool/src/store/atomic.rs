//! Atomic file writes for profile blobs.
//!
//! Blobs are written to a temp file next to their final path and renamed
//! into place, so a reader never sees a half-written profile.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Temp path next to `final_path`.
/// Format: {dir}/.tmp.{random}.{filename}
pub fn temp_path(final_path: &Path) -> PathBuf {
    let filename = final_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("blob");
    let random: u64 = rand::random();
    final_path.with_file_name(format!(".tmp.{:016x}.{}", random, filename))
}

/// Rename a finished temp file over `final_path`, replacing any previous blob.
pub fn rename_into_place(temp_path: &Path, final_path: &Path) -> io::Result<()> {
    fs::rename(temp_path, final_path).map_err(|e| {
        let _ = fs::remove_file(temp_path);
        e
    })
}

/// Write `content` to `final_path` atomically, creating parent directories.
pub fn write_file(final_path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_path(final_path);
    fs::write(&temp, content)?;
    rename_into_place(&temp, final_path)
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
