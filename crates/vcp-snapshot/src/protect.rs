//! Pre-restore protection of on-disk backing-store data.
//!
//! Before an embedded backend is started for a restore, its data file or
//! directory is moved aside to `<path>.backup` so the backend starts empty
//! and the previous state survives a failed restore.
//!
//! Protection leaves a `<path>.restoring` marker that stays until the
//! restore completes. While the marker exists the backup holds the original
//! data: a retried restore discards whatever the failed attempt wrote and
//! keeps the backup. Without a marker, a stale backup is only replaced when
//! there is live data to take its place.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use vcp_core::error::VcpError;
use vcp_core::Result;

/// Suffix appended to protected paths.
pub const BACKUP_SUFFIX: &str = ".backup";

/// Suffix of the marker left while a restore is in progress.
pub const RESTORE_MARKER_SUFFIX: &str = ".restoring";

/// Side files SQLite keeps next to its database in WAL mode.
const SQLITE_SIDE_FILES: [&str; 2] = ["-wal", "-shm"];

/// `<path>.backup`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// `<path>.restoring`.
pub fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(RESTORE_MARKER_SUFFIX);
    PathBuf::from(name)
}

/// Move a SQLite database file aside and drop its WAL side files.
///
/// Returns the backup path, or `None` if there is no backup.
pub async fn protect_database_file(path: &Path) -> Result<Option<PathBuf>> {
    let backup = backup_path(path);

    if exists(&marker_path(path)).await? {
        // Left over from an unfinished restore; the backup is the original.
        remove_file_if_exists(path).await?;
        remove_side_files(path).await?;
        warn!(path = %path.display(), "Previous restore did not finish, discarding its data and keeping the backup");
        return existing(backup).await;
    }

    let protected = if exists(path).await? {
        remove_stale(&backup).await?;
        fs::rename(path, &backup)
            .await
            .map_err(|e| VcpError::protection(display(path), "rename to backup", e))?;
        remove_side_files(path).await?;
        info!(path = %path.display(), backup = %backup.display(), "Protected existing database");
        Some(backup)
    } else {
        info!(path = %path.display(), "No database file to protect");
        existing(backup).await?
    };

    write_marker(path).await?;
    Ok(protected)
}

/// Move a data directory aside and recreate it empty.
///
/// Returns the backup path, or `None` if there is no backup.
pub async fn protect_data_dir(path: &Path) -> Result<Option<PathBuf>> {
    let backup = backup_path(path);

    let protected = if exists(&marker_path(path)).await? {
        if exists(path).await? {
            fs::remove_dir_all(path)
                .await
                .map_err(|e| VcpError::protection(display(path), "discard unfinished restore", e))?;
        }
        warn!(path = %path.display(), "Previous restore did not finish, discarding its data and keeping the backup");
        existing(backup).await?
    } else if is_empty_dir(path).await? {
        info!(path = %path.display(), "No data to protect");
        existing(backup).await?
    } else {
        remove_stale(&backup).await?;
        fs::rename(path, &backup)
            .await
            .map_err(|e| VcpError::protection(display(path), "rename to backup", e))?;
        info!(path = %path.display(), backup = %backup.display(), "Protected existing data directory");
        Some(backup)
    };

    fs::create_dir_all(path)
        .await
        .map_err(|e| VcpError::protection(display(path), "recreate data directory", e))?;
    write_marker(path).await?;
    Ok(protected)
}

/// Clear the marker left by protection once a restore has completed.
///
/// The backup stays on disk; the next protection may replace it.
pub async fn finish_restore(path: &Path) -> Result<()> {
    let marker = marker_path(path);
    remove_file_if_exists(&marker).await?;
    info!(path = %path.display(), "Restore finished");
    Ok(())
}

async fn write_marker(path: &Path) -> Result<()> {
    let marker = marker_path(path);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| VcpError::protection(display(parent), "create directory", e))?;
    }
    fs::write(&marker, b"")
        .await
        .map_err(|e| VcpError::protection(display(&marker), "write restore marker", e))
}

async fn existing(backup: PathBuf) -> Result<Option<PathBuf>> {
    Ok(exists(&backup).await?.then_some(backup))
}

async fn remove_side_files(path: &Path) -> Result<()> {
    for suffix in SQLITE_SIDE_FILES {
        let mut side = path.as_os_str().to_os_string();
        side.push(suffix);
        remove_file_if_exists(&PathBuf::from(side)).await?;
    }
    Ok(())
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VcpError::protection(display(path), "remove file", e)),
    }
}

async fn exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| VcpError::protection(display(path), "stat", e))
}

/// `true` for a missing path or a directory without entries.
async fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(VcpError::protection(display(path), "read directory", e)),
    };
    let first = entries
        .next_entry()
        .await
        .map_err(|e| VcpError::protection(display(path), "read directory", e))?;
    Ok(first.is_none())
}

async fn remove_stale(backup: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(backup).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(VcpError::protection(display(backup), "stat stale backup", e)),
    };
    warn!(backup = %backup.display(), "Removing stale backup");
    let removed = if metadata.is_dir() {
        fs::remove_dir_all(backup).await
    } else {
        fs::remove_file(backup).await
    };
    removed.map_err(|e| VcpError::protection(display(backup), "remove stale backup", e))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
