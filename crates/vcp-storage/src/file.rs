//! Filesystem-backed snapshot storage.
//!
//! [`FileStore`] implements [`ObjectStorage`] for a single file on a local or
//! mounted volume. Writes stream into a temporary sibling file which is
//! renamed over the target only after the body has been fully consumed and
//! synced, so a failed or cancelled snapshot never replaces a good one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use vcp_core::error::VcpError;
use vcp_core::storage::{ObjectReader, ObjectStorage};
use vcp_core::Result;

/// An [`ObjectStorage`] backed by one file on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a store for the file at `path`.
    ///
    /// Nothing is touched on disk until the first write or read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        let temp = format!(".{name}.{}.tmp", uuid::Uuid::new_v4());
        match self.path.parent() {
            Some(parent) => parent.join(temp),
            None => PathBuf::from(temp),
        }
    }

    async fn write_temp(&self, temp: &Path, mut body: ObjectReader) -> Result<u64> {
        let mut file = fs::File::create(temp).await.map_err(|e| {
            VcpError::storage(format!("Failed to create {}", temp.display()), e)
        })?;
        let written = tokio::io::copy(&mut body, &mut file).await.map_err(|e| {
            VcpError::storage(format!("Failed to write {}", temp.display()), e)
        })?;
        file.flush()
            .await
            .map_err(|e| VcpError::storage(format!("Failed to flush {}", temp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| VcpError::storage(format!("Failed to sync {}", temp.display()), e))?;
        Ok(written)
    }
}

/// Removes the temporary file unless the write was committed.
///
/// Runs on drop so a write future cancelled mid-copy does not leave partial
/// files behind.
struct TempFileGuard {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove temporary snapshot file");
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for FileStore {
    fn target(&self) -> String {
        format!("container://{}", self.path.display())
    }

    #[instrument(skip(self, body), fields(path = %self.path.display()))]
    async fn put_object(&self, body: ObjectReader) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                VcpError::storage(
                    format!("Failed to create parent directories for {}", self.path.display()),
                    e,
                )
            })?;
        }

        let mut guard = TempFileGuard {
            path: self.temp_path(),
            committed: false,
        };
        let written = self.write_temp(&guard.path, body).await?;

        fs::rename(&guard.path, &self.path).await.map_err(|e| {
            VcpError::storage(format!("Failed to move snapshot into {}", self.path.display()), e)
        })?;
        guard.committed = true;

        debug!("Put {} bytes to {}", written, self.path.display());
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn get_object(&self) -> Result<ObjectReader> {
        let file = fs::File::open(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VcpError::NotFound {
                    key: self.path.display().to_string(),
                }
            } else {
                VcpError::storage(format!("Failed to open {}", self.path.display()), e)
            }
        })?;
        debug!("Opened {}", self.path.display());
        Ok(Box::new(file))
    }
}
