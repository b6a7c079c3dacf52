//! Snapshot writer.
//!
//! The archive is produced on the calling task and uploaded by a background
//! task. The two are joined by a bounded in-memory pipe: once the upload
//! falls behind, pipe writes block and the producer stops pulling keys, so
//! memory stays bounded by the pipe capacity plus one listing page no
//! matter how large the store is.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vcp_core::error::VcpError;
use vcp_core::kv::KvClient;
use vcp_core::storage::ObjectStorage;
use vcp_core::types::{ReleaseDescriptor, SNAPSHOT_RELEASE_KEY};
use vcp_core::Result;

use crate::archive::ArchiveEncoder;

/// Capacity of the pipe between the archive producer and the upload.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Progress is logged every this many keys.
pub const PROGRESS_INTERVAL: u64 = 100;

/// Prefix every snapshot lists from.
pub const ROOT_PREFIX: &[u8] = b"/";

/// Outcome of a successful snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Number of store keys written (the release entry is not counted).
    pub keys: u64,
    /// Where the archive was stored.
    pub target: String,
}

/// Streams every key of a backing store into object storage.
pub struct SnapshotWriter {
    client: Arc<dyn KvClient>,
    sink: Arc<dyn ObjectStorage>,
    compress: bool,
    release: Option<ReleaseDescriptor>,
}

enum Outcome {
    Cancelled,
    Uploaded(Result<()>),
    Produced(Result<u64>),
}

impl SnapshotWriter {
    /// A writer producing a compressed archive without a release entry.
    pub fn new(client: Arc<dyn KvClient>, sink: Arc<dyn ObjectStorage>) -> Self {
        Self {
            client,
            sink,
            compress: true,
            release: None,
        }
    }

    /// Gzip the archive or not.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Write `release` as the first archive entry.
    pub fn release(mut self, release: Option<ReleaseDescriptor>) -> Self {
        self.release = release;
        self
    }

    /// Write the snapshot.
    ///
    /// Returns once the sink has durably stored the archive. On error or
    /// cancellation the upload is aborted and awaited before returning, and
    /// the target object must be treated as invalid.
    pub async fn write(&self, cancel: &CancellationToken) -> Result<SnapshotReport> {
        let target = self.sink.target();
        info!(target = %target, compress = self.compress, "Starting snapshot");

        let (mut pipe, upload_end) = tokio::io::duplex(PIPE_CAPACITY);
        let upload_cancel = cancel.child_token();
        let mut upload = spawn_upload(Arc::clone(&self.sink), upload_end, upload_cancel.clone());

        let list_cancel = cancel.child_token();
        let _list_guard = list_cancel.clone().drop_guard();

        let mut produce = Box::pin(self.produce(&mut pipe, &list_cancel));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            joined = &mut upload => Outcome::Uploaded(flatten_upload(joined)),
            produced = &mut produce => Outcome::Produced(produced),
        };
        drop(produce);

        match outcome {
            Outcome::Cancelled => {
                abort_upload(upload, &upload_cancel).await.ok();
                warn!(target = %target, "Snapshot cancelled");
                Err(VcpError::Cancelled)
            }
            Outcome::Uploaded(Ok(())) => Err(VcpError::storage_msg(format!(
                "upload to {target} finished before the archive was complete"
            ))),
            Outcome::Uploaded(Err(e)) => Err(e),
            Outcome::Produced(Err(e)) => {
                // A broken pipe usually means the upload failed first; report that.
                match abort_upload(upload, &upload_cancel).await {
                    Err(upload_err) if !upload_err.is_cancelled() => Err(upload_err),
                    _ => Err(e),
                }
            }
            Outcome::Produced(Ok(keys)) => {
                if let Err(e) = pipe.shutdown().await {
                    abort_upload(upload, &upload_cancel).await.ok();
                    return Err(VcpError::archive("close upload pipe", e));
                }
                drop(pipe);

                let uploaded = tokio::select! {
                    _ = cancel.cancelled() => {
                        abort_upload(upload, &upload_cancel).await.ok();
                        return Err(VcpError::Cancelled);
                    }
                    joined = &mut upload => flatten_upload(joined),
                };
                uploaded?;

                info!(keys, target = %target, "Snapshot complete");
                Ok(SnapshotReport { keys, target })
            }
        }
    }

    /// Encode the archive into `pipe`. The pipe is left open.
    async fn produce(&self, pipe: &mut DuplexStream, list_cancel: &CancellationToken) -> Result<u64> {
        let mut encoder = ArchiveEncoder::new(self.compress);

        if let Some(release) = &self.release {
            let body = release
                .to_json()
                .map_err(|e| VcpError::archive("encode release descriptor", e))?;
            let chunk = encoder.append(SNAPSHOT_RELEASE_KEY.as_bytes(), &body)?;
            write_chunk(pipe, &chunk).await?;
            debug!(release = %release.release_name, "Wrote release entry");
        }

        let mut listing = self.client.list_stream(ROOT_PREFIX, list_cancel.clone());
        let mut keys = 0u64;
        while let Some(item) = listing.recv().await {
            let record = item.map_err(|e| {
                if e.is_cancelled() {
                    e
                } else {
                    VcpError::BackingStore {
                        message: "read key/value from backing store".to_string(),
                        source: Some(Box::new(e)),
                    }
                }
            })?;

            if record.key == SNAPSHOT_RELEASE_KEY.as_bytes() {
                warn!(key = SNAPSHOT_RELEASE_KEY, "Skipping store key that collides with the release entry");
                continue;
            }

            let chunk = encoder.append(&record.key, &record.data)?;
            write_chunk(pipe, &chunk).await?;
            keys += 1;
            if keys % PROGRESS_INTERVAL == 0 {
                info!(keys, "Snapshot progress");
            }
        }

        let tail = encoder.finish()?;
        write_chunk(pipe, &tail).await?;
        Ok(keys)
    }
}

/// Convenience wrapper around [`SnapshotWriter`].
pub async fn write_snapshot(
    client: Arc<dyn KvClient>,
    sink: Arc<dyn ObjectStorage>,
    compress: bool,
    release: Option<ReleaseDescriptor>,
    cancel: &CancellationToken,
) -> Result<SnapshotReport> {
    SnapshotWriter::new(client, sink)
        .compress(compress)
        .release(release)
        .write(cancel)
        .await
}

fn spawn_upload(
    sink: Arc<dyn ObjectStorage>,
    body: DuplexStream,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VcpError::Cancelled),
            result = sink.put_object(Box::new(body)) => result,
        }
    })
}

/// Stop the upload and wait for it, so no task outlives the snapshot call.
///
/// The pipe must still be open when this runs; closing it first would look
/// like a complete archive to the sink.
async fn abort_upload(upload: JoinHandle<Result<()>>, cancel: &CancellationToken) -> Result<()> {
    cancel.cancel();
    flatten_upload(upload.await)
}

fn flatten_upload(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| VcpError::Internal {
        message: format!("upload task failed: {e}"),
    })?
}

async fn write_chunk(pipe: &mut DuplexStream, chunk: &[u8]) -> Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    pipe.write_all(chunk)
        .await
        .map_err(|e| VcpError::archive("write archive to upload pipe", e))
}
