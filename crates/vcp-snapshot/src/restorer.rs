//! Snapshot restorer.
//!
//! Archive decoding is blocking (`tar` and `flate2` work on `std::io::Read`),
//! so it runs on the blocking pool and hands records to the async side over
//! a bounded channel. The async side replays them into the backing store in
//! archive order.
//!
//! Restores are not transactional: when a `put` fails, every key before it
//! stays applied.
//!
//! Restoring into a new control plane drops the keys tied to the old one:
//! its object name mappings and the per-namespace `kube-root-ca.crt` config
//! maps, which the new control plane issues from its own CA.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info};

use vcp_core::error::VcpError;
use vcp_core::kv::KvClient;
use vcp_core::storage::{ObjectReader, ObjectStorage};
use vcp_core::types::{KeyValueRecord, ReleaseDescriptor, MAPPINGS_PREFIX, SNAPSHOT_RELEASE_KEY};
use vcp_core::Result;

use crate::archive;
use crate::writer::PROGRESS_INTERVAL;

/// Decoded records buffered ahead of the store writes.
const DECODE_BUFFER: usize = 64;

/// Outcome of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Number of keys written into the backing store.
    pub restored: u64,
    /// Keys left out because they belong to the source control plane.
    pub skipped: u64,
    /// The release descriptor, if the archive carried one.
    pub release: Option<ReleaseDescriptor>,
}

/// Replays an archive from object storage into a backing store.
pub struct SnapshotRestorer {
    source: Arc<dyn ObjectStorage>,
    client: Arc<dyn KvClient>,
    new_cluster: bool,
}

impl SnapshotRestorer {
    /// Create a restorer.
    pub fn new(source: Arc<dyn ObjectStorage>, client: Arc<dyn KvClient>) -> Self {
        Self {
            source,
            client,
            new_cluster: false,
        }
    }

    /// Restore into a newly created control plane instead of the one the
    /// snapshot was taken from.
    pub fn new_cluster(mut self, new_cluster: bool) -> Self {
        self.new_cluster = new_cluster;
        self
    }

    /// Restore every entry of the archive.
    pub async fn restore(&self, cancel: &CancellationToken) -> Result<RestoreReport> {
        let target = self.source.target();
        info!(target = %target, "Starting restore");

        let decode_cancel = cancel.child_token();
        let reader = CancellableReader::new(self.source.get_object().await?, decode_cancel.clone());
        let bridge = SyncIoBridge::new(reader);
        let (tx, mut rx) = mpsc::channel::<Result<KeyValueRecord>>(DECODE_BUFFER);
        let decoder = tokio::task::spawn_blocking(move || {
            let decoded = archive::decode(bridge, |record| Ok(tx.blocking_send(Ok(record)).is_ok()));
            if let Err(e) = decoded {
                let _ = tx.blocking_send(Err(e));
            }
        });

        let replayed = self.replay(&mut rx, cancel).await;

        // Closing the channel stops the decoder at its next entry; cancelling
        // its reader unblocks a decoder stuck waiting on the source.
        drop(rx);
        if replayed.is_err() {
            decode_cancel.cancel();
        }
        let decoded = decoder.await;

        let report = replayed?;
        decoded.map_err(|e| VcpError::archive("archive decoder task failed", e))?;
        info!(
            restored = report.restored,
            skipped = report.skipped,
            target = %target,
            "Restore complete"
        );
        Ok(report)
    }

    async fn replay(
        &self,
        rx: &mut mpsc::Receiver<Result<KeyValueRecord>>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let mut report = RestoreReport {
            restored: 0,
            skipped: 0,
            release: None,
        };
        let mut first = true;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VcpError::Cancelled),
                item = rx.recv() => item,
            };
            let Some(item) = item else {
                return Ok(report);
            };
            let record = item?;

            if std::mem::take(&mut first) && record.key == SNAPSHOT_RELEASE_KEY.as_bytes() {
                let release = ReleaseDescriptor::from_json(&record.data)
                    .map_err(|e| VcpError::archive("decode release descriptor", e))?;
                debug!(release = %release.release_name, chart_version = %release.chart_version, "Found release entry");
                report.release = Some(release);
                continue;
            }
            if self.new_cluster && belongs_to_source_cluster(&record.key) {
                debug!(key = %record.key_lossy(), "Skipping key of the source control plane");
                report.skipped += 1;
                continue;
            }

            let put = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(VcpError::Cancelled),
                put = self.client.put(&record.key, &record.data) => put,
            };
            put.map_err(|e| VcpError::apply(&record.key, e))?;

            report.restored += 1;
            debug!(key = %record.key_lossy(), "Restored key");
            if report.restored % PROGRESS_INTERVAL == 0 {
                info!(restored = report.restored, "Restore progress");
            }
        }
    }
}

/// Mappings and `/<root>/configmaps/<namespace>/kube-root-ca.crt`.
fn belongs_to_source_cluster(key: &[u8]) -> bool {
    if key.starts_with(MAPPINGS_PREFIX.as_bytes()) {
        return true;
    }
    let parts: Vec<&[u8]> = key.split(|b| *b == b'/').collect();
    parts.len() == 5 && parts[2] == b"configmaps" && parts[4] == b"kube-root-ca.crt"
}

/// Fails reads once `cancel` fires, even while the inner read is pending.
struct CancellableReader {
    inner: ObjectReader,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl CancellableReader {
    fn new(inner: ObjectReader, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancel.cancelled_owned()),
        }
    }
}

impl AsyncRead for CancellableReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::other("restore cancelled")));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Convenience wrapper around [`SnapshotRestorer`].
pub async fn restore_snapshot(
    source: Arc<dyn ObjectStorage>,
    client: Arc<dyn KvClient>,
    cancel: &CancellationToken,
) -> Result<RestoreReport> {
    SnapshotRestorer::new(source, client).restore(cancel).await
}
