//! End-to-end snapshot and restore of one control plane.
//!
//! These tie the bootstrapper, the object storage factory, and the
//! writer/restorer together; the CLI is a thin shell around them.

use tokio_util::sync::CancellationToken;
use tracing::info;

use vcp_core::error::VcpError;
use vcp_core::options::{RestoreOptions, SnapshotOptions};
use vcp_core::Result;

use crate::bootstrap::Bootstrapper;
use crate::restorer::{RestoreReport, SnapshotRestorer};
use crate::writer::{SnapshotReport, SnapshotWriter};

/// Snapshot the backing store resolved by `bootstrapper`.
pub async fn snapshot(
    bootstrapper: &Bootstrapper,
    options: &SnapshotOptions,
    cancel: &CancellationToken,
) -> Result<SnapshotReport> {
    options.validate()?;
    let sink = vcp_storage::create_store(&options.storage).map_err(|e| VcpError::Storage {
        message: "create store".to_string(),
        source: Some(Box::new(e)),
    })?;
    let client = bootstrapper.resolve_client(false).await?;

    SnapshotWriter::new(client, sink)
        .compress(options.compress)
        .release(options.release.clone())
        .write(cancel)
        .await
}

/// Restore a snapshot into the backing store resolved by `bootstrapper`.
///
/// Existing state is protected before the backend is started; see
/// [`Bootstrapper::resolve_client`]. The protection marker is only cleared
/// once every key has been replayed.
pub async fn restore(
    bootstrapper: &Bootstrapper,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<RestoreReport> {
    options.validate(bootstrapper.config())?;
    let source = vcp_storage::create_store(&options.storage).map_err(|e| VcpError::Storage {
        message: "create store".to_string(),
        source: Some(Box::new(e)),
    })?;

    // Fail on a missing snapshot before anything is moved aside.
    drop(source.get_object().await?);

    let client = bootstrapper.resolve_client(true).await?;
    let report = SnapshotRestorer::new(source, client)
        .new_cluster(options.new_cluster)
        .restore(cancel)
        .await?;
    bootstrapper.complete_restore().await?;
    if let Some(release) = &report.release {
        info!(
            release = %release.release_name,
            namespace = %release.release_namespace,
            chart = %release.chart_name,
            chart_version = %release.chart_version,
            "Snapshot was taken from release"
        );
    }
    Ok(report)
}
