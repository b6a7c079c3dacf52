//! Streaming transfers shared by the `object_store` backed stores.

use std::sync::Arc;

use futures::TryStreamExt;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use vcp_core::error::VcpError;
use vcp_core::storage::ObjectReader;
use vcp_core::Result;

/// Stream `body` into `key`, aborting the upload if any part fails so no
/// partial object becomes visible.
pub(crate) async fn upload(
    store: &Arc<dyn ObjectStore>,
    key: &ObjectPath,
    target: &str,
    mut body: ObjectReader,
) -> Result<()> {
    let mut writer = BufWriter::new(Arc::clone(store), key.clone());

    let copied = tokio::io::copy(&mut body, &mut writer).await;
    let result = match copied {
        Ok(written) => writer.shutdown().await.map(|()| written),
        Err(e) => Err(e),
    };

    match result {
        Ok(written) => {
            debug!("Uploaded {} bytes to {}", written, target);
            Ok(())
        }
        Err(e) => {
            if let Err(abort_err) = writer.abort().await {
                warn!(error = %abort_err, target, "Failed to abort upload");
            }
            Err(VcpError::storage(format!("Upload failed for {target}"), e))
        }
    }
}

/// Open `key` as a byte stream.
pub(crate) async fn download(
    store: &Arc<dyn ObjectStore>,
    key: &ObjectPath,
    target: &str,
) -> Result<ObjectReader> {
    let result = store.get(key).await.map_err(|e| match e {
        object_store::Error::NotFound { .. } => VcpError::NotFound {
            key: target.to_string(),
        },
        other => VcpError::storage(format!("Download failed for {target}"), other),
    })?;
    let stream = result.into_stream().map_err(std::io::Error::other);
    Ok(Box::new(StreamReader::new(stream)))
}
