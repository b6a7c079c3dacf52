//! Azure Blob Storage snapshot storage.
//!
//! The blob is named by its full URL, `https://<account>.blob.<suffix>/<container>/<blob>`.
//! Authentication is tried in order: the SAS carried in the options, then
//! `AZURE_STORAGE_BLOB_SAS`, then the account key in `AZURE_STORAGE_KEY`,
//! then whatever `object_store` finds in the environment (managed identity).

use std::sync::Arc;

use async_trait::async_trait;
use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::{debug, instrument};

use vcp_core::error::VcpError;
use vcp_core::options::AzureOptions;
use vcp_core::storage::{ObjectReader, ObjectStorage};
use vcp_core::Result;

use crate::transfer;

/// SAS token environment fallback.
pub const SAS_ENV: &str = "AZURE_STORAGE_BLOB_SAS";
/// Account key environment fallback.
pub const ACCOUNT_KEY_ENV: &str = "AZURE_STORAGE_KEY";

const PUBLIC_CLOUD_SUFFIX: &str = ".blob.core.windows.net";

/// An [`ObjectStorage`] backed by one Azure blob.
pub struct AzureStore {
    store: Arc<dyn ObjectStore>,
    blob_url: String,
    blob: ObjectPath,
}

impl AzureStore {
    /// Create a new `AzureStore` for the blob described by `options`.
    pub fn new(options: &AzureOptions) -> Result<Self> {
        let (host, container, blob) = options.locate()?;
        let account = host.split('.').next().unwrap_or_default();

        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(account)
            .with_container_name(&container);

        // Sovereign clouds and private endpoints keep their own host.
        if !host.ends_with(PUBLIC_CLOUD_SUFFIX) {
            builder = builder.with_config(AzureConfigKey::Endpoint, format!("https://{host}"));
        }

        let sas = options
            .sas
            .clone()
            .or_else(|| non_empty_env(SAS_ENV));
        if let Some(sas) = sas {
            builder = builder.with_config(AzureConfigKey::SasKey, sas.trim_start_matches('?'));
        } else if let Some(key) = non_empty_env(ACCOUNT_KEY_ENV) {
            builder = builder.with_access_key(key);
        }

        let store = builder.build().map_err(|e| {
            VcpError::storage(
                format!("Failed to create Azure client for {}", options.blob_url),
                e,
            )
        })?;

        debug!(account, container = %container, blob = %blob, "AzureStore initialised");

        Ok(Self {
            store: Arc::new(store),
            blob_url: options.blob_url.clone(),
            blob: ObjectPath::from(blob.as_str()),
        })
    }

    /// Create a store over an existing `ObjectStore`, e.g. an in-memory one.
    pub fn with_store(store: Arc<dyn ObjectStore>, blob_url: impl Into<String>, blob: &str) -> Self {
        Self {
            store,
            blob_url: blob_url.into(),
            blob: ObjectPath::from(blob),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

#[async_trait]
impl ObjectStorage for AzureStore {
    fn target(&self) -> String {
        self.blob_url.clone()
    }

    #[instrument(skip(self, body), fields(blob = %self.blob))]
    async fn put_object(&self, body: ObjectReader) -> Result<()> {
        transfer::upload(&self.store, &self.blob, &self.target(), body).await
    }

    #[instrument(skip(self), fields(blob = %self.blob))]
    async fn get_object(&self) -> Result<ObjectReader> {
        transfer::download(&self.store, &self.blob, &self.target()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    const BLOB_URL: &str = "https://team.blob.core.windows.net/snapshots/team-a/latest.tar.gz";

    #[test]
    fn test_new_from_options() {
        let options = AzureOptions {
            blob_url: BLOB_URL.to_string(),
            sas: Some("sv=2024-01-01&sr=b&sp=rcw&sig=abc%2Bdef".to_string()),
        };
        let store = AzureStore::new(&options).unwrap();
        assert_eq!(store.target(), BLOB_URL);
        assert_eq!(store.blob.as_ref(), "team-a/latest.tar.gz");
    }

    #[test]
    fn test_new_rejects_url_without_blob() {
        let options = AzureOptions {
            blob_url: "https://team.blob.core.windows.net/snapshots".to_string(),
            sas: None,
        };
        assert!(matches!(AzureStore::new(&options), Err(VcpError::Config { .. })));
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = AzureStore::with_store(Arc::new(InMemory::new()), BLOB_URL, "team-a/latest.tar.gz");
        let body = b"snapshot bytes".to_vec();
        store
            .put_object(Box::new(Cursor::new(body.clone())))
            .await
            .unwrap();

        let mut reader = store.get_object().await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, body);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let store = AzureStore::with_store(Arc::new(InMemory::new()), BLOB_URL, "missing.tar.gz");
        let result = store.get_object().await;
        assert!(matches!(result, Err(VcpError::NotFound { key }) if key == BLOB_URL));
    }
}
