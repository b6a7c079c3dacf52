//! Object storage backends for vcp snapshots.
//!
//! This crate provides concrete implementations of the
//! [`ObjectStorage`](vcp_core::ObjectStorage) trait:
//!
//! - [`FileStore`]: a file on a local or mounted volume (`container://`)
//! - [`S3Store`]: an object in any S3-compatible bucket (`s3://`)
//! - [`AzureStore`]: a blob in Azure Blob Storage (`https://`)

use std::sync::Arc;

use vcp_core::options::StorageOptions;
use vcp_core::storage::ObjectStorage;
use vcp_core::Result;

pub mod azure;
pub mod file;
pub mod s3;
mod transfer;

pub use azure::AzureStore;
pub use file::FileStore;
pub use s3::S3Store;

/// Build the store described by `options`.
pub fn create_store(options: &StorageOptions) -> Result<Arc<dyn ObjectStorage>> {
    options.validate()?;
    match options {
        StorageOptions::File(file) => Ok(Arc::new(FileStore::new(&file.path))),
        StorageOptions::S3(s3) => Ok(Arc::new(S3Store::new(s3)?)),
        StorageOptions::Azure(azure) => Ok(Arc::new(AzureStore::new(azure)?)),
    }
}
