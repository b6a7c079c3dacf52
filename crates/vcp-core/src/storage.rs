//! The ObjectStorage trait: the durable home of snapshot archives.
//!
//! Snapshots are written to and read from an [`ObjectStorage`] as a single
//! byte stream. Implementations include `FileStore` (local or mounted
//! filesystem) and `S3Store` (any S3-compatible endpoint) in `vcp-storage`.
//! Nothing above this trait knows which backend is in use.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::Result;

/// A readable byte stream handed to or returned from object storage.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Durable storage for one snapshot object.
///
/// Each store is bound to a single object (a file path or a bucket key) when
/// it is created. Adding a backend means implementing these three methods.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// A human-readable description of the object, for logs.
    fn target(&self) -> String;

    /// Consume `body` to the end and persist it.
    ///
    /// Must not return `Ok` until the data is durably stored. Backends that
    /// support it replace the object atomically, so a failed upload leaves
    /// any previous object in place.
    async fn put_object(&self, body: ObjectReader) -> Result<()>;

    /// Open the stored object for reading from its first byte.
    async fn get_object(&self) -> Result<ObjectReader>;
}
