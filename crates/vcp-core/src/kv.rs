//! The KvClient trait: one interface over every backing store.
//!
//! The snapshot writer and restorer only ever talk to a [`KvClient`]. Whether
//! the keys live in a key/value cluster or in a relational database behind a
//! translation shim is decided once by the bootstrapper.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{KeyValueRecord, Member};
use crate::Result;

/// Records delivered one at a time by [`KvClient::list_stream`].
///
/// The stream ends when the channel closes. A listing failure is delivered
/// as a final `Err` item.
pub type ListStream = mpsc::Receiver<Result<KeyValueRecord>>;

/// Number of records buffered between a listing task and its consumer.
pub const LIST_STREAM_BUFFER: usize = 1000;

/// A connected backing-store client.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Read a single key. Returns `Ok(None)` if it does not exist.
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValueRecord>>;

    /// Write a key, overwriting any existing value.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete every key starting with `prefix`. Returns the number deleted.
    async fn delete_prefix(&self, prefix: &[u8]) -> Result<u64>;

    /// Stream every key starting with `prefix`.
    ///
    /// Listing runs in a background task that stops when `cancel` fires or
    /// the returned receiver is dropped. Each key is delivered at most once.
    fn list_stream(&self, prefix: &[u8], cancel: CancellationToken) -> ListStream;

    /// List cluster members. Used as a lightweight health check.
    async fn member_list(&self) -> Result<Vec<Member>>;
}

/// The first key after every key that starts with `prefix`.
///
/// Returns `[0]` when no such key exists (the prefix is all `0xff`), which
/// key/value clusters interpret as "to the end of the keyspace".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}
