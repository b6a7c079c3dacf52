//! An in-process [`KvClient`] holding keys in a sorted map.
//!
//! Used by tests and by dry runs that need a backing store without a
//! cluster. Listing takes a copy of the matching range when it starts, so a
//! scan sees one consistent view even while other tasks keep writing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use vcp_core::error::VcpError;
use vcp_core::kv::{KvClient, ListStream, LIST_STREAM_BUFFER};
use vcp_core::types::{KeyValueRecord, Member};
use vcp_core::Result;

/// A sorted in-memory key/value store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with `records`.
    pub fn from_records<I, K, V>(records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        let data = records
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Number of keys stored.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Returns `true` if no keys are stored.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    /// A copy of every key/value pair.
    pub async fn dump(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.read().await.clone()
    }

    async fn range(&self, prefix: &[u8]) -> Vec<KeyValueRecord> {
        self.data
            .read()
            .await
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValueRecord::new(k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl KvClient for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValueRecord>> {
        Ok(self
            .data
            .read()
            .await
            .get(key)
            .map(|v| KeyValueRecord::new(key, v.clone())))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|k, _| !k.starts_with(prefix));
        Ok((before - data.len()) as u64)
    }

    fn list_stream(&self, prefix: &[u8], cancel: CancellationToken) -> ListStream {
        let (tx, rx) = mpsc::channel(LIST_STREAM_BUFFER);
        let store = self.clone();
        let prefix = prefix.to_vec();
        tokio::spawn(async move {
            for record in store.range(&prefix).await {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(VcpError::Cancelled)).await;
                        return;
                    }
                    sent = tx.send(Ok(record)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }

    async fn member_list(&self) -> Result<Vec<Member>> {
        Ok(vec![Member {
            id: 1,
            name: "memory".to_string(),
            client_urls: Vec::new(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(b"/a/1", b"one").await.unwrap();
        store.put(b"/a/2", b"two").await.unwrap();
        store.put(b"/b/1", b"three").await.unwrap();

        let record = store.get(b"/a/2").await.unwrap().unwrap();
        assert_eq!(record.data, b"two");
        assert!(store.get(b"/c").await.unwrap().is_none());

        assert_eq!(store.delete_prefix(b"/a/").await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_stream_sorted_and_scoped() {
        let store = MemoryStore::from_records([("/b", "2"), ("/a", "1"), ("x", "3")]);
        let mut rx = store.list_stream(b"/", CancellationToken::new());
        let mut keys = Vec::new();
        while let Some(record) = rx.recv().await {
            keys.push(record.unwrap().key);
        }
        assert_eq!(keys, vec![b"/a".to_vec(), b"/b".to_vec()]);
    }

    #[tokio::test]
    async fn test_list_stream_is_a_snapshot() {
        let store = MemoryStore::from_records([("/a", "1")]);
        let mut rx = store.list_stream(b"", CancellationToken::new());
        let first = rx.recv().await.unwrap().unwrap();
        store.put(b"/b", b"2").await.unwrap();
        assert_eq!(first.key, b"/a");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_list_stream_cancelled() {
        let records: Vec<(String, String)> =
            (0..5000).map(|i| (format!("/k/{i:05}"), "v".to_string())).collect();
        let store = MemoryStore::from_records(records);
        let cancel = CancellationToken::new();
        let mut rx = store.list_stream(b"/", cancel.clone());
        assert!(rx.recv().await.unwrap().is_ok());
        cancel.cancel();

        let mut saw_cancel = false;
        while let Some(item) = rx.recv().await {
            if let Err(e) = item {
                assert!(e.is_cancelled());
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }
}
