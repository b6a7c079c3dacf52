//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use vcp_core::error::VcpError;
use vcp_core::kv::{KvClient, ListStream};
use vcp_core::storage::{ObjectReader, ObjectStorage};
use vcp_core::types::{KeyValueRecord, Member};
use vcp_core::Result;
use vcp_snapshot::MemoryStore;

/// A store with `count` keys of `value_size` bytes each.
pub fn store_with(count: usize, value_size: usize) -> MemoryStore {
    MemoryStore::from_records((0..count).map(|i| {
        let value: Vec<u8> = (0..value_size).map(|b| ((i * 31 + b * 7) % 251) as u8).collect();
        (format!("/registry/pods/ns-{}/pod-{i:06}", i % 7), value)
    }))
}

/// Keeps the uploaded object in memory.
#[derive(Default)]
pub struct MemorySink {
    pub object: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl ObjectStorage for MemorySink {
    fn target(&self) -> String {
        "memory://snapshot".to_string()
    }

    async fn put_object(&self, mut body: ObjectReader) -> Result<()> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(|e| VcpError::storage("read body", e))?;
        *self.object.lock().unwrap() = Some(data);
        Ok(())
    }

    async fn get_object(&self) -> Result<ObjectReader> {
        let data = self.object.lock().unwrap().clone().ok_or(VcpError::NotFound {
            key: self.target(),
        })?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Reads `chunk` bytes at a time with a pause after each read.
pub struct ThrottledSink {
    pub chunk: usize,
    pub pause: Duration,
    pub inner: MemorySink,
    pub reads: AtomicUsize,
}

impl ThrottledSink {
    pub fn new(chunk: usize, pause: Duration) -> Self {
        Self {
            chunk,
            pause,
            inner: MemorySink::default(),
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObjectStorage for ThrottledSink {
    fn target(&self) -> String {
        "memory://throttled".to_string()
    }

    async fn put_object(&self, mut body: ObjectReader) -> Result<()> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; self.chunk];
        loop {
            let n = body
                .read(&mut buf)
                .await
                .map_err(|e| VcpError::storage("read body", e))?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.pause).await;
        }
        *self.inner.object.lock().unwrap() = Some(data);
        Ok(())
    }

    async fn get_object(&self) -> Result<ObjectReader> {
        self.inner.get_object().await
    }
}

/// Sets a flag when dropped.
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Reads the first bytes of the upload, then never finishes.
///
/// `upload_dropped` is set once the in-flight `put_object` future is dropped.
#[derive(Default)]
pub struct StallingSink {
    pub started: Notify,
    pub upload_dropped: Arc<AtomicBool>,
}

#[async_trait]
impl ObjectStorage for StallingSink {
    fn target(&self) -> String {
        "memory://stalling".to_string()
    }

    async fn put_object(&self, mut body: ObjectReader) -> Result<()> {
        let _flag = DropFlag(Arc::clone(&self.upload_dropped));
        let mut buf = [0u8; 512];
        body.read(&mut buf)
            .await
            .map_err(|e| VcpError::storage("read body", e))?;
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn get_object(&self) -> Result<ObjectReader> {
        Err(VcpError::NotFound { key: self.target() })
    }
}

/// Accepts `limit` bytes, then fails the upload.
pub struct FailingSink {
    pub limit: usize,
}

#[async_trait]
impl ObjectStorage for FailingSink {
    fn target(&self) -> String {
        "memory://failing".to_string()
    }

    async fn put_object(&self, mut body: ObjectReader) -> Result<()> {
        let mut seen = 0;
        let mut buf = vec![0u8; 4096];
        while seen < self.limit {
            let n = body
                .read(&mut buf)
                .await
                .map_err(|e| VcpError::storage("read body", e))?;
            if n == 0 {
                break;
            }
            seen += n;
        }
        Err(VcpError::storage_msg("sink rejected the upload"))
    }

    async fn get_object(&self) -> Result<ObjectReader> {
        Err(VcpError::NotFound { key: self.target() })
    }
}

/// Returns success without reading anything.
pub struct EarlyOkSink;

#[async_trait]
impl ObjectStorage for EarlyOkSink {
    fn target(&self) -> String {
        "memory://early".to_string()
    }

    async fn put_object(&self, _body: ObjectReader) -> Result<()> {
        Ok(())
    }

    async fn get_object(&self) -> Result<ObjectReader> {
        Err(VcpError::NotFound { key: self.target() })
    }
}

/// Wraps a [`MemoryStore`]; the `fail_on`-th `put` (1-based) fails.
pub struct FailingPutClient {
    pub inner: MemoryStore,
    pub fail_on: usize,
    pub puts: AtomicUsize,
}

impl FailingPutClient {
    pub fn new(inner: MemoryStore, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            puts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KvClient for FailingPutClient {
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValueRecord>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(VcpError::backing_store_msg("injected put failure"));
        }
        self.inner.put(key, value).await
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> Result<u64> {
        self.inner.delete_prefix(prefix).await
    }

    fn list_stream(&self, prefix: &[u8], cancel: CancellationToken) -> ListStream {
        self.inner.list_stream(prefix, cancel)
    }

    async fn member_list(&self) -> Result<Vec<Member>> {
        self.inner.member_list().await
    }
}

/// Delivers `records` with a pause before each one, then optionally an error.
pub struct SlowListClient {
    pub records: Vec<KeyValueRecord>,
    pub pause: Duration,
    pub fail_at_end: bool,
    pub listing_stopped: Arc<AtomicBool>,
}

impl SlowListClient {
    pub fn new(count: usize, pause: Duration) -> Self {
        Self {
            records: (0..count)
                .map(|i| KeyValueRecord::new(format!("/k/{i:05}"), vec![b'v'; 64]))
                .collect(),
            pause,
            fail_at_end: false,
            listing_stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl KvClient for SlowListClient {
    async fn get(&self, _key: &[u8]) -> Result<Option<KeyValueRecord>> {
        Ok(None)
    }

    async fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn delete_prefix(&self, _prefix: &[u8]) -> Result<u64> {
        Ok(0)
    }

    fn list_stream(&self, _prefix: &[u8], cancel: CancellationToken) -> ListStream {
        let (tx, rx) = mpsc::channel(16);
        let records = self.records.clone();
        let pause = self.pause;
        let fail_at_end = self.fail_at_end;
        let stopped = Arc::clone(&self.listing_stopped);
        tokio::spawn(async move {
            let _flag = DropFlag(stopped);
            for record in records {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(pause) => {}
                }
                if tx.send(Ok(record)).await.is_err() {
                    return;
                }
            }
            if fail_at_end {
                let _ = tx.send(Err(VcpError::backing_store_msg("connection reset"))).await;
            }
        });
        rx
    }

    async fn member_list(&self) -> Result<Vec<Member>> {
        Ok(Vec::new())
    }
}

/// Serves `data`, then never yields another byte or EOF.
pub struct StalledReader {
    pub data: Cursor<Vec<u8>>,
}

impl AsyncRead for StalledReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if (self.data.position() as usize) < self.data.get_ref().len() {
            return Pin::new(&mut self.data).poll_read(cx, buf);
        }
        Poll::Pending
    }
}

/// A source whose object stalls after `data`.
pub struct StalledSource {
    pub data: Vec<u8>,
}

#[async_trait]
impl ObjectStorage for StalledSource {
    fn target(&self) -> String {
        "memory://stalled".to_string()
    }

    async fn put_object(&self, _body: ObjectReader) -> Result<()> {
        Err(VcpError::storage_msg("read-only source"))
    }

    async fn get_object(&self) -> Result<ObjectReader> {
        Ok(Box::new(StalledReader {
            data: Cursor::new(self.data.clone()),
        }))
    }
}
