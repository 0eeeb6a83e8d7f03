//! Storage test utilities.

use async_trait::async_trait;
use bytes::Bytes;
use parcel_storage::{
    ByteStream, ObjectMeta, ObjectStore, StorageError, StorageResult, StreamingUpload,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Object store wrapper that counts streaming writes and can inject faults.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    stream_opens: AtomicUsize,
    failing_streams: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            stream_opens: AtomicUsize::new(0),
            failing_streams: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` streaming uploads fail on their first write.
    pub fn fail_next_streams(&self, n: usize) {
        self.failing_streams.store(n, Ordering::SeqCst);
    }

    /// Streaming uploads started so far.
    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failing_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        self.inner.put_if_not_exists(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let upload = self.inner.put_stream(key).await?;
        if self.take_failure() {
            return Ok(Box::new(FailingUpload { inner: upload }));
        }
        Ok(upload)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64> {
        self.inner.delete_prefix(prefix).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Streaming upload whose writes always fail.
struct FailingUpload {
    inner: Box<dyn StreamingUpload>,
}

#[async_trait]
impl StreamingUpload for FailingUpload {
    async fn write(&mut self, _data: Bytes) -> StorageResult<()> {
        Err(StorageError::Io(std::io::Error::other(
            "injected write failure",
        )))
    }

    fn bytes_written(&self) -> u64 {
        self.inner.bytes_written()
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        Err(StorageError::Io(std::io::Error::other(
            "injected finish failure",
        )))
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.inner.abort().await
    }
}
