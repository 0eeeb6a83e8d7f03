//! Position-keyed chunk storage and artifact blobs for upload sessions.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectStore, StreamingUpload};
use bytes::Bytes;
use parcel_core::UploadId;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Result of storing a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The chunk was written.
    Stored,
    /// Byte-identical content was already present.
    Identical,
    /// Different content is stored at this position; nothing was written.
    Conflict,
}

/// Chunk and artifact storage for upload sessions.
///
/// Layout:
/// - `uploads/{id}/chunks/{index:010}`
/// - `uploads/{id}/artifact/{filename}`
#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn ObjectStore>,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Prefix holding every blob for a session.
    pub fn session_prefix(id: &UploadId) -> String {
        format!("uploads/{id}")
    }

    /// Key of the chunk at `index`.
    pub fn chunk_key(id: &UploadId, index: u64) -> String {
        format!("uploads/{id}/chunks/{index:010}")
    }

    /// Key of the assembled artifact.
    pub fn artifact_key(id: &UploadId, filename: &str) -> String {
        format!("uploads/{id}/artifact/{filename}")
    }

    /// Store chunk bytes at `(id, index)` unless something is already there.
    ///
    /// An existing blob is never overwritten; its content decides between
    /// [`PutOutcome::Identical`] and [`PutOutcome::Conflict`].
    #[instrument(skip(self, data), fields(upload_id = %id, size = data.len()))]
    pub async fn put_chunk(&self, id: &UploadId, index: u64, data: Bytes) -> StorageResult<PutOutcome> {
        let key = Self::chunk_key(id, index);
        if self.store.put_if_not_exists(&key, data.clone()).await? {
            return Ok(PutOutcome::Stored);
        }

        match self.store.get(&key).await {
            Ok(existing) if existing == data => {
                debug!(index, "chunk already stored with identical content");
                Ok(PutOutcome::Identical)
            }
            Ok(_) => {
                warn!(index, "chunk position already holds different content");
                Ok(PutOutcome::Conflict)
            }
            // Removed between our attempt and the read (session purge).
            Err(StorageError::NotFound(_)) => Err(StorageError::NotFound(key)),
            Err(e) => Err(e),
        }
    }

    /// Read a whole chunk.
    pub async fn get_chunk(&self, id: &UploadId, index: u64) -> StorageResult<Bytes> {
        self.store.get(&Self::chunk_key(id, index)).await
    }

    /// Stream a chunk in bounded pieces.
    pub async fn chunk_stream(&self, id: &UploadId, index: u64) -> StorageResult<ByteStream> {
        self.store.get_stream(&Self::chunk_key(id, index)).await
    }

    /// Whether a chunk blob exists.
    pub async fn has_chunk(&self, id: &UploadId, index: u64) -> StorageResult<bool> {
        self.store.exists(&Self::chunk_key(id, index)).await
    }

    /// Start writing the artifact; it becomes visible on `finish`.
    pub async fn artifact_writer(
        &self,
        id: &UploadId,
        filename: &str,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        self.store
            .put_stream(&Self::artifact_key(id, filename))
            .await
    }

    /// Stream a finished artifact by key.
    pub async fn open_artifact(&self, key: &str) -> StorageResult<ByteStream> {
        self.store.get_stream(key).await
    }

    /// Remove chunks and artifact for a session. Returns blobs removed.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn purge_session(&self, id: &UploadId) -> StorageResult<u64> {
        let removed = self.store.delete_prefix(&Self::session_prefix(id)).await?;
        debug!(removed, "purged session blobs");
        Ok(removed)
    }
}
