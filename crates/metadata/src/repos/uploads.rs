//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::{UploadChunkRow, UploadSessionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Outcome of recording a chunk.
#[derive(Debug, Clone)]
pub struct ChunkReceipt {
    /// `false` when an identical record already existed.
    pub newly_received: bool,
    /// Session state after the chunk was recorded.
    pub session: UploadSessionRow,
}

/// Repository for upload session operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create a new upload session. Fails with `AlreadyExists` on ID collision.
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get an upload session by ID.
    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Chunk records for a session, ordered by index.
    async fn get_received_chunks(&self, upload_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>>;

    /// A single chunk record.
    async fn get_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: i64,
    ) -> MetadataResult<Option<UploadChunkRow>>;

    /// Record a durably stored chunk in one transaction.
    ///
    /// Touches `last_activity_at`, moves `pending` to `in_progress` and
    /// recomputes `received_count`. The session must be `pending`,
    /// `in_progress` or `assembling`; otherwise `NotFound` (missing) or
    /// `InvalidStateTransition` is returned. A record already present at the
    /// same index with a different digest is a `Conflict` and nothing changes.
    async fn mark_chunk_received(
        &self,
        chunk: &UploadChunkRow,
        now: OffsetDateTime,
    ) -> MetadataResult<ChunkReceipt>;

    /// Try to take the assembly lease.
    ///
    /// Succeeds only when every chunk is recorded and the session is
    /// `pending`/`in_progress`, or `assembling` with no lease or a lease
    /// older than `lease_cutoff`. Exactly one concurrent caller wins.
    async fn begin_assembly(
        &self,
        upload_id: Uuid,
        now: OffsetDateTime,
        lease_cutoff: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Drop the assembly lease so a later delivery can retry reassembly.
    async fn release_assembly(&self, upload_id: Uuid) -> MetadataResult<()>;

    /// Transition `assembling` to `completed`.
    async fn complete_session(
        &self,
        upload_id: Uuid,
        artifact_key: &str,
        artifact_sha256: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Transition `assembling` to `failed`.
    async fn fail_session(
        &self,
        upload_id: Uuid,
        error_detail: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Sessions eligible for expiry: active and idle since before
    /// `active_cutoff`, terminal and idle since before `terminal_cutoff`, or
    /// already `expired`. Oldest first.
    async fn get_stale_sessions(
        &self,
        active_cutoff: OffsetDateTime,
        terminal_cutoff: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Mark a session `expired` if it is still eligible. Returns whether it
    /// is now expired.
    async fn expire_session(
        &self,
        upload_id: Uuid,
        active_cutoff: OffsetDateTime,
        terminal_cutoff: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Delete a session and its chunk records.
    async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<bool>;

    /// Session counts grouped by status.
    async fn count_sessions_by_status(&self) -> MetadataResult<Vec<(String, i64)>>;
}
