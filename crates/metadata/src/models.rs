//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use parcel_core::{ChunkRecord, ContentHash, ReceivedMask, UploadId, UploadSession, UploadStatus};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub upload_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    /// Maintained from `upload_chunks`; never written by callers.
    pub received_count: i64,
    pub status: String,
    pub artifact_key: Option<String>,
    pub artifact_sha256: Option<String>,
    pub error_detail: Option<String>,
    /// Set while an invocation holds the assembly lease.
    pub assembly_started_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_activity_at: OffsetDateTime,
}

/// A chunk recorded as durably stored.
#[derive(Debug, Clone, FromRow)]
pub struct UploadChunkRow {
    pub upload_id: Uuid,
    pub chunk_index: i64,
    pub size_bytes: i64,
    pub sha256: String,
    pub received_at: OffsetDateTime,
}

impl UploadSessionRow {
    /// Row for a newly created session.
    pub fn from_session(session: &UploadSession) -> MetadataResult<Self> {
        Ok(Self {
            upload_id: *session.id.as_uuid(),
            filename: session.filename.clone(),
            mime_type: session.mime_type.clone(),
            total_size: to_i64("total_size", session.total_size)?,
            chunk_size: to_i64("chunk_size", session.chunk_size)?,
            total_chunks: to_i64("total_chunks", session.total_chunks)?,
            received_count: to_i64("received_count", session.received_count())?,
            status: session.status.as_str().to_string(),
            artifact_key: session.artifact_key.clone(),
            artifact_sha256: session.artifact_sha256.map(|h| h.to_hex()),
            error_detail: session.error_detail.clone(),
            assembly_started_at: None,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        })
    }

    /// Rehydrate the domain session from this row and its chunk records.
    pub fn into_session(self, chunks: &[UploadChunkRow]) -> MetadataResult<UploadSession> {
        let total_chunks = to_u64("total_chunks", self.total_chunks)?;
        let received = ReceivedMask::from_indices(
            total_chunks,
            chunks
                .iter()
                .map(|c| to_u64("chunk_index", c.chunk_index))
                .collect::<MetadataResult<Vec<_>>>()?,
        )
        .map_err(|e| MetadataError::Corrupt(format!("upload {}: {e}", self.upload_id)))?;

        let status = self
            .status
            .parse::<UploadStatus>()
            .map_err(|e| MetadataError::Corrupt(format!("upload {}: {e}", self.upload_id)))?;
        let artifact_sha256 = self
            .artifact_sha256
            .as_deref()
            .map(ContentHash::from_hex)
            .transpose()
            .map_err(|e| MetadataError::Corrupt(format!("upload {}: {e}", self.upload_id)))?;

        Ok(UploadSession {
            id: UploadId::from_uuid(self.upload_id),
            filename: self.filename,
            mime_type: self.mime_type,
            total_size: to_u64("total_size", self.total_size)?,
            chunk_size: to_u64("chunk_size", self.chunk_size)?,
            total_chunks,
            received,
            status,
            artifact_key: self.artifact_key,
            artifact_sha256,
            error_detail: self.error_detail,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        })
    }
}

impl UploadChunkRow {
    pub fn from_record(upload_id: &UploadId, record: &ChunkRecord) -> MetadataResult<Self> {
        Ok(Self {
            upload_id: *upload_id.as_uuid(),
            chunk_index: to_i64("chunk_index", record.index)?,
            size_bytes: to_i64("size_bytes", record.size)?,
            sha256: record.sha256.to_hex(),
            received_at: record.received_at,
        })
    }

    pub fn to_record(&self) -> MetadataResult<ChunkRecord> {
        Ok(ChunkRecord {
            index: to_u64("chunk_index", self.chunk_index)?,
            size: to_u64("size_bytes", self.size_bytes)?,
            sha256: ContentHash::from_hex(&self.sha256)
                .map_err(|e| MetadataError::Corrupt(format!("chunk {}: {e}", self.chunk_index)))?,
            received_at: self.received_at,
        })
    }
}

pub(crate) fn to_i64(field: &str, value: u64) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Corrupt(format!("{field} {value} exceeds i64 range")))
}

pub(crate) fn to_u64(field: &str, value: i64) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("{field} is negative: {value}")))
}
