//! Upload session types, lifecycle and wire messages.

use crate::chunk::{ChunkLayout, ReceivedMask};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| crate::Error::InvalidUploadId(format!("{s:?}: {e}")))
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UploadId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// Upload session status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Created, no chunk received yet.
    Pending,
    /// At least one chunk received.
    InProgress,
    /// Every chunk received; one invocation is concatenating them.
    Assembling,
    /// Artifact assembled and verified.
    Completed,
    /// Reassembly found corrupt or mis-sized data.
    Failed,
    /// Abandoned and scheduled for deletion.
    Expired,
}

impl UploadStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [UploadStatus; 6] = [
        Self::Pending,
        Self::InProgress,
        Self::Assembling,
        Self::Completed,
        Self::Failed,
        Self::Expired,
    ];

    /// Wire and database name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Whether the session is still moving toward an artifact.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::Assembling)
    }

    /// Whether the session reached a final status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Whether new chunks may still be stored.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownStatus(s.to_string()))
    }
}

/// A chunk that has been durably stored for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Position in the upload (0-indexed).
    pub index: u64,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the chunk bytes.
    pub sha256: ContentHash,
    /// When the chunk was first received.
    pub received_at: OffsetDateTime,
}

impl ChunkRecord {
    /// Describe chunk bytes received at `index`.
    pub fn describe(index: u64, data: &[u8], received_at: OffsetDateTime) -> Self {
        Self {
            index,
            size: data.len() as u64,
            sha256: ContentHash::compute(data),
            received_at,
        }
    }
}

/// An upload session as recorded by the registry.
#[derive(Clone, Debug)]
pub struct UploadSession {
    /// Unique session identifier.
    pub id: UploadId,
    /// Sanitized basename used for the artifact.
    pub filename: String,
    /// Client-declared content type.
    pub mime_type: String,
    /// Declared size of the whole file in bytes.
    pub total_size: u64,
    /// Chunk size fixed at creation.
    pub chunk_size: u64,
    /// `ceil(total_size / chunk_size)`.
    pub total_chunks: u64,
    /// Chunks durably stored so far.
    pub received: ReceivedMask,
    /// Current status.
    pub status: UploadStatus,
    /// Storage key of the assembled artifact (completed sessions).
    pub artifact_key: Option<String>,
    /// SHA-256 of the assembled artifact (completed sessions).
    pub artifact_sha256: Option<ContentHash>,
    /// Why reassembly failed (failed sessions).
    pub error_detail: Option<String>,
    /// When the session was created.
    pub created_at: OffsetDateTime,
    /// When a chunk or status change last touched the session.
    pub last_activity_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a fresh `Pending` session.
    pub fn new(
        filename: String,
        mime_type: String,
        layout: ChunkLayout,
        now: OffsetDateTime,
    ) -> Self {
        let total_chunks = layout.total_chunks();
        Self {
            id: UploadId::new(),
            filename,
            mime_type,
            total_size: layout.total_size(),
            chunk_size: layout.chunk_size(),
            total_chunks,
            received: ReceivedMask::new(total_chunks),
            status: UploadStatus::Pending,
            artifact_key: None,
            artifact_sha256: None,
            error_detail: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Chunk geometry of this session.
    pub fn layout(&self) -> crate::Result<ChunkLayout> {
        ChunkLayout::new(self.total_size, self.chunk_size)
    }

    /// Number of chunks received.
    pub fn received_count(&self) -> u64 {
        self.received.len()
    }

    /// Whether every chunk is stored.
    pub fn is_complete(&self) -> bool {
        self.received.is_complete()
    }

    /// Whether an active session has been idle longer than `stale_after`.
    ///
    /// Terminal sessions never go stale here; the sweeper handles their
    /// retention separately.
    pub fn is_stale(&self, now: OffsetDateTime, stale_after: time::Duration) -> bool {
        self.status.is_active() && now - self.last_activity_at > stale_after
    }

    /// Acknowledgment reflecting the current state.
    pub fn ack(&self) -> ChunkAck {
        ChunkAck {
            status: self.status,
            received_count: self.received_count(),
            total_chunks: self.total_chunks,
        }
    }

    /// Client-facing snapshot.
    pub fn to_status_response(&self) -> UploadStatusResponse {
        UploadStatusResponse {
            upload_id: self.id,
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            status: self.status,
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            received_count: self.received_count(),
            missing_chunks: self.received.missing().collect(),
            artifact_sha256: self.artifact_sha256.map(|h| h.to_hex()),
            error: self.error_detail.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// Request to create an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadRequest {
    /// Client-side filename.
    pub filename: String,
    /// Total size in bytes.
    pub total_size: u64,
    /// Declared content type.
    pub mime_type: String,
    /// Proposed chunk size (server default if absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Response from creating an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadResponse {
    /// The new session ID.
    pub upload_id: UploadId,
    /// Chunk size the client must use.
    pub chunk_size: u64,
    /// Number of chunks to send.
    pub total_chunks: u64,
}

/// Acknowledgment of a chunk delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// Session status after the chunk was applied.
    pub status: UploadStatus,
    /// Number of chunks received.
    pub received_count: u64,
    /// Number of chunks expected.
    pub total_chunks: u64,
}

/// Snapshot of a session for status queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub upload_id: UploadId,
    pub filename: String,
    pub mime_type: String,
    pub status: UploadStatus,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub received_count: u64,
    /// Indices not yet received, ascending.
    pub missing_chunks: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

/// JSON envelope wrapping every API response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl<T> ApiEnvelope<T> {
    /// Successful response carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            code: None,
            retryable: false,
        }
    }

    /// Failed response.
    pub fn error(message: impl Into<String>, code: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            code: Some(code.into()),
            retryable,
        }
    }
}
