//! Artifact reassembly.
//!
//! Concatenates a session's chunks in index order into a single artifact,
//! streaming every chunk and verifying each one against its recorded digest.
//! The caller must hold the assembly lease for the session.

use crate::error::{UploadError, UploadResult};
use crate::metrics::{REASSEMBLY_DURATION, UPLOAD_SESSIONS_COMPLETED, UPLOAD_SESSIONS_FAILED};
use futures::TryStreamExt;
use parcel_core::{ChunkLayout, ChunkRecord, ContentHash, ContentHasher, UploadSession};
use parcel_metadata::{MetadataStore, UploadChunkRow};
use parcel_storage::{ChunkStore, StorageError, StreamingUpload};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

/// Why an assembly attempt did not produce an artifact.
#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("expected {expected} chunk records, found {found}")]
    IncompleteRecords { expected: u64, found: u64 },

    #[error("chunk record {found} found where chunk {expected} was expected")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("chunk {index} is missing from storage")]
    MissingChunk { index: u64 },

    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },

    #[error("chunk {index} digest {actual} does not match recorded {expected}")]
    DigestMismatch {
        index: u64,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("artifact is {actual} bytes, declared size is {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("{0}")]
    InvalidLayout(#[from] parcel_core::Error),

    #[error(transparent)]
    Storage(StorageError),
}

impl ReassemblyError {
    /// Storage faults may clear up on a later attempt; data faults never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<StorageError> for ReassemblyError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// A verified artifact.
#[derive(Clone, Debug)]
pub struct AssembledArtifact {
    pub key: String,
    pub sha256: ContentHash,
    pub size: u64,
}

/// Builds artifacts from stored chunks and records the outcome.
#[derive(Clone)]
pub struct Reassembler {
    repo: Arc<dyn MetadataStore>,
    chunks: ChunkStore,
}

impl Reassembler {
    pub fn new(repo: Arc<dyn MetadataStore>, chunks: ChunkStore) -> Self {
        Self { repo, chunks }
    }

    /// Assemble the artifact and move the session to its terminal status.
    ///
    /// On a data fault the session is marked `failed` and
    /// [`UploadError::Reassembly`] is returned. On a storage fault the lease
    /// is released and [`UploadError::Storage`] is returned, so a later
    /// delivery can retry.
    #[instrument(skip(self, session), fields(upload_id = %session.id, chunks = session.total_chunks))]
    pub async fn run(&self, session: &UploadSession) -> UploadResult<AssembledArtifact> {
        let start = Instant::now();
        let upload_id = *session.id.as_uuid();

        let records = self
            .repo
            .get_received_chunks(upload_id)
            .await?
            .iter()
            .map(UploadChunkRow::to_record)
            .collect::<Result<Vec<_>, _>>()?;

        match self.assemble(session, &records).await {
            Ok(artifact) => {
                let now = OffsetDateTime::now_utc();
                let completed = self
                    .repo
                    .complete_session(upload_id, &artifact.key, &artifact.sha256.to_hex(), now)
                    .await?;
                if !completed {
                    // Lease was taken over or the session was cancelled meanwhile.
                    return Err(UploadError::Conflict(format!(
                        "upload {} left assembling before completion",
                        session.id
                    )));
                }
                REASSEMBLY_DURATION.observe(start.elapsed().as_secs_f64());
                UPLOAD_SESSIONS_COMPLETED.inc();
                info!(
                    size = artifact.size,
                    sha256 = %artifact.sha256,
                    "artifact assembled"
                );
                Ok(artifact)
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "reassembly interrupted by storage fault, releasing lease");
                if let Err(release_err) = self.repo.release_assembly(upload_id).await {
                    warn!(error = %release_err, "failed to release assembly lease");
                }
                Err(UploadError::Storage(e.to_string()))
            }
            Err(e) => {
                let detail = e.to_string();
                warn!(error = %detail, "reassembly found corrupt data");
                self.repo
                    .fail_session(upload_id, &detail, OffsetDateTime::now_utc())
                    .await?;
                UPLOAD_SESSIONS_FAILED.inc();
                Err(UploadError::Reassembly(detail))
            }
        }
    }

    async fn assemble(
        &self,
        session: &UploadSession,
        records: &[ChunkRecord],
    ) -> Result<AssembledArtifact, ReassemblyError> {
        let layout = session.layout()?;
        if records.len() as u64 != layout.total_chunks() {
            return Err(ReassemblyError::IncompleteRecords {
                expected: layout.total_chunks(),
                found: records.len() as u64,
            });
        }

        let mut writer = self
            .chunks
            .artifact_writer(&session.id, &session.filename)
            .await?;

        match self.copy_chunks(session, &layout, records, writer.as_mut()).await {
            Ok(sha256) => {
                let size = writer.finish().await?;
                Ok(AssembledArtifact {
                    key: ChunkStore::artifact_key(&session.id, &session.filename),
                    sha256,
                    size,
                })
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(error = %abort_err, "failed to discard partial artifact");
                }
                Err(e)
            }
        }
    }

    async fn copy_chunks(
        &self,
        session: &UploadSession,
        layout: &ChunkLayout,
        records: &[ChunkRecord],
        writer: &mut dyn StreamingUpload,
    ) -> Result<ContentHash, ReassemblyError> {
        let mut artifact_hasher = ContentHash::hasher();

        for (expected, record) in (0u64..).zip(records) {
            if record.index != expected {
                return Err(ReassemblyError::OutOfOrder {
                    expected,
                    found: record.index,
                });
            }
            let expected_len = layout.expected_len(expected)?;
            if record.size != expected_len {
                return Err(ReassemblyError::LengthMismatch {
                    index: expected,
                    expected: expected_len,
                    actual: record.size,
                });
            }

            let mut stream = match self.chunks.chunk_stream(&session.id, expected).await {
                Ok(stream) => stream,
                Err(StorageError::NotFound(_)) => {
                    return Err(ReassemblyError::MissingChunk { index: expected });
                }
                Err(e) => return Err(e.into()),
            };

            let mut chunk_hasher: ContentHasher = ContentHash::hasher();
            let mut copied = 0u64;
            while let Some(piece) = stream.try_next().await? {
                chunk_hasher.update(&piece);
                artifact_hasher.update(&piece);
                copied += piece.len() as u64;
                writer.write(piece).await?;
            }

            if copied != record.size {
                return Err(ReassemblyError::LengthMismatch {
                    index: expected,
                    expected: record.size,
                    actual: copied,
                });
            }
            let actual = chunk_hasher.finalize();
            if actual != record.sha256 {
                return Err(ReassemblyError::DigestMismatch {
                    index: expected,
                    expected: record.sha256,
                    actual,
                });
            }
        }

        let written = writer.bytes_written();
        if written != session.total_size {
            return Err(ReassemblyError::SizeMismatch {
                declared: session.total_size,
                actual: written,
            });
        }

        Ok(artifact_hasher.finalize())
    }
}
