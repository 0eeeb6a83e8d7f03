//! Upload session coordinator.
//!
//! Every operation is a bounded unit of work: state crosses requests only
//! through the registry and the chunk store. Concurrent deliveries for the
//! same session are merged by the registry, and the registry's assembly
//! compare-and-set decides which invocation reassembles.

use crate::error::{UploadError, UploadResult};
use crate::metrics::{
    BYTES_RECEIVED, CHUNK_ACCEPT_DURATION, CHUNK_CONFLICTS, CHUNKS_ACCEPTED, CHUNKS_DUPLICATE,
    UPLOAD_SESSIONS_CANCELLED, UPLOAD_SESSIONS_CREATED, UPLOAD_SESSIONS_EXPIRED,
};
use crate::reassembly::Reassembler;
use bytes::Bytes;
use parcel_core::config::UploadConfig;
use parcel_core::filename::{ContentPolicy, sanitize_filename};
use parcel_core::{
    ChunkAck, ChunkLayout, ChunkRecord, InitUploadRequest, UploadId, UploadSession, UploadStatus,
};
use parcel_metadata::{MetadataError, MetadataStore, UploadChunkRow, UploadSessionRow};
use parcel_storage::{ByteStream, ChunkStore, PutOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Outcome of one expiry sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Stale sessions examined.
    pub scanned: u64,
    /// Sessions deleted with all of their blobs.
    pub deleted: u64,
    /// Blobs removed from storage.
    pub blobs_removed: u64,
    /// Sessions left for the next sweep after an error.
    pub errors: u64,
}

/// Protocol surface for chunked uploads.
#[derive(Clone)]
pub struct UploadCoordinator {
    repo: Arc<dyn MetadataStore>,
    chunks: ChunkStore,
    reassembler: Reassembler,
    config: Arc<UploadConfig>,
    policy: Arc<ContentPolicy>,
}

impl UploadCoordinator {
    pub fn new(repo: Arc<dyn MetadataStore>, chunks: ChunkStore, config: UploadConfig) -> Self {
        let policy = ContentPolicy::new(&config.allowed_mime_types, &config.allowed_extensions);
        Self {
            reassembler: Reassembler::new(repo.clone(), chunks.clone()),
            repo,
            chunks,
            config: Arc::new(config),
            policy: Arc::new(policy),
        }
    }

    /// Upload limits in effect.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Validate the declared file and open a `pending` session.
    #[instrument(skip(self, req), fields(filename = %req.filename, total_size = req.total_size))]
    pub async fn create_session(&self, req: &InitUploadRequest) -> UploadResult<UploadSession> {
        if req.total_size == 0 {
            return Err(UploadError::InvalidRequest(
                "zero-byte uploads are not accepted".to_string(),
            ));
        }
        if req.total_size > self.config.max_total_size {
            return Err(UploadError::InvalidRequest(format!(
                "declared size {} exceeds the limit of {} bytes",
                req.total_size, self.config.max_total_size
            )));
        }

        let filename = sanitize_filename(&req.filename)?;
        let mime_type = match req.mime_type.trim() {
            "" => DEFAULT_MIME_TYPE.to_string(),
            declared => declared.to_string(),
        };
        self.policy.check(&filename, &mime_type)?;

        let chunk_size = req.chunk_size.unwrap_or(self.config.chunk_size);
        if !(self.config.min_chunk_size..=self.config.max_chunk_size).contains(&chunk_size) {
            return Err(parcel_core::Error::InvalidChunkSize {
                size: chunk_size,
                min: self.config.min_chunk_size,
                max: self.config.max_chunk_size,
            }
            .into());
        }
        let layout = ChunkLayout::new(req.total_size, chunk_size)?;

        let session = UploadSession::new(filename, mime_type, layout, OffsetDateTime::now_utc());
        self.repo
            .create_session(&UploadSessionRow::from_session(&session)?)
            .await?;

        UPLOAD_SESSIONS_CREATED.inc();
        info!(
            upload_id = %session.id,
            chunk_size,
            total_chunks = session.total_chunks,
            "upload session created"
        );
        Ok(session)
    }

    /// Accept one chunk.
    ///
    /// Nothing is mutated when validation fails. When this delivery completes
    /// the mask and wins the assembly compare-and-set, the artifact is
    /// assembled before returning.
    #[instrument(skip(self, data), fields(upload_id = %id, index, size = data.len()))]
    pub async fn accept_chunk(
        &self,
        id: &UploadId,
        index: u64,
        data: Bytes,
    ) -> UploadResult<ChunkAck> {
        let start = Instant::now();
        let now = OffsetDateTime::now_utc();

        let row = self.live_row(id, now).await?;
        let status = row_status(&row)?;
        if status == UploadStatus::Failed {
            return Err(UploadError::InvalidRequest(format!(
                "upload {id} failed: {}",
                row.error_detail.as_deref().unwrap_or("reassembly error")
            )));
        }
        let layout = row_layout(&row)?;
        layout.validate_chunk(index, data.len() as u64)?;

        let record = ChunkRecord::describe(index, &data, now);
        let ack = if status.accepts_chunks() {
            self.store_chunk(id, &record, data).await?
        } else {
            self.redeliver(id, &record, status, &row).await?
        };

        CHUNK_ACCEPT_DURATION.observe(start.elapsed().as_secs_f64());
        Ok(ack)
    }

    /// Current snapshot of a live session.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn get_status(&self, id: &UploadId) -> UploadResult<UploadSession> {
        let now = OffsetDateTime::now_utc();
        let row = self.live_row(id, now).await?;
        self.rehydrate(row).await
    }

    /// Delete a session with its chunks and artifact.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn cancel(&self, id: &UploadId) -> UploadResult<()> {
        let upload_id = *id.as_uuid();
        if self.repo.get_session(upload_id).await?.is_none() {
            return Err(not_found(id));
        }

        // Blobs go first: a session row without blobs is swept later, blobs
        // without a row would leak.
        let removed = self.chunks.purge_session(id).await?;
        self.repo.delete_session(upload_id).await?;

        UPLOAD_SESSIONS_CANCELLED.inc();
        info!(blobs_removed = removed, "upload session removed");
        Ok(())
    }

    /// Stream the artifact of a completed session.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn open_artifact(&self, id: &UploadId) -> UploadResult<(UploadSession, ByteStream)> {
        let session = self.get_status(id).await?;
        if session.status != UploadStatus::Completed {
            return Err(UploadError::InvalidRequest(format!(
                "upload {id} is {}, not completed",
                session.status
            )));
        }
        let key = session.artifact_key.clone().ok_or_else(|| {
            UploadError::Internal(format!("completed upload {id} has no artifact key"))
        })?;
        let stream = self.chunks.open_artifact(&key).await?;
        Ok((session, stream))
    }

    /// Expire and delete abandoned and retained-too-long sessions.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: OffsetDateTime) -> UploadResult<SweepStats> {
        let active_cutoff = now - self.config.stale_after();
        let terminal_cutoff = now - self.config.completed_retention();
        let batch_size = self.config.sweep_batch_size;
        let mut stats = SweepStats::default();

        loop {
            let batch = self
                .repo
                .get_stale_sessions(active_cutoff, terminal_cutoff, batch_size)
                .await?;
            let fetched = batch.len();
            let deleted_before = stats.deleted;

            for row in batch {
                stats.scanned += 1;
                let id = UploadId::from_uuid(row.upload_id);
                match self.expire_one(&id, active_cutoff, terminal_cutoff).await {
                    Ok(Some(removed)) => {
                        stats.deleted += 1;
                        stats.blobs_removed += removed;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stats.errors += 1;
                        warn!(upload_id = %id, error = %e, "failed to expire upload session");
                    }
                }
            }

            // Failed sessions stay at the head of the queue; stop rather than
            // fetching them again.
            if fetched < batch_size as usize || stats.deleted == deleted_before {
                break;
            }
        }

        if stats.deleted > 0 {
            UPLOAD_SESSIONS_EXPIRED.inc_by(stats.deleted);
            info!(
                deleted = stats.deleted,
                blobs_removed = stats.blobs_removed,
                "expired upload sessions"
            );
        }
        Ok(stats)
    }

    async fn expire_one(
        &self,
        id: &UploadId,
        active_cutoff: OffsetDateTime,
        terminal_cutoff: OffsetDateTime,
    ) -> UploadResult<Option<u64>> {
        let upload_id = *id.as_uuid();
        // A delivery may have refreshed the session since it was listed.
        if !self
            .repo
            .expire_session(upload_id, active_cutoff, terminal_cutoff)
            .await?
        {
            return Ok(None);
        }
        let removed = self.chunks.purge_session(id).await?;
        self.repo.delete_session(upload_id).await?;
        debug!(upload_id = %id, blobs_removed = removed, "expired upload session");
        Ok(Some(removed))
    }

    /// Store a chunk for a session that still accepts chunks.
    async fn store_chunk(
        &self,
        id: &UploadId,
        record: &ChunkRecord,
        data: Bytes,
    ) -> UploadResult<ChunkAck> {
        let size = data.len() as u64;
        match self.chunks.put_chunk(id, record.index, data).await? {
            PutOutcome::Stored => {
                CHUNKS_ACCEPTED.inc();
                BYTES_RECEIVED.inc_by(size);
            }
            PutOutcome::Identical => CHUNKS_DUPLICATE.inc(),
            PutOutcome::Conflict => {
                CHUNK_CONFLICTS.inc();
                return Err(chunk_conflict(id, record.index));
            }
        }

        let chunk_row = UploadChunkRow::from_record(id, record)?;
        let receipt = match self.repo.mark_chunk_received(&chunk_row, record.received_at).await {
            Ok(receipt) => receipt,
            Err(MetadataError::InvalidStateTransition { from, .. }) => {
                // The session moved on between loading and recording.
                let now = OffsetDateTime::now_utc();
                let row = self.live_row(id, now).await?;
                let status = row_status(&row)?;
                debug!(%from, %status, "session changed while storing chunk");
                if status == UploadStatus::Failed {
                    return Err(UploadError::InvalidRequest(format!("upload {id} failed")));
                }
                return self.redeliver(id, record, status, &row).await;
            }
            Err(MetadataError::NotFound(_)) => {
                // Cancelled or swept mid-request; drop what we just wrote.
                if let Err(e) = self.chunks.purge_session(id).await {
                    warn!(error = %e, "failed to remove chunk of deleted session");
                }
                return Err(not_found(id));
            }
            Err(MetadataError::Conflict(detail)) => {
                CHUNK_CONFLICTS.inc();
                return Err(UploadError::Conflict(detail));
            }
            Err(e) => return Err(e.into()),
        };

        if receipt.session.received_count == receipt.session.total_chunks {
            return self.finish_if_complete(id).await;
        }
        row_ack(&receipt.session)
    }

    /// Handle a delivery to a session that no longer accepts new chunks.
    ///
    /// A byte-identical redelivery is acknowledged with the current status;
    /// for an `assembling` session it also retries an abandoned assembly.
    async fn redeliver(
        &self,
        id: &UploadId,
        record: &ChunkRecord,
        status: UploadStatus,
        row: &UploadSessionRow,
    ) -> UploadResult<ChunkAck> {
        let existing = self
            .repo
            .get_chunk(*id.as_uuid(), row_index(record.index)?)
            .await?
            .map(|r| r.to_record())
            .transpose()?;

        let identical = existing
            .is_some_and(|e| e.size == record.size && e.sha256 == record.sha256);
        if !identical {
            CHUNK_CONFLICTS.inc();
            return Err(chunk_conflict(id, record.index));
        }
        CHUNKS_DUPLICATE.inc();

        match status {
            UploadStatus::Assembling => self.finish_if_complete(id).await,
            UploadStatus::Expired => Err(not_found(id)),
            _ => row_ack(row),
        }
    }

    /// Try to take the assembly lease and, on success, reassemble.
    async fn finish_if_complete(&self, id: &UploadId) -> UploadResult<ChunkAck> {
        let upload_id = *id.as_uuid();
        let now = OffsetDateTime::now_utc();
        let lease_cutoff = now - self.config.assembly_lease();

        if !self.repo.begin_assembly(upload_id, now, lease_cutoff).await? {
            debug!(upload_id = %id, "another invocation holds the assembly lease");
            let row = self
                .repo
                .get_session(upload_id)
                .await?
                .ok_or_else(|| not_found(id))?;
            return row_ack(&row);
        }

        let row = self
            .repo
            .get_session(upload_id)
            .await?
            .ok_or_else(|| not_found(id))?;
        let session = self.rehydrate(row).await?;
        self.reassembler.run(&session).await?;

        let row = self
            .repo
            .get_session(upload_id)
            .await?
            .ok_or_else(|| not_found(id))?;
        row_ack(&row)
    }

    /// Load a session that exists, is not expired and has not gone stale.
    async fn live_row(&self, id: &UploadId, now: OffsetDateTime) -> UploadResult<UploadSessionRow> {
        let row = self
            .repo
            .get_session(*id.as_uuid())
            .await?
            .ok_or_else(|| not_found(id))?;
        let status = row_status(&row)?;
        let idle = now - row.last_activity_at;
        if status == UploadStatus::Expired
            || (status.is_active() && idle > self.config.stale_after())
        {
            return Err(not_found(id));
        }
        Ok(row)
    }

    async fn rehydrate(&self, row: UploadSessionRow) -> UploadResult<UploadSession> {
        let chunks = self.repo.get_received_chunks(row.upload_id).await?;
        Ok(row.into_session(&chunks)?)
    }
}

fn not_found(id: &UploadId) -> UploadError {
    UploadError::NotFound(format!("upload {id} not found"))
}

fn chunk_conflict(id: &UploadId, index: u64) -> UploadError {
    UploadError::Conflict(format!(
        "chunk {index} of upload {id} was already received with different content"
    ))
}

fn row_status(row: &UploadSessionRow) -> UploadResult<UploadStatus> {
    row.status.parse::<UploadStatus>().map_err(|e| {
        UploadError::Internal(format!("upload {}: {e}", row.upload_id))
    })
}

fn row_u64(field: &str, value: i64) -> UploadResult<u64> {
    u64::try_from(value)
        .map_err(|_| UploadError::Internal(format!("{field} is negative: {value}")))
}

fn row_index(index: u64) -> UploadResult<i64> {
    i64::try_from(index)
        .map_err(|_| UploadError::InvalidRequest(format!("chunk index {index} is too large")))
}

fn row_layout(row: &UploadSessionRow) -> UploadResult<ChunkLayout> {
    let layout = ChunkLayout::new(
        row_u64("total_size", row.total_size)?,
        row_u64("chunk_size", row.chunk_size)?,
    )
    .map_err(|e| UploadError::Internal(format!("upload {}: {e}", row.upload_id)))?;
    Ok(layout)
}

fn row_ack(row: &UploadSessionRow) -> UploadResult<ChunkAck> {
    Ok(ChunkAck {
        status: row_status(row)?,
        received_count: row_u64("received_count", row.received_count)?,
        total_chunks: row_u64("total_chunks", row.total_chunks)?,
    })
}
