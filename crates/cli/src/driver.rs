//! Resumable upload driver.
//!
//! The driver owns the client half of the protocol: it opens a session,
//! walks the file chunk by chunk and only moves its cursor once the server
//! has acknowledged a chunk. Transient failures are retried with exponential
//! backoff; anything else aborts the upload and is reported to the caller.

use async_trait::async_trait;
use bytes::Bytes;
use parcel_core::{
    ChunkAck, ChunkLayout, InitUploadRequest, InitUploadResponse, UploadId, UploadStatus,
    UploadStatusResponse,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Failure reported by an [`UploadTransport`].
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error envelope.
    #[error("server error ({status}, {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        retryable: bool,
    },

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api {
                status, retryable, ..
            } => *retryable || *status >= 500,
            Self::Decode(_) => false,
        }
    }

    /// Error code reported by the server, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Client side of the upload protocol.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Open a session.
    async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransportError>;

    /// Deliver one chunk.
    async fn send_chunk(
        &self,
        upload_id: &UploadId,
        index: u64,
        data: Bytes,
    ) -> Result<ChunkAck, TransportError>;

    /// Fetch the session snapshot.
    async fn status(&self, upload_id: &UploadId) -> Result<UploadStatusResponse, TransportError>;

    /// Delete the session and everything stored for it.
    async fn cancel(&self, upload_id: &UploadId) -> Result<(), TransportError>;
}

/// Errors that end an upload.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open upload session: {0}")]
    Init(#[source] TransportError),

    #[error("chunk {index} was not accepted after {attempts} attempt(s): {source}")]
    Chunk {
        index: u64,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("failed to query upload {upload_id}: {source}")]
    Status {
        upload_id: UploadId,
        #[source]
        source: TransportError,
    },

    #[error("upload {upload_id} failed on the server: {reason}")]
    Failed { upload_id: UploadId, reason: String },

    #[error("upload {upload_id} is still assembling; resume it later")]
    AssemblyPending { upload_id: UploadId },

    #[error("upload {upload_id} was cancelled")]
    Cancelled { upload_id: UploadId },

    #[error("{path} does not match upload {upload_id}: {reason}")]
    FileMismatch {
        upload_id: UploadId,
        path: PathBuf,
        reason: String,
    },

    #[error("invalid upload layout: {0}")]
    Layout(#[from] parcel_core::Error),
}

/// Tunables for [`UploadDriver`].
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further retry.
    pub retry_backoff: Duration,
    /// Chunk size to propose; the server default applies when `None`.
    pub chunk_size: Option<u64>,
    /// Content type to declare; `application/octet-stream` when `None`.
    pub mime_type: Option<String>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff: Duration::from_millis(500),
            chunk_size: None,
            mime_type: None,
        }
    }
}

/// Progress after an acknowledged chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub upload_id: UploadId,
    pub index: u64,
    pub received_count: u64,
    pub total_chunks: u64,
}

impl Progress {
    /// Fraction of chunks received, between 0 and 1.
    pub fn fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.received_count as f64 / self.total_chunks as f64
    }
}

/// Final state of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub upload_id: UploadId,
    pub total_size: u64,
    pub total_chunks: u64,
    pub artifact_sha256: Option<String>,
}

/// Session parameters the driver works against.
struct Plan {
    upload_id: UploadId,
    path: PathBuf,
    layout: ChunkLayout,
}

/// Drives one file through the upload protocol.
pub struct UploadDriver<T> {
    transport: T,
    options: DriverOptions,
}

impl<T: UploadTransport> UploadDriver<T> {
    pub fn new(transport: T, options: DriverOptions) -> Self {
        Self { transport, options }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Upload `path` as a new session.
    pub async fn upload<F>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> Result<UploadReport, DriverError>
    where
        F: FnMut(Progress) + Send,
    {
        let total_size = tokio::fs::metadata(path).await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let request = InitUploadRequest {
            filename,
            total_size,
            mime_type: self
                .options
                .mime_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            chunk_size: self.options.chunk_size,
        };
        let response = self
            .transport
            .init(&request)
            .await
            .map_err(DriverError::Init)?;
        info!(
            upload_id = %response.upload_id,
            chunk_size = response.chunk_size,
            total_chunks = response.total_chunks,
            "upload session opened"
        );

        let plan = Plan {
            upload_id: response.upload_id,
            path: path.to_path_buf(),
            layout: ChunkLayout::new(total_size, response.chunk_size)?,
        };
        let pending: Vec<u64> = (0..plan.layout.total_chunks()).collect();
        self.drive(&plan, pending, cancel, &mut progress).await
    }

    /// Continue an interrupted upload from its first missing chunk.
    pub async fn resume<F>(
        &self,
        upload_id: UploadId,
        path: &Path,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> Result<UploadReport, DriverError>
    where
        F: FnMut(Progress) + Send,
    {
        let status = self.fetch_status(&upload_id).await?;
        let total_size = tokio::fs::metadata(path).await?.len();
        if total_size != status.total_size {
            return Err(DriverError::FileMismatch {
                upload_id,
                path: path.to_path_buf(),
                reason: format!(
                    "file is {total_size} bytes, session expects {}",
                    status.total_size
                ),
            });
        }

        let plan = Plan {
            upload_id,
            path: path.to_path_buf(),
            layout: ChunkLayout::new(status.total_size, status.chunk_size)?,
        };

        match status.status {
            UploadStatus::Completed => return Ok(report(&status)),
            UploadStatus::Failed => return Err(failed(&status)),
            _ if status.missing_chunks.is_empty() => {
                // Every chunk is in but no assembly finished; an identical
                // redelivery of the last one starts or restarts it.
                let last = plan.layout.last_index();
                info!(%upload_id, status = %status.status, "resuming upload with every chunk received");
                return self.drive(&plan, vec![last], cancel, &mut progress).await;
            }
            _ => {}
        }

        info!(
            %upload_id,
            first_missing = ?status.missing_chunks.first(),
            missing = status.missing_chunks.len(),
            "resuming upload"
        );
        self.drive(&plan, status.missing_chunks, cancel, &mut progress)
            .await
    }

    async fn drive<F>(
        &self,
        plan: &Plan,
        pending: Vec<u64>,
        cancel: &CancellationToken,
        progress: &mut F,
    ) -> Result<UploadReport, DriverError>
    where
        F: FnMut(Progress) + Send,
    {
        let upload_id = plan.upload_id;
        let mut file = tokio::fs::File::open(&plan.path).await?;

        for index in pending {
            if cancel.is_cancelled() {
                return Err(self.abandon(upload_id).await);
            }

            let data = read_chunk(&mut file, &plan.layout, index).await?;
            let ack = self.send_with_retry(&upload_id, index, data, cancel).await?;
            progress(Progress {
                upload_id,
                index,
                received_count: ack.received_count,
                total_chunks: ack.total_chunks,
            });

            match ack.status {
                UploadStatus::Completed => return self.finish(&upload_id).await,
                UploadStatus::Failed => {
                    let status = self.fetch_status(&upload_id).await?;
                    return Err(failed(&status));
                }
                _ => {}
            }
        }

        self.wait_for_assembly(&upload_id, cancel).await
    }

    /// Send one chunk, retrying transient failures.
    async fn send_with_retry(
        &self,
        upload_id: &UploadId,
        index: u64,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ChunkAck, DriverError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .transport
                .send_chunk(upload_id, index, data.clone())
                .await
            {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempt <= self.options.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(index, attempt, error = %e, ?delay, "chunk delivery failed, retrying");
                    if !self.pause(delay, cancel).await {
                        return Err(self.abandon(*upload_id).await);
                    }
                }
                Err(source) => {
                    return Err(DriverError::Chunk {
                        index,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Poll a session whose chunks are all in until it settles.
    async fn wait_for_assembly(
        &self,
        upload_id: &UploadId,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, DriverError> {
        for attempt in 1..=self.options.max_retries + 1 {
            let status = self.fetch_status(upload_id).await?;
            match status.status {
                UploadStatus::Completed => return Ok(report(&status)),
                UploadStatus::Failed => return Err(failed(&status)),
                other => debug!(%upload_id, status = %other, attempt, "waiting for assembly"),
            }
            if !self.pause(self.backoff(attempt), cancel).await {
                return Err(self.abandon(*upload_id).await);
            }
        }
        Err(DriverError::AssemblyPending {
            upload_id: *upload_id,
        })
    }

    async fn finish(&self, upload_id: &UploadId) -> Result<UploadReport, DriverError> {
        let status = self.fetch_status(upload_id).await?;
        info!(%upload_id, sha256 = ?status.artifact_sha256, "upload completed");
        Ok(report(&status))
    }

    async fn fetch_status(&self, upload_id: &UploadId) -> Result<UploadStatusResponse, DriverError> {
        self.transport
            .status(upload_id)
            .await
            .map_err(|source| DriverError::Status {
                upload_id: *upload_id,
                source,
            })
    }

    /// Release the session after a cancellation. Failures are only logged.
    async fn abandon(&self, upload_id: UploadId) -> DriverError {
        if let Err(e) = self.transport.cancel(&upload_id).await {
            debug!(%upload_id, error = %e, "failed to release cancelled upload");
        }
        info!(%upload_id, "upload cancelled");
        DriverError::Cancelled { upload_id }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.options.retry_backoff.saturating_mul(factor)
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn read_chunk(
    file: &mut tokio::fs::File,
    layout: &ChunkLayout,
    index: u64,
) -> Result<Bytes, DriverError> {
    let len = usize::try_from(layout.expected_len(index)?).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "chunk size exceeds platform limits",
        )
    })?;
    file.seek(std::io::SeekFrom::Start(layout.offset(index)?))
        .await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn report(status: &UploadStatusResponse) -> UploadReport {
    UploadReport {
        upload_id: status.upload_id,
        total_size: status.total_size,
        total_chunks: status.total_chunks,
        artifact_sha256: status.artifact_sha256.clone(),
    }
}

fn failed(status: &UploadStatusResponse) -> DriverError {
    DriverError::Failed {
        upload_id: status.upload_id,
        reason: status
            .error
            .clone()
            .unwrap_or_else(|| "reassembly failed".to_string()),
    }
}
