//! Upload and API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parcel_core::ApiEnvelope;
use parcel_metadata::MetadataError;
use parcel_storage::StorageError;

/// Errors produced by the upload protocol.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("reassembly failed: {0}")]
    Reassembly(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Reassembly(_) => "reassembly_error",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<parcel_core::Error> for UploadError {
    fn from(err: parcel_core::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidKey(_) => Self::InvalidRequest(err.to_string()),
            StorageError::Config(_) => Self::Internal(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<MetadataError> for UploadError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(_) => Self::NotFound(err.to_string()),
            MetadataError::Conflict(_) => Self::Conflict(err.to_string()),
            MetadataError::Constraint(_) | MetadataError::InvalidStateTransition { .. } => {
                Self::InvalidRequest(err.to_string())
            }
            MetadataError::Database(_) | MetadataError::Io(_) => Self::Storage(err.to_string()),
            MetadataError::AlreadyExists(_)
            | MetadataError::Config(_)
            | MetadataError::Corrupt(_) => Self::Internal(err.to_string()),
        }
    }
}

/// Result type for coordinator operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Upload(e) => e.code(),
            Self::BadRequest(_) => "invalid_request",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upload(e) => match e {
                UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                UploadError::NotFound(_) => StatusCode::NOT_FOUND,
                UploadError::Conflict(_) => StatusCode::CONFLICT,
                UploadError::Reassembly(_) => StatusCode::UNPROCESSABLE_ENTITY,
                UploadError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Upload(e) => e.is_retryable(),
            Self::BadRequest(_) => false,
            Self::Unavailable(_) => true,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "request failed");
        }
        crate::metrics::record_upload_error(self.code());
        let body = ApiEnvelope::<()>::error(self.to_string(), self.code(), self.is_retryable());
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (UploadError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (UploadError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (UploadError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                UploadError::Reassembly("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                UploadError::Storage("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                UploadError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_only_storage_is_retryable() {
        assert!(UploadError::Storage("disk".into()).is_retryable());
        assert!(!UploadError::Conflict("chunk 0".into()).is_retryable());
        assert!(!UploadError::Reassembly("digest".into()).is_retryable());
    }

    #[test]
    fn test_metadata_error_mapping() {
        let err: UploadError = MetadataError::Conflict("chunk 3".into()).into();
        assert!(matches!(err, UploadError::Conflict(_)));

        let err: UploadError = MetadataError::InvalidStateTransition {
            from: "failed".into(),
            to: "in_progress".into(),
        }
        .into();
        assert!(matches!(err, UploadError::InvalidRequest(_)));

        let err: UploadError = MetadataError::Io(std::io::Error::other("disk full")).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_core_error_is_invalid_request() {
        let err: UploadError = parcel_core::Error::ChunkIndexOutOfRange { index: 9, total: 3 }.into();
        assert_eq!(err.code(), "invalid_request");
    }
}
