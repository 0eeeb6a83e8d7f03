//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid chunk size: {size} (must be between {min} and {max})")]
    InvalidChunkSize { size: u64, min: u64, max: u64 },

    #[error("invalid total size: {0}")]
    InvalidTotalSize(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("unknown upload status: {0}")]
    UnknownStatus(String),

    #[error("chunk index {index} out of range (total chunks: {total})")]
    ChunkIndexOutOfRange { index: u64, total: u64 },

    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    ChunkLengthMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
