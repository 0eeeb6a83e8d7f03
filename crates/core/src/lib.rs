//! Core domain types and shared logic for Parcel.
//!
//! This crate defines the data model used across all other crates:
//! - Upload session identity, status and lifecycle
//! - Chunk layout arithmetic and received-chunk tracking
//! - Content hashing for chunks and assembled artifacts
//! - Filename and content-type policy
//! - Wire types shared by the server and the upload client
//! - Configuration types

pub mod chunk;
pub mod config;
pub mod error;
pub mod filename;
pub mod hash;
pub mod upload;

pub use chunk::{ChunkLayout, ReceivedMask};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use upload::{
    ApiEnvelope, ChunkAck, ChunkRecord, InitUploadRequest, InitUploadResponse, UploadId,
    UploadSession, UploadStatus, UploadStatusResponse,
};

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Maximum chunk size: 32 MiB
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Minimum chunk size: 64 KiB
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// Default ceiling for a declared upload size: 2 GiB
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 2 * 1024 * 1024 * 1024;
