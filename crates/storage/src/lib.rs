//! Object storage abstraction and chunk storage for Parcel.
//!
//! This crate provides:
//! - The `ObjectStore` trait with atomic and create-if-absent writes
//! - A local filesystem backend
//! - `ChunkStore`, which keys chunk blobs by session and position and holds
//!   assembled artifacts

pub mod backends;
pub mod chunks;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use chunks::{ChunkStore, PutOutcome};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};

use parcel_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            if path.as_os_str().is_empty() {
                return Err(StorageError::Config(
                    "filesystem storage path must not be empty".to_string(),
                ));
            }
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
