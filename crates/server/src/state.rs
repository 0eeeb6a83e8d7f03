//! Application state shared across handlers.

use crate::coordinator::UploadCoordinator;
use parcel_core::config::AppConfig;
use parcel_metadata::MetadataStore;
use parcel_storage::{ChunkStore, ObjectStore};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object store holding chunk and artifact blobs.
    pub storage: Arc<dyn ObjectStore>,
    /// Upload session registry.
    pub metadata: Arc<dyn MetadataStore>,
    /// Upload protocol operations.
    pub coordinator: UploadCoordinator,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let coordinator = UploadCoordinator::new(
            metadata.clone(),
            ChunkStore::new(storage.clone()),
            config.upload.clone(),
        );
        Self {
            config: Arc::new(config),
            storage,
            metadata,
            coordinator,
        }
    }
}
