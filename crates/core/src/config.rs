//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Upload protocol limits and lifecycle windows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Chunk size handed out when the client does not propose one.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Smallest chunk size a client may propose.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// Largest chunk size a client may propose.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Largest declared file size accepted.
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,
    /// Accepted mime types (empty allows all).
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
    /// Accepted filename extensions (empty allows all).
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// Idle time after which an unfinished session is abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// How long completed and failed sessions are kept before deletion.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
    /// How long an assembly lease is honored before another invocation may
    /// take over reassembly.
    #[serde(default = "default_assembly_lease_secs")]
    pub assembly_lease_secs: u64,
    /// Interval between expiry sweeps (0 disables the sweeper).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Sessions processed per sweep batch.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: u32,
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_min_chunk_size() -> u64 {
    crate::MIN_CHUNK_SIZE
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_max_total_size() -> u64 {
    crate::DEFAULT_MAX_TOTAL_SIZE
}

fn default_stale_after_secs() -> u64 {
    86400 // 24 hours
}

fn default_completed_retention_secs() -> u64 {
    3600
}

fn default_assembly_lease_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_sweep_batch_size() -> u32 {
    100
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_total_size: default_max_total_size(),
            allowed_mime_types: Vec::new(),
            allowed_extensions: Vec::new(),
            stale_after_secs: default_stale_after_secs(),
            completed_retention_secs: default_completed_retention_secs(),
            assembly_lease_secs: default_assembly_lease_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_batch_size: default_sweep_batch_size(),
        }
    }
}

impl UploadConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::seconds(secs_i64(self.stale_after_secs))
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::seconds(secs_i64(self.completed_retention_secs))
    }

    pub fn assembly_lease(&self) -> Duration {
        Duration::seconds(secs_i64(self.assembly_lease_secs))
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_chunk_size == 0 {
            return Err("upload.min_chunk_size must be greater than zero".to_string());
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(format!(
                "upload.min_chunk_size ({}) exceeds upload.max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            ));
        }
        if !(self.min_chunk_size..=self.max_chunk_size).contains(&self.chunk_size) {
            return Err(format!(
                "upload.chunk_size ({}) must be between {} and {}",
                self.chunk_size, self.min_chunk_size, self.max_chunk_size
            ));
        }
        if self.max_total_size == 0 {
            return Err("upload.max_total_size must be greater than zero".to_string());
        }
        if self.sweep_batch_size == 0 {
            return Err("upload.sweep_batch_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// Root configuration for `parceld`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upload protocol configuration.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.upload.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.min_chunk_size, 64 * 1024);
        assert_eq!(config.max_chunk_size, 32 * 1024 * 1024);
        assert!(config.allowed_mime_types.is_empty());
        assert_eq!(config.stale_after(), Duration::hours(24));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = r#"{
            "upload": {"chunk_size": 131072, "allowed_extensions": ["epub"]},
            "storage": {"type": "filesystem", "path": "/srv/parcel"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.upload.chunk_size, 131072);
        assert_eq!(config.upload.allowed_extensions, vec!["epub"]);
        assert_eq!(config.upload.sweep_batch_size, 100);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        let StorageConfig::Filesystem { path } = &config.storage;
        assert_eq!(path, &PathBuf::from("/srv/parcel"));
    }

    #[test]
    fn test_validate_rejects_inconsistent_chunk_bounds() {
        let config = UploadConfig {
            min_chunk_size: 1024,
            max_chunk_size: 512,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UploadConfig {
            chunk_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
