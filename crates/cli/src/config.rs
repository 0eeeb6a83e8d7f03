//! Client configuration.

use crate::driver::DriverOptions;
use anyhow::Result;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for `parcelctl`, loaded from `client.toml` and `PARCEL_CLIENT_*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server base URL.
    pub server: String,
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Per-request timeout, in seconds.
    pub request_timeout_secs: u64,
    /// Chunk size to propose; the server default applies when unset.
    pub chunk_size: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8080".to_string(),
            max_retries: 5,
            retry_backoff_ms: 500,
            request_timeout_secs: 60,
            chunk_size: None,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Driver options derived from this config.
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            chunk_size: self.chunk_size,
            mime_type: None,
        }
    }
}

/// Resolve the config path: explicit flag, `PARCEL_CLIENT_CONFIG`, then
/// `$XDG_CONFIG_HOME/parcel/client.toml` or `~/.config/parcel/client.toml`.
pub fn client_config_path(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(path));
    }

    if let Some(path) = std::env::var_os("PARCEL_CLIENT_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(path) => PathBuf::from(path),
        None => {
            let home = std::env::var_os("HOME")
                .ok_or_else(|| anyhow::anyhow!("HOME not set; set PARCEL_CLIENT_CONFIG"))?;
            PathBuf::from(home).join(".config")
        }
    };

    Ok(base.join("parcel").join("client.toml"))
}

/// Load the client config. A missing file yields the defaults plus any
/// environment overrides.
pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("PARCEL_CLIENT_").ignore(&["CONFIG"]));

    figment
        .extract()
        .map_err(|err| anyhow::anyhow!(err).context("failed to load client configuration"))
}
