//! HTTP transport for the upload protocol.

use crate::driver::{TransportError, UploadTransport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parcel_core::{
    ApiEnvelope, ChunkAck, InitUploadRequest, InitUploadResponse, UploadId, UploadStatusResponse,
};
use reqwest::Url;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// [`UploadTransport`] over the server's JSON/multipart API.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    /// Server base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Decode(format!("failed to build API URL: {e}")))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = req
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let envelope = match serde_json::from_slice::<ApiEnvelope<T>>(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(TransportError::Decode(e.to_string()));
            }
            // Proxies and crashed servers answer without an envelope.
            Err(_) => {
                return Err(TransportError::Api {
                    status: status.as_u16(),
                    code: "http_error".to_string(),
                    message: String::from_utf8_lossy(&body).trim().to_string(),
                    retryable: status.is_server_error(),
                });
            }
        };

        if !status.is_success() || !envelope.success {
            return Err(TransportError::Api {
                status: status.as_u16(),
                code: envelope.code.unwrap_or_else(|| "unknown".to_string()),
                message: envelope.message.unwrap_or_default(),
                retryable: envelope.retryable,
            });
        }
        envelope
            .data
            .ok_or_else(|| TransportError::Decode("response has no data".to_string()))
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransportError> {
        let url = self.url("/upload/init")?;
        self.send(self.http.post(url).json(req)).await
    }

    async fn send_chunk(
        &self,
        upload_id: &UploadId,
        index: u64,
        data: Bytes,
    ) -> Result<ChunkAck, TransportError> {
        let url = self.url("/upload/chunk")?;
        let form = Form::new()
            .text("upload_id", upload_id.to_string())
            .text("chunk_index", index.to_string())
            .part("chunk", Part::bytes(data.to_vec()).file_name("chunk"));
        self.send(self.http.post(url).multipart(form)).await
    }

    async fn status(&self, upload_id: &UploadId) -> Result<UploadStatusResponse, TransportError> {
        let url = self.url(&format!("/upload/status/{upload_id}"))?;
        self.send(self.http.get(url)).await
    }

    async fn cancel(&self, upload_id: &UploadId) -> Result<(), TransportError> {
        let url = self.url(&format!("/upload/{upload_id}"))?;
        self.send::<serde_json::Value>(self.http.delete(url))
            .await
            .map(|_| ())
    }
}
