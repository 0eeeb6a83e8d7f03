//! Upload protocol handlers.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use parcel_core::{
    ApiEnvelope, ChunkAck, InitUploadRequest, InitUploadResponse, UploadId, UploadStatusResponse,
};
use serde::Serialize;

/// Header carrying the artifact's SHA-256 on downloads.
pub const ARTIFACT_SHA256_HEADER: &str = "x-parcel-sha256";

/// Response body for a removed session.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub upload_id: UploadId,
    pub removed: bool,
}

fn parse_upload_id(raw: &str) -> ApiResult<UploadId> {
    UploadId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// POST /upload/init - Create an upload session.
#[tracing::instrument(skip(state, payload))]
pub async fn init_upload(
    State(state): State<AppState>,
    payload: Result<Json<InitUploadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiEnvelope<InitUploadResponse>>)> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let session = state.coordinator.create_session(&req).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok(InitUploadResponse {
            upload_id: session.id,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
        })),
    ))
}

/// Fields of a chunk delivery.
#[derive(Default)]
struct ChunkForm {
    upload_id: Option<String>,
    chunk_index: Option<String>,
    chunk: Option<Bytes>,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
        {
            let name = field.name().map(str::to_owned);
            let read_err = |e: axum::extract::multipart::MultipartError| {
                ApiError::BadRequest(format!("failed to read field: {e}"))
            };
            match name.as_deref() {
                Some("upload_id") => form.upload_id = Some(field.text().await.map_err(read_err)?),
                Some("chunk_index") => {
                    form.chunk_index = Some(field.text().await.map_err(read_err)?)
                }
                Some("chunk") => form.chunk = Some(field.bytes().await.map_err(read_err)?),
                other => tracing::debug!(field = ?other, "ignoring unknown multipart field"),
            }
        }
        Ok(form)
    }

    fn into_parts(self) -> ApiResult<(UploadId, u64, Bytes)> {
        let upload_id = self
            .upload_id
            .ok_or_else(|| ApiError::BadRequest("missing field: upload_id".to_string()))?;
        let chunk_index = self
            .chunk_index
            .ok_or_else(|| ApiError::BadRequest("missing field: chunk_index".to_string()))?;
        let chunk = self
            .chunk
            .ok_or_else(|| ApiError::BadRequest("missing field: chunk".to_string()))?;

        let index = chunk_index.trim().parse::<u64>().map_err(|e| {
            ApiError::BadRequest(format!("invalid chunk_index {chunk_index:?}: {e}"))
        })?;
        Ok((parse_upload_id(&upload_id)?, index, chunk))
    }
}

/// POST /upload/chunk - Deliver one chunk as multipart/form-data.
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ApiEnvelope<ChunkAck>>> {
    let multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let (upload_id, index, chunk) = ChunkForm::read(multipart).await?.into_parts()?;

    let ack = state
        .coordinator
        .accept_chunk(&upload_id, index, chunk)
        .await?;
    Ok(Json(ApiEnvelope::ok(ack)))
}

/// GET /upload/status/{upload_id} - Session snapshot.
#[tracing::instrument(skip(state))]
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<ApiEnvelope<UploadStatusResponse>>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let session = state.coordinator.get_status(&upload_id).await?;
    Ok(Json(ApiEnvelope::ok(session.to_status_response())))
}

/// DELETE /upload/{upload_id} - Cancel a session or release its artifact.
#[tracing::instrument(skip(state))]
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<ApiEnvelope<CancelResponse>>> {
    let upload_id = parse_upload_id(&upload_id)?;
    state.coordinator.cancel(&upload_id).await?;
    Ok(Json(ApiEnvelope::ok(CancelResponse {
        upload_id,
        removed: true,
    })))
}

/// GET /upload/artifact/{upload_id} - Stream the assembled file.
#[tracing::instrument(skip(state))]
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Response> {
    let upload_id = parse_upload_id(&upload_id)?;
    let (session, stream) = state.coordinator.open_artifact(&upload_id).await?;

    let content_type = HeaderValue::from_str(&session.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    // Sanitized names carry no quotes or control characters.
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        session.filename
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    let digest = session.artifact_sha256.map(|h| h.to_hex()).unwrap_or_default();

    let stream = stream.map_err(move |e| {
        tracing::error!(upload_id = %upload_id, error = %e, "artifact streaming failed mid-transfer");
        std::io::Error::other(e.to_string())
    });

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, content_type),
            (CONTENT_DISPOSITION, disposition),
            (
                CONTENT_LENGTH,
                HeaderValue::from(session.total_size),
            ),
        ],
        [(ARTIFACT_SHA256_HEADER, digest)],
        Body::from_stream(stream),
    )
        .into_response())
}
