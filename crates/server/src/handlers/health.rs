//! Health probe.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use parcel_core::ApiEnvelope;
use serde::Serialize;
use std::collections::BTreeMap;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage_backend: &'static str,
    /// Session counts keyed by status.
    pub sessions: BTreeMap<String, i64>,
}

/// GET /health - Check registry and storage.
pub async fn health_check(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiEnvelope<HealthResponse>>> {
    state
        .metadata
        .health_check()
        .await
        .map_err(|e| ApiError::Unavailable(format!("metadata store: {e}")))?;
    state
        .storage
        .health_check()
        .await
        .map_err(|e| ApiError::Unavailable(format!("storage: {e}")))?;

    let sessions = state
        .metadata
        .count_sessions_by_status()
        .await
        .map_err(|e| ApiError::Unavailable(format!("metadata store: {e}")))?
        .into_iter()
        .collect();

    Ok(Json(ApiEnvelope::ok(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        storage_backend: state.storage.backend_name(),
        sessions,
    })))
}
