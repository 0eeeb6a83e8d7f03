//! Prometheus metrics for the Parcel server.
//!
//! Exposes counters for session lifecycle and chunk traffic plus timing
//! histograms for chunk acceptance and reassembly. The `/metrics` endpoint is
//! unauthenticated and should be reachable by the scraper only.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Session lifecycle
pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_upload_sessions_completed_total",
        "Total number of upload sessions reassembled successfully",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_upload_sessions_failed_total",
        "Total number of upload sessions whose reassembly found corrupt data",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_upload_sessions_expired_total",
        "Total number of upload sessions removed by the expiry sweep",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_CANCELLED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_upload_sessions_cancelled_total",
        "Total number of upload sessions cancelled or released by clients",
    )
    .expect("metric creation failed")
});

// Chunk traffic
pub static CHUNKS_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_chunks_accepted_total",
        "Total number of chunks stored for the first time",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DUPLICATE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_chunks_duplicate_total",
        "Total number of byte-identical chunk redeliveries",
    )
    .expect("metric creation failed")
});

pub static CHUNK_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_chunk_conflicts_total",
        "Total number of chunk deliveries rejected for differing content",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_bytes_received_total",
        "Total chunk bytes stored (first deliveries only)",
    )
    .expect("metric creation failed")
});

// Timing
pub static CHUNK_ACCEPT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "parcel_chunk_accept_duration_seconds",
            "Time taken to accept a single chunk",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static REASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "parcel_reassembly_duration_seconds",
            "Time taken to concatenate and verify an artifact",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Errors
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "parcel_upload_errors_total",
            "Total upload errors by error code",
        ),
        &["error_type"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests can build many routers in one process.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_COMPLETED.clone()),
            Box::new(UPLOAD_SESSIONS_FAILED.clone()),
            Box::new(UPLOAD_SESSIONS_EXPIRED.clone()),
            Box::new(UPLOAD_SESSIONS_CANCELLED.clone()),
            Box::new(CHUNKS_ACCEPTED.clone()),
            Box::new(CHUNKS_DUPLICATE.clone()),
            Box::new(CHUNK_CONFLICTS.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(CHUNK_ACCEPT_DURATION.clone()),
            Box::new(REASSEMBLY_DURATION.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to record upload errors by code.
pub fn record_upload_error(error_type: &str) {
    UPLOAD_ERRORS.with_label_values(&[error_type]).inc();
}
