//! Shared helpers for client tests.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.
#![allow(dead_code)]

use serde_json::{Value, json};
use std::net::TcpListener;

pub const UPLOAD_ID: &str = "6f1c2a9e-3b4d-4e5f-8a7b-9c0d1e2f3a4b";
pub const ARTIFACT_SHA256: &str =
    "8c1f6e0a1f5b2a3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4";

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Success envelope.
pub fn ok(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

/// Error envelope.
pub fn error(message: &str, code: &str, retryable: bool) -> Value {
    json!({
        "success": false,
        "message": message,
        "code": code,
        "retryable": retryable,
    })
}

pub fn init_data(chunk_size: u64, total_chunks: u64) -> Value {
    ok(json!({
        "upload_id": UPLOAD_ID,
        "chunk_size": chunk_size,
        "total_chunks": total_chunks,
    }))
}

pub fn ack(status: &str, received_count: u64, total_chunks: u64) -> Value {
    ok(json!({
        "status": status,
        "received_count": received_count,
        "total_chunks": total_chunks,
    }))
}

pub fn status_data(status: &str, total_size: u64, chunk_size: u64, missing: &[u64]) -> Value {
    let total_chunks = total_size.div_ceil(chunk_size);
    let mut data = json!({
        "upload_id": UPLOAD_ID,
        "filename": "book.epub",
        "mime_type": "application/epub+zip",
        "status": status,
        "total_size": total_size,
        "chunk_size": chunk_size,
        "total_chunks": total_chunks,
        "received_count": total_chunks - missing.len() as u64,
        "missing_chunks": missing,
        "created_at": "2026-01-01T00:00:00Z",
        "last_activity_at": "2026-01-01T00:05:00Z",
    });
    if status == "completed" {
        data["artifact_sha256"] = json!(ARTIFACT_SHA256);
    }
    if status == "failed" {
        data["error"] = json!("chunk 0 digest mismatch");
    }
    ok(data)
}
