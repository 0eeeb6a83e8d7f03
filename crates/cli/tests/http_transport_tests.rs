mod common;

use common::*;
use httpmock::Method::{DELETE, GET, POST};
use httpmock::MockServer;
use parcel_cli::{
    DriverError, DriverOptions, HttpTransport, TransportError, UploadDriver, UploadTransport,
};
use parcel_core::{InitUploadRequest, UploadId, UploadStatus};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::new(&server.base_url(), Duration::from_secs(5)).unwrap()
}

fn upload_id() -> UploadId {
    UploadId::parse(UPLOAD_ID).unwrap()
}

#[tokio::test]
async fn init_posts_declared_file() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    let init = server.mock(|when, then| {
        when.method(POST)
            .path("/upload/init")
            .json_body(json!({
                "filename": "book.epub",
                "total_size": 2_621_440,
                "mime_type": "application/epub+zip",
                "chunk_size": 1_048_576,
            }));
        then.status(201).json_body(init_data(1_048_576, 3));
    });

    let response = transport(&server)
        .init(&InitUploadRequest {
            filename: "book.epub".to_string(),
            total_size: 2_621_440,
            mime_type: "application/epub+zip".to_string(),
            chunk_size: Some(1_048_576),
        })
        .await
        .unwrap();

    init.assert();
    assert_eq!(response.upload_id, upload_id());
    assert_eq!(response.total_chunks, 3);
}

#[tokio::test]
async fn send_chunk_uses_multipart_fields() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    let chunk = server.mock(|when, then| {
        when.method(POST)
            .path("/upload/chunk")
            .header_exists("content-type")
            .body_contains(UPLOAD_ID)
            .body_contains("name=\"chunk_index\"")
            .body_contains("name=\"chunk\"")
            .body_contains("chunk-payload");
        then.status(200).json_body(ack("in_progress", 1, 3));
    });

    let ack = transport(&server)
        .send_chunk(&upload_id(), 0, bytes::Bytes::from_static(b"chunk-payload"))
        .await
        .unwrap();

    chunk.assert();
    assert_eq!(ack.status, UploadStatus::InProgress);
    assert_eq!(ack.received_count, 1);
}

#[tokio::test]
async fn error_envelopes_map_to_transport_errors() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    let missing = UploadId::new();
    let gone = UploadId::new();
    server.mock(|when, then| {
        when.method(GET).path(format!("/upload/status/{UPLOAD_ID}"));
        then.status(503)
            .json_body(error("storage unavailable", "storage_error", true));
    });
    server.mock(|when, then| {
        when.method(GET).path(format!("/upload/status/{missing}"));
        then.status(404)
            .json_body(error("upload not found", "not_found", false));
    });
    server.mock(|when, then| {
        when.method(GET).path(format!("/upload/status/{gone}"));
        then.status(502).body("bad gateway");
    });

    let transport = transport(&server);

    let err = transport.status(&upload_id()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), Some("storage_error"));

    let err = transport.status(&missing).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(matches!(err, TransportError::Api { status: 404, .. }));

    let err = transport.status(&gone).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), Some("http_error"));
}

#[tokio::test]
async fn unreachable_server_is_retryable() {
    let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
    let err = transport.status(&upload_id()).await.unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn status_and_cancel_round_trip() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(format!("/upload/status/{UPLOAD_ID}"));
        then.status(200)
            .json_body(status_data("in_progress", 2_621_440, 1_048_576, &[1]));
    });
    let cancel = server.mock(|when, then| {
        when.method(DELETE).path(format!("/upload/{UPLOAD_ID}"));
        then.status(200)
            .json_body(ok(json!({ "upload_id": UPLOAD_ID, "removed": true })));
    });

    let transport = transport(&server);
    let status = transport.status(&upload_id()).await.unwrap();
    assert_eq!(status.status, UploadStatus::InProgress);
    assert_eq!(status.missing_chunks, vec![1]);
    assert_eq!(status.received_count, 2);

    transport.cancel(&upload_id()).await.unwrap();
    cancel.assert();
}

#[tokio::test]
async fn driver_uploads_file_over_http() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("book.epub");
    std::fs::write(&path, b"0123456789").unwrap();

    let server = MockServer::start();
    let init = server.mock(|when, then| {
        when.method(POST).path("/upload/init");
        then.status(201).json_body(init_data(4, 3));
    });
    let chunk = server.mock(|when, then| {
        when.method(POST).path("/upload/chunk");
        then.status(200).json_body(ack("in_progress", 1, 3));
    });
    let status = server.mock(|when, then| {
        when.method(GET).path(format!("/upload/status/{UPLOAD_ID}"));
        then.status(200).json_body(status_data("completed", 10, 4, &[]));
    });

    let driver = UploadDriver::new(
        transport(&server),
        DriverOptions {
            retry_backoff: Duration::from_millis(1),
            chunk_size: Some(4),
            ..DriverOptions::default()
        },
    );
    let mut acked = 0;
    let report = driver
        .upload(&path, &CancellationToken::new(), |_| acked += 1)
        .await
        .unwrap();

    init.assert();
    chunk.assert_hits(3);
    status.assert_hits(1);
    assert_eq!(acked, 3);
    assert_eq!(report.upload_id, upload_id());
    assert_eq!(report.artifact_sha256.as_deref(), Some(ARTIFACT_SHA256));
}

#[tokio::test]
async fn driver_gives_up_on_persistent_outage() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("book.epub");
    std::fs::write(&path, b"0123456789").unwrap();

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/upload/init");
        then.status(201).json_body(init_data(4, 3));
    });
    let chunk = server.mock(|when, then| {
        when.method(POST).path("/upload/chunk");
        then.status(503)
            .json_body(error("storage unavailable", "storage_error", true));
    });

    let driver = UploadDriver::new(
        transport(&server),
        DriverOptions {
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            chunk_size: Some(4),
            mime_type: None,
        },
    );
    let err = driver
        .upload(&path, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DriverError::Chunk {
            index: 0,
            attempts: 3,
            ..
        }
    ));
    chunk.assert_hits(3);
}
