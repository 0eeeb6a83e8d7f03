//! Server test utilities.

use super::fixtures::{BOUNDARY, multipart_chunk};
use super::storage::FlakyStore;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use parcel_core::config::{AppConfig, MetadataConfig, StorageConfig, UploadConfig};
use parcel_core::{ChunkRecord, UploadId};
use parcel_metadata::{MetadataStore, SqliteStore, UploadChunkRow};
use parcel_server::{AppState, create_router};
use parcel_storage::{ChunkStore, FilesystemBackend, ObjectStore};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    /// Fault-injecting wrapper around the filesystem backend.
    pub store: Arc<FlakyStore>,
    /// Root directory of the filesystem backend.
    pub storage_root: PathBuf,
    _temp_dir: TempDir,
}

/// A decoded JSON response.
#[allow(dead_code)]
#[derive(Debug)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub body: Value,
}

#[allow(dead_code)]
impl JsonResponse {
    /// The `data` member of a success envelope.
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    /// The `code` member of an error envelope.
    pub fn code(&self) -> &str {
        self.body["code"].as_str().unwrap_or_default()
    }
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Test-friendly upload limits: small chunks are allowed.
    pub fn test_upload_config() -> UploadConfig {
        UploadConfig {
            min_chunk_size: 1,
            ..UploadConfig::default()
        }
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_root = temp_dir.path().join("storage");
        let backend: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_root)
                .await
                .expect("Failed to create storage backend"),
        );
        let store = Arc::new(FlakyStore::new(backend));

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig {
            upload: Self::test_upload_config(),
            storage: StorageConfig::Filesystem {
                path: storage_root.clone(),
            },
            metadata: MetadataConfig::Sqlite { path: db_path },
            ..AppConfig::default()
        };
        modifier(&mut config);

        parcel_server::metrics::register_metrics();
        let state = AppState::new(config, store.clone(), metadata);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            store,
            storage_root,
            _temp_dir: temp_dir,
        }
    }

    /// Send a request through the router.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read response body");
        (status, headers, body)
    }

    async fn send_json(&self, request: Request<Body>) -> JsonResponse {
        let (status, _, body) = self.send(request).await;
        let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
        JsonResponse { status, body }
    }

    /// POST /upload/init with an arbitrary JSON body.
    pub async fn init_raw(&self, body: Value) -> JsonResponse {
        let request = Request::builder()
            .method("POST")
            .uri("/upload/init")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send_json(request).await
    }

    /// Create a session with an explicit chunk size. Returns the upload ID.
    pub async fn init(&self, filename: &str, total_size: usize, chunk_size: usize) -> String {
        let response = self
            .init_raw(json!({
                "filename": filename,
                "total_size": total_size,
                "mime_type": "application/octet-stream",
                "chunk_size": chunk_size,
            }))
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{:?}", response.body);
        response.data()["upload_id"]
            .as_str()
            .expect("upload_id in response")
            .to_string()
    }

    /// POST /upload/chunk with a prebuilt multipart body.
    pub async fn chunk_raw(&self, body: Vec<u8>) -> JsonResponse {
        let request = Request::builder()
            .method("POST")
            .uri("/upload/chunk")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        self.send_json(request).await
    }

    /// Deliver one chunk.
    pub async fn chunk(&self, upload_id: &str, index: u64, data: &[u8]) -> JsonResponse {
        self.chunk_raw(multipart_chunk(
            Some(upload_id),
            Some(&index.to_string()),
            Some(data),
        ))
        .await
    }

    /// Deliver every chunk in order, returning the last response.
    pub async fn upload_all(&self, upload_id: &str, chunks: &[Bytes]) -> JsonResponse {
        let mut last = None;
        for (index, chunk) in (0u64..).zip(chunks) {
            let response = self.chunk(upload_id, index, chunk).await;
            assert_eq!(response.status, StatusCode::OK, "{:?}", response.body);
            last = Some(response);
        }
        last.expect("at least one chunk")
    }

    /// GET /upload/status/{id}.
    pub async fn status(&self, upload_id: &str) -> JsonResponse {
        let request = Request::builder()
            .uri(format!("/upload/status/{upload_id}"))
            .body(Body::empty())
            .unwrap();
        self.send_json(request).await
    }

    /// DELETE /upload/{id}.
    pub async fn cancel(&self, upload_id: &str) -> JsonResponse {
        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/upload/{upload_id}"))
            .body(Body::empty())
            .unwrap();
        self.send_json(request).await
    }

    /// GET /upload/artifact/{id}.
    pub async fn artifact(&self, upload_id: &str) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder()
            .uri(format!("/upload/artifact/{upload_id}"))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// GET an arbitrary path.
    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    /// Filesystem path of a stored chunk blob.
    pub fn chunk_path(&self, upload_id: &str, index: u64) -> PathBuf {
        self.storage_root
            .join("uploads")
            .join(upload_id)
            .join("chunks")
            .join(format!("{index:010}"))
    }

    /// Every blob key stored for a session.
    pub async fn session_blobs(&self, upload_id: &str) -> Vec<String> {
        self.state
            .storage
            .list(&format!("uploads/{upload_id}"))
            .await
            .unwrap_or_default()
    }

    /// Store and record a chunk the way a delivery does, stopping before the
    /// assembly hand-off.
    pub async fn record_chunk(&self, upload_id: &str, index: u64, data: &Bytes) {
        let id = UploadId::parse(upload_id).unwrap();
        ChunkStore::new(self.state.storage.clone())
            .put_chunk(&id, index, data.clone())
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();
        let record = ChunkRecord::describe(index, data, now);
        let row = UploadChunkRow::from_record(&id, &record).unwrap();
        self.state
            .metadata
            .mark_chunk_received(&row, now)
            .await
            .unwrap();
    }
}
