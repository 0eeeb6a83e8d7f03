//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Piece size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Marker embedded in in-flight temp file names.
const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`, creating it if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the root.
    ///
    /// Canonicalization touches the filesystem, so it runs on the blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Reject keys that would escape the root lexically or through symlinks.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "key must be a relative path: {key:?}"
            )));
        }
        if !Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize()?;

        // The deepest existing ancestor (or the path itself) must resolve
        // inside the root, so a symlinked directory cannot redirect writes.
        let mut probe = Some(path.as_path());
        while let Some(candidate) = probe {
            match std::fs::symlink_metadata(candidate) {
                Ok(meta) => {
                    let canonical = candidate.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    probe = candidate.parent();
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }

        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Sibling temp path, unique per writer.
    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.with_file_name(format!("{name}{TEMP_MARKER}{}", Uuid::new_v4()))
    }

    /// Write `data` to a fresh temp file next to `path` and fsync it.
    async fn write_temp(path: &Path, data: &[u8]) -> StorageResult<PathBuf> {
        let temp_path = Self::temp_path(path);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(temp_path)
    }

    /// Relative keys of every regular file under `base`.
    async fn walk(&self, base: PathBuf) -> StorageResult<Vec<String>> {
        let mut results = Vec::new();
        match fs::symlink_metadata(&base).await {
            Ok(meta) if meta.is_file() => {
                if let Ok(rel) = base.strip_prefix(&self.root) {
                    results.push(key_from_path(rel));
                }
                return Ok(results);
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(results),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks; symlinks are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && !entry.file_name().to_string_lossy().contains(TEMP_MARKER)
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    results.push(key_from_path(rel));
                }
            }
        }
        results.sort();
        Ok(results)
    }
}

fn key_from_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        let temp_path = Self::write_temp(&path, &data).await?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        self.ensure_parent(&path).await?;
        let temp_path = Self::write_temp(&path, &data).await?;

        // link(2) refuses to replace an existing entry, so exactly one racing
        // writer publishes its bytes.
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        let temp_path = Self::temp_path(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64> {
        let base = self.key_path(prefix).await?;
        let removed = self.walk(base.clone()).await?.len() as u64;
        let result = match fs::symlink_metadata(&base).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&base).await,
            Ok(_) => fs::remove_file(&base).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(removed),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.key_path(prefix).await?;
        self.walk(base).await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let FilesystemUpload {
            file,
            temp_path,
            final_path,
            bytes_written,
        } = *self;
        let published = async {
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &final_path).await
        }
        .await;
        if let Err(e) = published {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::sync::Arc;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("store")).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, backend) = backend().await;
        let data = Bytes::from("hello world");

        backend.put("test/object", data.clone()).await.unwrap();
        assert!(backend.exists("test/object").await.unwrap());
        assert_eq!(backend.get("test/object").await.unwrap(), data);
        assert_eq!(backend.head("test/object").await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_dir, backend) = backend().await;
        assert!(matches!(
            backend.get("nope").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.delete("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_if_not_exists_keeps_first_writer() {
        let (_dir, backend) = backend().await;

        assert!(
            backend
                .put_if_not_exists("a/unique", Bytes::from("first"))
                .await
                .unwrap()
        );
        assert!(
            !backend
                .put_if_not_exists("a/unique", Bytes::from("second"))
                .await
                .unwrap()
        );
        assert_eq!(backend.get("a/unique").await.unwrap(), "first");
        // No temp files left behind.
        assert_eq!(backend.list("a").await.unwrap(), vec!["a/unique"]);
    }

    #[tokio::test]
    async fn test_put_if_not_exists_single_winner_under_race() {
        let (_dir, backend) = backend().await;
        let backend = Arc::new(backend);

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .put_if_not_exists("race/key", Bytes::from(vec![i; 32]))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let stored = backend.get("race/key").await.unwrap();
        assert!(stored.iter().all(|b| *b == stored[0]));
    }

    #[tokio::test]
    async fn test_streaming_upload_visible_only_after_finish() {
        let (_dir, backend) = backend().await;

        let mut upload = backend.put_stream("out/artifact").await.unwrap();
        upload.write(Bytes::from("abc")).await.unwrap();
        upload.write(Bytes::from("def")).await.unwrap();
        assert_eq!(upload.bytes_written(), 6);
        assert!(!backend.exists("out/artifact").await.unwrap());
        assert_eq!(upload.finish().await.unwrap(), 6);

        let streamed: Vec<Bytes> = backend
            .get_stream("out/artifact")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(streamed.concat(), b"abcdef");
    }

    #[tokio::test]
    async fn test_streaming_upload_abort_leaves_nothing() {
        let (_dir, backend) = backend().await;

        let mut upload = backend.put_stream("out/partial").await.unwrap();
        upload.write(Bytes::from("abc")).await.unwrap();
        upload.abort().await.unwrap();

        assert!(!backend.exists("out/partial").await.unwrap());
        assert!(backend.list("out").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let (_dir, backend) = backend().await;
        for key in ["s/1/a", "s/1/b/c", "s/2/a"] {
            backend.put(key, Bytes::from("x")).await.unwrap();
        }

        assert_eq!(backend.delete_prefix("s/1").await.unwrap(), 2);
        assert_eq!(backend.list("s").await.unwrap(), vec!["s/2/a"]);
        assert_eq!(backend.delete_prefix("s/1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, backend) = backend().await;

        assert!(backend.exists("../escape").await.is_err());
        assert!(backend.exists("/absolute/path").await.is_err());
        assert!(backend.exists("foo/../bar").await.is_err());
        assert!(backend.exists("").await.is_err());
        assert!(backend.exists("valid/nested/key").await.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_traversal_rejected() {
        use std::os::unix::fs::symlink;

        let (dir, backend) = backend().await;
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), "secret").unwrap();
        symlink(&outside, backend.root().join("escape")).unwrap();

        let result = backend.get("escape/secret.txt").await;
        assert!(
            matches!(result, Err(StorageError::InvalidKey(ref msg)) if msg.contains("escapes storage root")),
            "unexpected result: {result:?}"
        );

        let result = backend.put("escape/nested/file", Bytes::from("x")).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(!outside.join("nested").exists());
    }
}
