//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::UploadRepo;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UploadRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

const MAX_CONNECTIONS: u32 = 4;

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // WAL lets readers run beside the single writer. Per-session merges
        // rely on each transaction's first statement taking the write lock.
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite metadata store");

        Ok(store)
    }

}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::ChunkReceipt;
    use time::OffsetDateTime;
    use uuid::Uuid;

    const ACTIVE_STATUSES: &str = "('pending', 'in_progress', 'assembling')";
    const RETAINED_STATUSES: &str = "('completed', 'failed')";

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    upload_id, filename, mime_type, total_size, chunk_size,
                    total_chunks, received_count, status, artifact_key,
                    artifact_sha256, error_detail, assembly_started_at,
                    created_at, last_activity_at
                ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.upload_id)
            .bind(&session.filename)
            .bind(&session.mime_type)
            .bind(session.total_size)
            .bind(session.chunk_size)
            .bind(session.total_chunks)
            .bind(&session.status)
            .bind(&session.artifact_key)
            .bind(&session.artifact_sha256)
            .bind(&session.error_detail)
            .bind(session.assembly_started_at)
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) => {
                    let unique =
                        matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
                    if unique {
                        Err(MetadataError::AlreadyExists(format!(
                            "upload_id {} already exists",
                            session.upload_id
                        )))
                    } else {
                        Err(MetadataError::Database(e))
                    }
                }
            }
        }

        async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_received_chunks(
            &self,
            upload_id: Uuid,
        ) -> MetadataResult<Vec<UploadChunkRow>> {
            let rows = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE upload_id = ? ORDER BY chunk_index",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_chunk(
            &self,
            upload_id: Uuid,
            chunk_index: i64,
        ) -> MetadataResult<Option<UploadChunkRow>> {
            let row = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE upload_id = ? AND chunk_index = ?",
            )
            .bind(upload_id)
            .bind(chunk_index)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn mark_chunk_received(
            &self,
            chunk: &UploadChunkRow,
            now: OffsetDateTime,
        ) -> MetadataResult<ChunkReceipt> {
            let mut tx = self.pool.begin().await?;

            // Writing first takes SQLite's write lock for the whole
            // transaction, so concurrent deliveries for a session serialize.
            let touched = sqlx::query(&format!(
                "UPDATE upload_sessions SET last_activity_at = ? \
                 WHERE upload_id = ? AND status IN {ACTIVE_STATUSES}"
            ))
            .bind(now)
            .bind(chunk.upload_id)
            .execute(&mut *tx)
            .await?;

            if touched.rows_affected() == 0 {
                let status: Option<String> =
                    sqlx::query_scalar("SELECT status FROM upload_sessions WHERE upload_id = ?")
                        .bind(chunk.upload_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                tx.rollback().await?;
                return Err(match status {
                    None => MetadataError::NotFound(format!("upload {}", chunk.upload_id)),
                    Some(from) => MetadataError::InvalidStateTransition {
                        from,
                        to: "in_progress".to_string(),
                    },
                });
            }

            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO upload_chunks (
                    upload_id, chunk_index, size_bytes, sha256, received_at
                )
                SELECT ?1, ?2, ?3, ?4, ?5
                FROM upload_sessions
                WHERE upload_id = ?1 AND ?2 >= 0 AND ?2 < total_chunks
                "#,
            )
            .bind(chunk.upload_id)
            .bind(chunk.chunk_index)
            .bind(chunk.size_bytes)
            .bind(&chunk.sha256)
            .bind(chunk.received_at)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;

            if !inserted {
                let existing = sqlx::query_as::<_, UploadChunkRow>(
                    "SELECT * FROM upload_chunks WHERE upload_id = ? AND chunk_index = ?",
                )
                .bind(chunk.upload_id)
                .bind(chunk.chunk_index)
                .fetch_optional(&mut *tx)
                .await?;

                match existing {
                    None => {
                        tx.rollback().await?;
                        return Err(MetadataError::Constraint(format!(
                            "chunk index {} out of range for upload {}",
                            chunk.chunk_index, chunk.upload_id
                        )));
                    }
                    Some(row) if row.sha256 != chunk.sha256 || row.size_bytes != chunk.size_bytes => {
                        tx.rollback().await?;
                        return Err(MetadataError::Conflict(format!(
                            "chunk {} of upload {} already recorded with digest {}",
                            chunk.chunk_index, chunk.upload_id, row.sha256
                        )));
                    }
                    Some(_) => {}
                }
            }

            sqlx::query(
                r#"
                UPDATE upload_sessions SET
                    received_count = (SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?1),
                    status = CASE WHEN status = 'pending' THEN 'in_progress' ELSE status END
                WHERE upload_id = ?1
                "#,
            )
            .bind(chunk.upload_id)
            .execute(&mut *tx)
            .await?;

            let session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(chunk.upload_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(ChunkReceipt {
                newly_received: inserted,
                session,
            })
        }

        async fn begin_assembly(
            &self,
            upload_id: Uuid,
            now: OffsetDateTime,
            lease_cutoff: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET status = 'assembling', assembly_started_at = ?1, last_activity_at = ?1
                WHERE upload_id = ?2
                  AND received_count = total_chunks
                  AND (
                    status IN ('pending', 'in_progress')
                    OR (status = 'assembling'
                        AND (assembly_started_at IS NULL
                             OR julianday(assembly_started_at) < julianday(?3)))
                  )
                "#,
            )
            .bind(now)
            .bind(upload_id)
            .bind(lease_cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn release_assembly(&self, upload_id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE upload_sessions SET assembly_started_at = NULL \
                 WHERE upload_id = ? AND status = 'assembling'",
            )
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn complete_session(
            &self,
            upload_id: Uuid,
            artifact_key: &str,
            artifact_sha256: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET status = 'completed', artifact_key = ?, artifact_sha256 = ?,
                    assembly_started_at = NULL, last_activity_at = ?
                WHERE upload_id = ? AND status = 'assembling'
                "#,
            )
            .bind(artifact_key)
            .bind(artifact_sha256)
            .bind(now)
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn fail_session(
            &self,
            upload_id: Uuid,
            error_detail: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET status = 'failed', error_detail = ?,
                    assembly_started_at = NULL, last_activity_at = ?
                WHERE upload_id = ? AND status = 'assembling'
                "#,
            )
            .bind(error_detail)
            .bind(now)
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_stale_sessions(
            &self,
            active_cutoff: OffsetDateTime,
            terminal_cutoff: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(&format!(
                "SELECT * FROM upload_sessions \
                 WHERE status = 'expired' \
                    OR (status IN {ACTIVE_STATUSES} AND julianday(last_activity_at) < julianday(?1)) \
                    OR (status IN {RETAINED_STATUSES} AND julianday(last_activity_at) < julianday(?2)) \
                 ORDER BY julianday(last_activity_at) ASC LIMIT ?3"
            ))
            .bind(active_cutoff)
            .bind(terminal_cutoff)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn expire_session(
            &self,
            upload_id: Uuid,
            active_cutoff: OffsetDateTime,
            terminal_cutoff: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(&format!(
                "UPDATE upload_sessions SET status = 'expired', assembly_started_at = NULL \
                 WHERE upload_id = ?3 AND ( \
                    status = 'expired' \
                    OR (status IN {ACTIVE_STATUSES} AND julianday(last_activity_at) < julianday(?1)) \
                    OR (status IN {RETAINED_STATUSES} AND julianday(last_activity_at) < julianday(?2)))"
            ))
            .bind(active_cutoff)
            .bind(terminal_cutoff)
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        }

        async fn count_sessions_by_status(&self) -> MetadataResult<Vec<(String, i64)>> {
            let rows = sqlx::query_as::<_, (String, i64)>(
                "SELECT status, COUNT(*) FROM upload_sessions GROUP BY status ORDER BY status",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id BLOB PRIMARY KEY,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    total_size INTEGER NOT NULL CHECK (total_size > 0),
    chunk_size INTEGER NOT NULL CHECK (chunk_size > 0),
    total_chunks INTEGER NOT NULL CHECK (total_chunks > 0),
    received_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    artifact_key TEXT,
    artifact_sha256 TEXT,
    error_detail TEXT,
    assembly_started_at TEXT,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_activity
    ON upload_sessions(status, julianday(last_activity_at));

-- Chunks durably stored per session, keyed by position
CREATE TABLE IF NOT EXISTS upload_chunks (
    upload_id BLOB NOT NULL REFERENCES upload_sessions(upload_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL CHECK (chunk_index >= 0),
    size_bytes INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (upload_id, chunk_index)
);
"#;
