//! Typed CRUD over `sessions` and `files`, the two tables the chest engine
//! is built on. All queries filter `is_deleted = 0`; all mutations stamp
//! `updated_at = now`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub retrieval_code: Option<String>,
    pub upload_complete: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl SessionRow {
    pub fn session_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.id).map_err(|_| Error::Internal {
            msg: format!("corrupt session id in store: {}", self.id),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub id: String,
    pub session_id: String,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: i64,
    pub file_extension: String,
    pub is_text: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl FileRow {
    pub fn file_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.id).map_err(|_| Error::Internal {
            msg: format!("corrupt file id in store: {}", self.id),
        })
    }

    pub fn session_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.session_id).map_err(|_| Error::Internal {
            msg: format!("corrupt session id in store: {}", self.session_id),
        })
    }
}

/// A file row to batch-insert for the small-file upload path.
pub struct NewFile {
    pub id: Uuid,
    pub session_id: Uuid,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: i64,
    pub file_extension: String,
    pub is_text: bool,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::Sqlite;
        use sqlx::migrate::MigrateDatabase;

        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::create_database(database_url)
                .await
                .map_err(|e| Error::Internal {
                    msg: format!("failed to create sqlite database: {e}"),
                })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn insert_session(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (id, retrieval_code, upload_complete, expires_at, created_at, updated_at, is_deleted)
             VALUES (?, NULL, 0, NULL, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_open_session(&self, id: Uuid) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, retrieval_code, upload_complete, expires_at, created_at, updated_at, is_deleted
             FROM sessions
             WHERE id = ? AND upload_complete = 0 AND is_deleted = 0",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, retrieval_code, upload_complete, expires_at, created_at, updated_at, is_deleted
             FROM sessions
             WHERE id = ? AND is_deleted = 0",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_sealed_by_code(&self, code: &str, now: DateTime<Utc>) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, retrieval_code, upload_complete, expires_at, created_at, updated_at, is_deleted
             FROM sessions
             WHERE retrieval_code = ? AND upload_complete = 1 AND is_deleted = 0
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn retrieval_code_exists(&self, code: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM sessions WHERE retrieval_code = ? AND is_deleted = 0 LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Conditional seal: succeeds only while `upload_complete = 0 AND is_deleted = 0`.
    /// Returns `false` (zero rows affected) when the session is missing or already sealed.
    pub async fn mark_sealed(
        &self,
        id: Uuid,
        retrieval_code: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions
             SET retrieval_code = ?, upload_complete = 1, expires_at = ?, updated_at = ?
             WHERE id = ? AND upload_complete = 0 AND is_deleted = 0",
        )
        .bind(retrieval_code)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_files(&self, files: &[NewFile]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for file in files {
            sqlx::query(
                "INSERT INTO files (id, session_id, original_filename, mime_type, file_size, file_extension, is_text, created_at, updated_at, is_deleted)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(file.id.to_string())
            .bind(file.session_id.to_string())
            .bind(&file.original_filename)
            .bind(&file.mime_type)
            .bind(file.file_size)
            .bind(&file.file_extension)
            .bind(file.is_text)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_file(&self, file: &NewFile) -> Result<()> {
        self.insert_files(std::slice::from_ref(file)).await
    }

    pub async fn list_session_files(&self, session_id: Uuid) -> Result<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT id, session_id, original_filename, mime_type, file_size, file_extension, is_text, created_at, updated_at, is_deleted
             FROM files
             WHERE session_id = ? AND is_deleted = 0
             ORDER BY created_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_session_files(&self, session_id: Uuid) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM files WHERE session_id = ? AND is_deleted = 0",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Joins `file` to its session and applies the non-expired filter the
    /// download path needs.
    pub async fn get_downloadable_file(
        &self,
        file_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT f.id, f.session_id, f.original_filename, f.mime_type, f.file_size, f.file_extension, f.is_text, f.created_at, f.updated_at, f.is_deleted
             FROM files f
             JOIN sessions s ON s.id = f.session_id
             WHERE f.id = ? AND f.is_deleted = 0 AND s.is_deleted = 0
               AND (s.expires_at IS NULL OR s.expires_at > ?)",
        )
        .bind(file_id.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn soft_delete_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET is_deleted = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn soft_delete_files(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE files SET is_deleted = 1, updated_at = ? WHERE session_id = ? AND is_deleted = 0")
            .bind(Utc::now())
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sealed, non-permanent sessions whose `expires_at` has passed.
    pub async fn select_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, retrieval_code, upload_complete, expires_at, created_at, updated_at, is_deleted
             FROM sessions
             WHERE upload_complete = 1 AND is_deleted = 0 AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Open (never sealed) sessions created before `cutoff`.
    pub async fn select_abandoned_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, retrieval_code, upload_complete, expires_at, created_at, updated_at, is_deleted
             FROM sessions
             WHERE upload_complete = 0 AND is_deleted = 0 AND created_at <= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
