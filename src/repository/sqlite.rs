//! SQLite implementation of the metadata store.
//!
//! One connection guarded by a mutex; every operation hops to the
//! blocking pool so the async workers never stall on database I/O.
//! Timestamps are stored as RFC 3339 text, the status as its string
//! form.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    DocumentUpsert, ExtractionMetadata, ExtractionStats, MetadataStore, RepoError, RepoResult,
};
use crate::models::{DocumentRow, DocumentStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    id                TEXT PRIMARY KEY,
    source_url        TEXT NOT NULL DEFAULT '',
    crawl_id          TEXT NOT NULL DEFAULT '',
    original_filename TEXT NOT NULL DEFAULT 'unknown.docx',
    file_size_bytes   INTEGER,
    status            TEXT NOT NULL DEFAULT 'pending',
    error_message     TEXT,
    is_valid_docx     INTEGER,
    discovered_at     TEXT NOT NULL,
    downloaded_at     TEXT,
    uploaded_at       TEXT,
    extracted_at      TEXT,
    word_count        INTEGER,
    char_count        INTEGER,
    table_count       INTEGER,
    image_count       INTEGER,
    extraction_error  TEXT
);
CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
CREATE INDEX IF NOT EXISTS idx_documents_source_url ON documents(source_url);
CREATE INDEX IF NOT EXISTS idx_documents_unextracted
    ON documents(status, extracted_at, extraction_error, uploaded_at);
";

const SELECT_COLS: &str = "id, source_url, crawl_id, original_filename, file_size_bytes, \
     status, error_message, is_valid_docx, discovered_at, downloaded_at, uploaded_at, \
     extracted_at, word_count, char_count, table_count, image_count, extraction_error";

pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> RepoResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> RepoResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| RepoError::Task(e.to_string()))?
    }
}

fn to_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_dt(value: Option<String>, column: &str) -> RepoResult<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| RepoError::Parse(format!("{column}: {e}"))),
    }
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        source_url: row.get(1)?,
        crawl_id: row.get(2)?,
        original_filename: row.get(3)?,
        file_size_bytes: row.get(4)?,
        status: row.get(5)?,
        error_message: row.get(6)?,
        is_valid_docx: row.get::<_, Option<i64>>(7)?,
        discovered_at: row.get(8)?,
        downloaded_at: row.get(9)?,
        uploaded_at: row.get(10)?,
        extracted_at: row.get(11)?,
        word_count: row.get(12)?,
        char_count: row.get(13)?,
        table_count: row.get(14)?,
        image_count: row.get(15)?,
        extraction_error: row.get(16)?,
    })
}

/// Column values straight out of SQLite, before domain conversion.
struct RawRow {
    id: String,
    source_url: String,
    crawl_id: String,
    original_filename: String,
    file_size_bytes: Option<i64>,
    status: String,
    error_message: Option<String>,
    is_valid_docx: Option<i64>,
    discovered_at: String,
    downloaded_at: Option<String>,
    uploaded_at: Option<String>,
    extracted_at: Option<String>,
    word_count: Option<i64>,
    char_count: Option<i64>,
    table_count: Option<i64>,
    image_count: Option<i64>,
    extraction_error: Option<String>,
}

impl RawRow {
    fn into_document(self) -> RepoResult<DocumentRow> {
        let status = DocumentStatus::from_str(&self.status)
            .ok_or_else(|| RepoError::Parse(format!("unknown status {:?}", self.status)))?;
        Ok(DocumentRow {
            id: self.id,
            source_url: self.source_url,
            crawl_id: self.crawl_id,
            original_filename: self.original_filename,
            file_size_bytes: self.file_size_bytes,
            status,
            error_message: self.error_message,
            is_valid_docx: self.is_valid_docx.map(|v| v != 0),
            discovered_at: parse_dt(Some(self.discovered_at), "discovered_at")?
                .unwrap_or_else(Utc::now),
            downloaded_at: parse_dt(self.downloaded_at, "downloaded_at")?,
            uploaded_at: parse_dt(self.uploaded_at, "uploaded_at")?,
            extracted_at: parse_dt(self.extracted_at, "extracted_at")?,
            word_count: self.word_count,
            char_count: self.char_count,
            table_count: self.table_count,
            image_count: self.image_count,
            extraction_error: self.extraction_error,
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn upsert(&self, row: DocumentUpsert) -> RepoResult<()> {
        self.with_conn(move |conn| {
            let now = to_rfc3339(&Utc::now());
            conn.execute(
                "INSERT INTO documents (id, source_url, crawl_id, original_filename, \
                     file_size_bytes, status, error_message, is_valid_docx, discovered_at, \
                     downloaded_at, uploaded_at) \
                 VALUES (?1, coalesce(?2, ''), coalesce(?3, ''), coalesce(?4, 'unknown.docx'), \
                     ?5, coalesce(?6, 'pending'), ?7, ?8, coalesce(?9, ?12), ?10, ?11) \
                 ON CONFLICT(id) DO UPDATE SET \
                     source_url        = coalesce(?2, source_url), \
                     crawl_id          = coalesce(?3, crawl_id), \
                     original_filename = coalesce(?4, original_filename), \
                     file_size_bytes   = coalesce(?5, file_size_bytes), \
                     status            = coalesce(?6, status), \
                     error_message     = coalesce(?7, error_message), \
                     is_valid_docx     = coalesce(?8, is_valid_docx), \
                     discovered_at     = coalesce(?9, discovered_at), \
                     downloaded_at     = coalesce(?10, downloaded_at), \
                     uploaded_at       = coalesce(?11, uploaded_at)",
                params![
                    row.id,
                    row.source_url,
                    row.crawl_id,
                    row.original_filename,
                    row.file_size_bytes,
                    row.status.map(|s| s.as_str()),
                    row.error_message,
                    row.is_valid_docx.map(i64::from),
                    row.discovered_at.as_ref().map(to_rfc3339),
                    row.downloaded_at.as_ref().map(to_rfc3339),
                    row.uploaded_at.as_ref().map(to_rfc3339),
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> RepoResult<Option<DocumentRow>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLS} FROM documents WHERE id = ?1"),
                    params![id],
                    row_to_document,
                )
                .optional()?;
            raw.map(RawRow::into_document).transpose()
        })
        .await
    }

    async fn get_by_url(&self, url: &str) -> RepoResult<Option<DocumentRow>> {
        let url = url.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {SELECT_COLS} FROM documents WHERE source_url = ?1 \
                         ORDER BY discovered_at DESC LIMIT 1"
                    ),
                    params![url],
                    row_to_document,
                )
                .optional()?;
            raw.map(RawRow::into_document).transpose()
        })
        .await
    }

    async fn uploaded_url_set(&self) -> RepoResult<HashSet<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT source_url FROM documents WHERE status = 'uploaded'")?;
            let urls = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(urls)
        })
        .await
    }

    async fn uploaded_ids_sorted(&self) -> RepoResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM documents WHERE status = 'uploaded' ORDER BY id ASC")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn stats_by_status(&self) -> RepoResult<HashMap<String, i64>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM documents GROUP BY status")?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<HashMap<_, _>, _>>()?;
            Ok(counts)
        })
        .await
    }

    async fn update_extraction(&self, id: &str, meta: ExtractionMetadata) -> RepoResult<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE documents SET extracted_at = ?2, word_count = ?3, char_count = ?4, \
                     table_count = ?5, image_count = ?6, extraction_error = NULL \
                 WHERE id = ?1",
                params![
                    id,
                    to_rfc3339(&meta.extracted_at),
                    meta.word_count,
                    meta.char_count,
                    meta.table_count,
                    meta.image_count,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_extraction_error(&self, id: &str, error: &str) -> RepoResult<()> {
        let id = id.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE documents SET extraction_error = ?2, extracted_at = NULL WHERE id = ?1",
                params![id, error],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_unextracted(&self, limit: usize) -> RepoResult<Vec<DocumentRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM documents \
                 WHERE status = 'uploaded' AND extracted_at IS NULL \
                     AND extraction_error IS NULL \
                 ORDER BY uploaded_at ASC LIMIT ?1"
            ))?;
            let raws = stmt
                .query_map(params![limit as i64], row_to_document)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(RawRow::into_document).collect()
        })
        .await
    }

    async fn extraction_stats(&self) -> RepoResult<ExtractionStats> {
        self.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT COUNT(*), \
                     coalesce(SUM(extracted_at IS NOT NULL), 0), \
                     coalesce(SUM(extraction_error IS NOT NULL), 0), \
                     coalesce(SUM(extracted_at IS NULL AND extraction_error IS NULL), 0) \
                 FROM documents WHERE status = 'uploaded'",
                [],
                |row| {
                    Ok(ExtractionStats {
                        uploaded: row.get(0)?,
                        extracted: row.get(1)?,
                        failed: row.get(2)?,
                        pending: row.get(3)?,
                    })
                },
            )?;
            Ok(stats)
        })
        .await
    }
}
