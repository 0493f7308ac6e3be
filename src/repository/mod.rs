//! Relational metadata store for document rows.
//!
//! The store records provenance and progress per document so crawls are
//! resumable and observable. All reads are point-in-time; callers get no
//! transactional guarantees between a read and their next write, only
//! that each individual operation is atomic.

mod sqlite;

pub use sqlite::SqliteMetadataStore;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{DocumentRow, DocumentStatus};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task error: {0}")]
    Task(String),
    #[error("corrupt row: {0}")]
    Parse(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Sparse upsert: only the populated columns change an existing row.
///
/// Inserting a brand-new row fills unset columns with their defaults
/// (`discovered_at` defaults to now).
#[derive(Debug, Clone, Default)]
pub struct DocumentUpsert {
    pub id: String,
    pub source_url: Option<String>,
    pub crawl_id: Option<String>,
    pub original_filename: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub status: Option<DocumentStatus>,
    pub error_message: Option<String>,
    pub is_valid_docx: Option<bool>,
    pub discovered_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl DocumentUpsert {
    /// Row for a payload that validated, deduplicated and landed in the
    /// blob store.
    pub fn uploaded(
        id: String,
        source_url: String,
        crawl_id: String,
        original_filename: String,
        file_size_bytes: i64,
        downloaded_at: DateTime<Utc>,
        uploaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source_url: Some(source_url),
            crawl_id: Some(crawl_id),
            original_filename: Some(original_filename),
            file_size_bytes: Some(file_size_bytes),
            status: Some(DocumentStatus::Uploaded),
            is_valid_docx: Some(true),
            downloaded_at: Some(downloaded_at),
            uploaded_at: Some(uploaded_at),
            ..Default::default()
        }
    }

    /// Row for a record that failed before or during validation.
    pub fn failed(
        id: String,
        source_url: String,
        crawl_id: String,
        error_message: String,
        is_valid_docx: Option<bool>,
    ) -> Self {
        Self {
            id,
            source_url: Some(source_url),
            crawl_id: Some(crawl_id),
            status: Some(DocumentStatus::Failed),
            error_message: Some(error_message),
            is_valid_docx,
            ..Default::default()
        }
    }
}

/// Extraction results recorded against an uploaded row.
#[derive(Debug, Clone)]
pub struct ExtractionMetadata {
    pub extracted_at: DateTime<Utc>,
    pub word_count: i64,
    pub char_count: i64,
    pub table_count: i64,
    pub image_count: i64,
}

/// Aggregate progress of the extract pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub uploaded: i64,
    pub extracted: i64,
    pub failed: i64,
    pub pending: i64,
}

/// Persistent document metadata operations.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert by id, or sparsely update the supplied columns. Atomic.
    async fn upsert(&self, row: DocumentUpsert) -> RepoResult<()>;

    async fn get(&self, id: &str) -> RepoResult<Option<DocumentRow>>;

    async fn get_by_url(&self, url: &str) -> RepoResult<Option<DocumentRow>>;

    /// Every `source_url` with an uploaded row. Loaded once per crawl as
    /// the in-memory fast-dedup set.
    async fn uploaded_url_set(&self) -> RepoResult<HashSet<String>>;

    /// All uploaded ids in ascending id order (manifest input).
    async fn uploaded_ids_sorted(&self) -> RepoResult<Vec<String>>;

    async fn stats_by_status(&self) -> RepoResult<HashMap<String, i64>>;

    /// Record a successful extraction; clears any prior error.
    async fn update_extraction(&self, id: &str, meta: ExtractionMetadata) -> RepoResult<()>;

    /// Record an extraction failure; clears any prior success stamp.
    async fn update_extraction_error(&self, id: &str, error: &str) -> RepoResult<()>;

    /// Uploaded rows never extracted and never failed, oldest upload
    /// first.
    async fn get_unextracted(&self, limit: usize) -> RepoResult<Vec<DocumentRow>>;

    async fn extraction_stats(&self) -> RepoResult<ExtractionStats>;
}
