//! Document row model for harvested `.docx` payloads.
//!
//! Rows are keyed by content: an uploaded document's id is the lowercase
//! hex SHA-256 of its payload bytes, so re-harvesting the same bytes from
//! a different URL converges on a single row. Records that fail before
//! any payload exists get a deterministic sentinel id derived from the
//! source URL instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Blob key prefix for canonical payload storage.
pub const DOCUMENTS_PREFIX: &str = "documents";

/// Processing status of a document row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Downloading,
    Validating,
    Uploaded,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "validating" => Some(Self::Validating),
            "uploaded" => Some(Self::Uploaded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Persistent metadata for one harvested document.
///
/// For uploaded documents `id` is the SHA-256 of the payload and the
/// payload itself lives at blob key `documents/<id>.docx`. For fetch
/// failures with no payload, `id` is `failed-<sha256(url)>` so retries of
/// the same URL update one row instead of multiplying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    pub id: String,
    pub source_url: String,
    pub crawl_id: String,
    /// Derived from the URL path, percent-decoded; `unknown.docx` when
    /// the URL yields nothing usable.
    pub original_filename: String,
    pub file_size_bytes: Option<i64>,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    /// Tri-state: `Some(true)` validated, `Some(false)` rejected,
    /// `None` never reached validation.
    pub is_valid_docx: Option<bool>,
    pub discovered_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub word_count: Option<i64>,
    pub char_count: Option<i64>,
    pub table_count: Option<i64>,
    pub image_count: Option<i64>,
    pub extraction_error: Option<String>,
}

impl DocumentRow {
    /// Blob key where this row's payload is stored.
    pub fn blob_key(&self) -> String {
        payload_key(&self.id)
    }
}

/// Blob key for a payload by content hash.
pub fn payload_key(id: &str) -> String {
    format!("{}/{}.docx", DOCUMENTS_PREFIX, id)
}

/// Compute the SHA-256 of a payload as 64 lowercase hex characters.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Deterministic row id for a record that failed before producing bytes.
///
/// Derived from the URL, not random: retrying the same URL must land on
/// the same row, and a later successful fetch (keyed by content hash)
/// must not collide with it.
pub fn failed_sentinel_id(url: &str) -> String {
    format!("failed-{}", compute_hash(url.as_bytes()))
}

/// Derive the original filename from a source URL.
///
/// Takes the last path segment, percent-decodes it, and falls back to
/// `unknown.docx` for empty or unparseable paths.
pub fn filename_from_url(source_url: &str) -> String {
    let segment = url::Url::parse(source_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(|p| p.to_string()))
        })
        .unwrap_or_default();

    if segment.is_empty() {
        return "unknown.docx".to_string();
    }

    match urlencoding::decode(&segment) {
        Ok(decoded) if !decoded.trim().is_empty() => decoded.into_owned(),
        _ => "unknown.docx".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_64_lowercase_hex() {
        let h = compute_hash(b"hello world");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(compute_hash(b"payload"), compute_hash(b"payload"));
        assert_ne!(compute_hash(b"payload"), compute_hash(b"payloae"));
    }

    #[test]
    fn known_sha256_vector() {
        // sha256("abc")
        assert_eq!(
            compute_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sentinel_id_is_deterministic_and_prefixed() {
        let a = failed_sentinel_id("https://example.com/report.docx");
        let b = failed_sentinel_id("https://example.com/report.docx");
        assert_eq!(a, b);
        assert!(a.starts_with("failed-"));
        assert_eq!(a.len(), "failed-".len() + 64);
    }

    #[test]
    fn sentinel_differs_per_url() {
        assert_ne!(
            failed_sentinel_id("https://example.com/a.docx"),
            failed_sentinel_id("https://example.com/b.docx")
        );
    }

    #[test]
    fn filename_from_plain_url() {
        assert_eq!(
            filename_from_url("https://example.com/files/report.docx"),
            "report.docx"
        );
    }

    #[test]
    fn filename_is_percent_decoded() {
        assert_eq!(
            filename_from_url("https://example.com/files/annual%20report.docx"),
            "annual report.docx"
        );
    }

    #[test]
    fn filename_defaults_on_bare_host() {
        assert_eq!(filename_from_url("https://example.com/"), "unknown.docx");
        assert_eq!(filename_from_url("not a url"), "unknown.docx");
    }

    #[test]
    fn status_round_trips() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Downloading,
            DocumentStatus::Validating,
            DocumentStatus::Uploaded,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::from_str("ocr_complete"), None);
    }

    #[test]
    fn payload_key_layout() {
        assert_eq!(payload_key("abc123"), "documents/abc123.docx");
    }
}
