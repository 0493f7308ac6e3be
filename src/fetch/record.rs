//! Archive-record codec.
//!
//! A fetched byte range decompresses to a two-tier record:
//!
//! ```text
//! <archive-headers>\r\n\r\n<http-response-headers>\r\n\r\n<body-bytes>
//! ```
//!
//! The format is not text: the two separators are located by byte
//! search, and only the header slices are decoded as UTF-8. The body is
//! never scanned. No transfer encoding is honored; the upstream writes
//! content-length-terminated records.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

const SEPARATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordParseError {
    #[error("missing archive header separator")]
    MissingArchiveSeparator,
    #[error("missing http header separator")]
    MissingHttpSeparator,
}

/// Decoded archive record: the nested HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    /// Status code from the nested HTTP status line; 0 when missing.
    pub http_status: u16,
    /// Nested `Content-Type` header value, matched case-insensitively.
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

fn status_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"HTTP/\d+(\.\d+)?\s+(\d+)").expect("static regex"))
}

fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(SEPARATOR.len())
        .position(|w| w == SEPARATOR)
}

/// Split a decompressed archive record into status, content type and
/// body.
pub fn parse_archive_record(bytes: &[u8]) -> Result<ArchiveRecord, RecordParseError> {
    let archive_end =
        find_separator(bytes).ok_or(RecordParseError::MissingArchiveSeparator)?;
    let http_section = &bytes[archive_end + SEPARATOR.len()..];

    let http_end =
        find_separator(http_section).ok_or(RecordParseError::MissingHttpSeparator)?;
    let header_slice = &http_section[..http_end];
    let body = http_section[http_end + SEPARATOR.len()..].to_vec();

    let headers = String::from_utf8_lossy(header_slice);
    let http_status = status_line_regex()
        .captures(&headers)
        .and_then(|c| c.get(2))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    let content_type = headers.lines().find_map(|line| {
        line.to_ascii_lowercase()
            .starts_with("content-type:")
            .then(|| line["content-type:".len()..].trim().to_string())
    });

    Ok(ArchiveRecord {
        http_status,
        content_type,
        body,
    })
}

/// Assemble a well-formed archive record. The inverse of
/// [`parse_archive_record`] for well-formed inputs; used by tests and
/// fixtures.
pub fn build_archive_record(status: u16, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(b"WARC/1.0\r\nWARC-Type: response\r\n\r\n");
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            status,
            content_type,
            body.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(body);
    out
}
