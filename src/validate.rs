//! Fast structural validation of `.docx` payloads.
//!
//! These checks are a content filter, not a ZIP parse: they confirm the
//! bytes look like a Word-format ZIP without decoding the archive. False
//! positives are acceptable and get caught downstream by the extractor.

use thiserror::Error;

/// Minimum plausible size for a Word document.
const MIN_DOCX_LEN: usize = 100;

/// ZIP local-file-header magic.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Why a payload was rejected.
///
/// Variants are ordered by check order: the first failing check wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("too_small: payload under {MIN_DOCX_LEN} bytes")]
    TooSmall,
    #[error("wrong_magic: payload does not start with a ZIP local file header")]
    WrongMagic,
    #[error("missing_content_types: no [Content_Types].xml entry")]
    MissingContentTypes,
    #[error("missing_word_document: no word/document entry")]
    MissingWordDocument,
}

/// Check that a payload is plausibly a Word-format ZIP.
pub fn validate_docx(payload: &[u8]) -> Result<(), ValidationError> {
    if payload.len() < MIN_DOCX_LEN {
        return Err(ValidationError::TooSmall);
    }
    if payload[..4] != ZIP_MAGIC {
        return Err(ValidationError::WrongMagic);
    }
    if !contains(payload, b"[Content_Types].xml") {
        return Err(ValidationError::MissingContentTypes);
    }
    if !contains(payload, b"word/document.xml") && !contains(payload, b"word/document") {
        return Err(ValidationError::MissingWordDocument);
    }
    Ok(())
}

/// Byte-substring search. The payload is binary; no text decoding.
fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
