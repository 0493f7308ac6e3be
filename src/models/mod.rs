//! Domain models.

mod document;

pub use document::{
    compute_hash, failed_sentinel_id, filename_from_url, payload_key, DocumentRow, DocumentStatus,
    DOCUMENTS_PREFIX,
};
