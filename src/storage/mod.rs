//! Blob storage over a flat key namespace.
//!
//! Two backends: the local filesystem (keys are path fragments under a
//! root) and an S3-compatible store (Cloudflare R2). Deduplication of
//! payloads is guaranteed by content-addressed keys, not by any atomicity
//! in [`BlobStore::write_if_absent`]: concurrent writers of the same
//! content race to the same key with the same bytes, and either winning
//! is fine.

mod local;
mod r2;

pub use local::LocalBlobStore;
pub use r2::{R2BlobStore, R2Config};

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from blob backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("blob backend returned HTTP {status} for {key}")]
    UnexpectedStatus { status: u16, key: String },
    #[error("malformed listing response: {0}")]
    Listing(String),
}

/// One page of a key listing.
#[derive(Debug, Default)]
pub struct KeyPage {
    pub keys: Vec<String>,
    /// Opaque continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// A flat byte store addressed by string keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a key's contents. `None` when the key does not exist.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditional put. Implementations send an explicit content
    /// length; streaming with unknown length breaks strict S3-family
    /// backends.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Write only when the key is absent. Returns `true` when this call
    /// created the key. Implemented as existence check + put; two
    /// concurrent callers may both observe `true`.
    async fn write_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, StoreError> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.write(key, bytes).await?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Fetch one listing page for a prefix. Key order across pages is
    /// backend-defined.
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<KeyPage, StoreError>;
}

/// Lazy pull iterator over every key under a prefix.
///
/// Follows continuation tokens transparently; nothing is fetched until
/// the consumer pulls.
pub struct KeyStream<'a> {
    store: &'a dyn BlobStore,
    prefix: String,
    buffer: VecDeque<String>,
    token: Option<String>,
    exhausted: bool,
}

impl<'a> KeyStream<'a> {
    pub fn new(store: &'a dyn BlobStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            buffer: VecDeque::new(),
            token: None,
            exhausted: false,
        }
    }

    /// Next key, or `None` when the listing is drained.
    pub async fn next(&mut self) -> Result<Option<String>, StoreError> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Ok(Some(key));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self
                .store
                .list_page(&self.prefix, self.token.as_deref())
                .await?;
            self.token = page.next_token;
            self.exhausted = self.token.is_none();
            self.buffer.extend(page.keys);
            if self.buffer.is_empty() && self.exhausted {
                return Ok(None);
            }
        }
    }

    /// Drain the remaining keys into a vector.
    pub async fn collect(mut self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        while let Some(key) = self.next().await? {
            keys.push(key);
        }
        Ok(keys)
    }
}
