//! Local filesystem blob backend.
//!
//! Keys map to paths under a root directory; `/` in a key is a directory
//! separator. Writes land in a temp file first and publish by rename, so
//! a crashed writer never leaves a partial blob at a content-addressed
//! key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::task;

use super::{BlobStore, KeyPage, StoreError};

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|p| !p.is_empty() && *p != "..") {
            path.push(part);
        }
        path
    }

    /// Recursively collect keys under `dir`, relative to the root.
    fn walk(root: &Path, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(root, &path, keys)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        let result = task::spawn_blocking(move || std::fs::read(&path))
            .await
            .map_err(|e| StoreError::Http(format!("task join: {e}")))?;
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let bytes = bytes.to_vec();
        task::spawn_blocking(move || -> std::io::Result<()> {
            let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(parent)?;
            // Unique temp file in the same directory, published by
            // rename: concurrent writers of the same key never expose a
            // partial blob.
            let tmp = tempfile::NamedTempFile::new_in(parent)?;
            std::fs::write(tmp.path(), &bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Http(format!("task join: {e}")))??;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key).exists())
    }

    async fn list_page(
        &self,
        prefix: &str,
        _token: Option<&str>,
    ) -> Result<KeyPage, StoreError> {
        // A directory walk has no natural pagination; everything comes
        // back in one page.
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let keys = task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let mut keys = Vec::new();
            if root.exists() {
                LocalBlobStore::walk(&root, &root, &mut keys)?;
            }
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::Http(format!("task join: {e}")))??;

        Ok(KeyPage {
            keys,
            next_token: None,
        })
    }
}
