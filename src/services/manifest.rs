//! Manifest generator: a sorted snapshot of every uploaded hash.
//!
//! The manifest is one id per line, ASCII-sorted, LF-terminated with a
//! trailing newline. It is written under the local root and, when a
//! remote blob backend is configured, mirrored byte-for-byte to the
//! `manifest.txt` key.

use std::path::{Path, PathBuf};

use crate::repository::MetadataStore;
use crate::storage::BlobStore;

/// Blob key the manifest mirrors to.
pub const MANIFEST_KEY: &str = "manifest.txt";

#[derive(Debug, Clone)]
pub struct ManifestSummary {
    pub entries: usize,
    pub local_path: PathBuf,
    pub mirrored: bool,
}

/// Render the manifest bytes for a sorted id list.
fn render(ids: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 65);
    for id in ids {
        out.extend_from_slice(id.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Write the manifest locally and optionally mirror it to a blob store.
pub async fn generate_manifest(
    repo: &dyn MetadataStore,
    mirror: Option<&dyn BlobStore>,
    local_root: &Path,
) -> anyhow::Result<ManifestSummary> {
    let ids = repo.uploaded_ids_sorted().await?;
    let bytes = render(&ids);

    tokio::fs::create_dir_all(local_root).await?;
    let local_path = local_root.join(MANIFEST_KEY);
    tokio::fs::write(&local_path, &bytes).await?;
    tracing::info!("wrote {} with {} entries", local_path.display(), ids.len());

    let mirrored = match mirror {
        Some(store) => {
            store.write(MANIFEST_KEY, &bytes).await?;
            true
        }
        None => false,
    };

    Ok(ManifestSummary {
        entries: ids.len(),
        local_path,
        mirrored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{DocumentUpsert, SqliteMetadataStore};
    use chrono::Utc;
    use tempfile::tempdir;

    async fn store_with_uploads(ids: &[&str]) -> SqliteMetadataStore {
        let repo = SqliteMetadataStore::open_in_memory().unwrap();
        for id in ids {
            repo.upsert(DocumentUpsert::uploaded(
                id.to_string(),
                format!("https://example.com/{id}.docx"),
                "CC-2024-01".to_string(),
                format!("{id}.docx"),
                100,
                Utc::now(),
                Utc::now(),
            ))
            .await
            .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn manifest_is_sorted_with_trailing_newline() {
        let repo = store_with_uploads(&["beta", "alpha", "gamma"]).await;
        let dir = tempdir().unwrap();

        let summary = generate_manifest(&repo, None, dir.path()).await.unwrap();
        assert_eq!(summary.entries, 3);
        assert!(!summary.mirrored);

        let content = std::fs::read_to_string(&summary.local_path).unwrap();
        assert_eq!(content, "alpha\nbeta\ngamma\n");
    }

    #[tokio::test]
    async fn empty_manifest_is_empty_file() {
        let repo = SqliteMetadataStore::open_in_memory().unwrap();
        let dir = tempdir().unwrap();
        let summary = generate_manifest(&repo, None, dir.path()).await.unwrap();
        assert_eq!(summary.entries, 0);
        assert_eq!(std::fs::read(&summary.local_path).unwrap(), b"");
    }

    #[tokio::test]
    async fn manifest_mirrors_to_blob_store() {
        use crate::storage::LocalBlobStore;
        let repo = store_with_uploads(&["only"]).await;
        let local = tempdir().unwrap();
        let blob_dir = tempdir().unwrap();
        let blob = LocalBlobStore::new(blob_dir.path());

        let summary = generate_manifest(&repo, Some(&blob), local.path())
            .await
            .unwrap();
        assert!(summary.mirrored);
        assert_eq!(
            blob.read(MANIFEST_KEY).await.unwrap(),
            Some(b"only\n".to_vec())
        );
    }
}
