//! The manifest command.

use console::style;

use super::{build_blob_store, open_metadata_store};
use crate::config::Settings;
use crate::services::manifest::generate_manifest;

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let repo = open_metadata_store(&settings)?;
    // Mirror only when a remote backend is configured; in local mode the
    // local file already lives under the blob root.
    let mirror = settings.uses_remote_blobs().then(|| build_blob_store(&settings));

    let summary = generate_manifest(
        repo.as_ref(),
        mirror.as_deref(),
        &settings.storage_path,
    )
    .await?;

    println!(
        "{} {} entries -> {}{}",
        style("manifest").cyan(),
        summary.entries,
        summary.local_path.display(),
        if summary.mirrored { " (mirrored)" } else { "" },
    );
    Ok(())
}
