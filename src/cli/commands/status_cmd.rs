//! The status command: aggregate counts from the metadata store.

use console::style;

use super::open_metadata_store;
use crate::config::Settings;
use crate::models::DocumentStatus;
use crate::repository::MetadataStore;

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let repo = open_metadata_store(&settings)?;

    let by_status = repo.stats_by_status().await?;
    println!("{}", style("documents").bold());
    for status in [
        DocumentStatus::Pending,
        DocumentStatus::Downloading,
        DocumentStatus::Validating,
        DocumentStatus::Uploaded,
        DocumentStatus::Failed,
    ] {
        let count = by_status.get(status.as_str()).copied().unwrap_or(0);
        if count > 0 || matches!(status, DocumentStatus::Uploaded | DocumentStatus::Failed) {
            println!("  {:<12} {}", status.as_str(), count);
        }
    }

    let extraction = repo.extraction_stats().await?;
    println!("{}", style("extraction").bold());
    println!("  {:<12} {}", "extracted", extraction.extracted);
    println!("  {:<12} {}", "failed", extraction.failed);
    println!("  {:<12} {}", "pending", extraction.pending);
    Ok(())
}
