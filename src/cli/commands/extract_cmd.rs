//! The extract command: drive the extractor subprocess pool.

use console::style;
use tokio::sync::mpsc;

use super::{build_blob_store, open_metadata_store};
use crate::cli::progress::run_extract_progress;
use crate::config::Settings;
use crate::services::extract::{ExtractConfig, ExtractService, ExtractorCommand};

pub async fn run(
    settings: Settings,
    workers: Option<usize>,
    batch_size: Option<usize>,
) -> anyhow::Result<()> {
    let command = ExtractorCommand::parse(&settings.extractor_cmd)?;
    let mut config = ExtractConfig::new(command);
    config.workers = workers.unwrap_or(settings.extract_workers).max(1);
    config.batch_size = batch_size.unwrap_or(settings.extract_batch_size).max(1);
    config.input_prefix = settings.extract_input_prefix.clone();
    config.output_prefix = settings.extract_output_prefix.clone();

    let blob = build_blob_store(&settings);
    let repo = open_metadata_store(&settings)?;
    let service = ExtractService::new(blob, repo, config);

    let (events_tx, events_rx) = mpsc::channel(256);
    let progress = tokio::spawn(run_extract_progress(events_rx));
    let outcome = service.run(events_tx).await?;
    let _ = progress.await;

    println!(
        "{} extracted {}, failed {} of {} claimed",
        style("done").green(),
        style(outcome.extracted).green(),
        if outcome.failed > 0 {
            style(outcome.failed).red()
        } else {
            style(outcome.failed).dim()
        },
        outcome.claimed,
    );
    Ok(())
}
