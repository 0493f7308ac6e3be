//! The scrape command: resolve crawls and drive the scrape pipeline.

use std::sync::Arc;

use console::style;
use tokio::sync::mpsc;

use super::{build_blob_store, open_metadata_store};
use crate::cli::progress::run_scrape_progress;
use crate::config::Settings;
use crate::crawls::resolve_crawl_ids;
use crate::fetch::{FetchOptions, HttpArchiveFetcher};
use crate::rate_limit::AdaptiveRateLimiter;
use crate::services::scrape::{ScrapeConfig, ScrapeService};

pub async fn run(
    settings: Settings,
    crawls: Vec<String>,
    latest: usize,
    concurrency: Option<usize>,
    batch_size: usize,
    force: bool,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let crawl_ids =
        resolve_crawl_ids(&client, &crawls, settings.crawl_id.as_deref(), latest).await?;
    println!(
        "{} {} crawl(s): {}",
        style("processing").cyan(),
        crawl_ids.len(),
        crawl_ids.join(", ")
    );

    let blob = build_blob_store(&settings);
    let repo = open_metadata_store(&settings)?;
    let concurrency = concurrency.unwrap_or(settings.concurrency).clamp(1, 50);

    for crawl_id in crawl_ids {
        // One limiter per crawl: its adapted rate reflects one upstream's
        // mood and should not leak across crawls.
        let limiter = Arc::new(AdaptiveRateLimiter::new(settings.rate_limit.clone()));
        let fetcher = Arc::new(HttpArchiveFetcher::new(
            client.clone(),
            Arc::clone(&limiter),
            FetchOptions {
                timeout: settings.timeout,
                max_retries: settings.max_retries,
                max_backoff: settings.max_backoff,
            },
        ));
        let service = ScrapeService::new(
            blob.clone(),
            repo.clone(),
            fetcher,
            ScrapeConfig {
                crawl_id: crawl_id.clone(),
                concurrency,
                batch_size,
                force,
            },
        );

        let (events_tx, events_rx) = mpsc::channel(256);
        let progress = tokio::spawn(run_scrape_progress(events_rx));
        let outcome = service.run(events_tx).await?;
        let _ = progress.await;

        let stats = limiter.stats();
        println!(
            "{} {}: saved {}, skipped {}, failed {} of {} discovered · limiter at {:.2} rps ({} errors)",
            style("done").green(),
            crawl_id,
            style(outcome.saved).green(),
            outcome.skipped,
            if outcome.failed > 0 {
                style(outcome.failed).red()
            } else {
                style(outcome.failed).dim()
            },
            outcome.discovered,
            stats.current_rps,
            stats.error_count,
        );
    }
    Ok(())
}
