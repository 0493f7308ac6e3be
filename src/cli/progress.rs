//! Single-line progress rendering for the pipeline commands.
//!
//! Each orchestrator emits events over a channel; the consumers here
//! fold them into counters and redraw one spinner line with counts and
//! throughput.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::services::extract::ExtractEvent;
use crate::services::scrape::ScrapeEvent;

fn spinner(prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {prefix} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_prefix(prefix.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

/// Consume scrape events until the channel closes, redrawing one line.
pub async fn run_scrape_progress(mut events: mpsc::Receiver<ScrapeEvent>) {
    let bar = spinner("scrape");
    let started = Instant::now();
    let (mut discovered, mut saved, mut skipped, mut failed) = (0u64, 0u64, 0u64, 0u64);

    while let Some(event) = events.recv().await {
        match event {
            ScrapeEvent::Discovered { .. } => discovered += 1,
            ScrapeEvent::Uploaded { .. } => saved += 1,
            ScrapeEvent::Skipped { .. } => skipped += 1,
            ScrapeEvent::Failed { url, error } => {
                failed += 1;
                bar.println(format!("failed {}: {}", url, error));
            }
        }
        let rate = saved as f64 / started.elapsed().as_secs_f64().max(0.001);
        bar.set_message(format!(
            "discovered {} · saved {} · skipped {} · failed {} · {:.2} docs/s",
            discovered, saved, skipped, failed, rate
        ));
    }
    bar.finish_and_clear();
}

/// Consume extract events until the channel closes, redrawing one line.
pub async fn run_extract_progress(mut events: mpsc::Receiver<ExtractEvent>) {
    let bar = spinner("extract");
    let started = Instant::now();
    let (mut claimed, mut extracted, mut failed) = (0u64, 0u64, 0u64);

    while let Some(event) = events.recv().await {
        match event {
            ExtractEvent::Claimed { .. } => claimed += 1,
            ExtractEvent::Extracted { .. } => extracted += 1,
            ExtractEvent::Failed { id, error, .. } => {
                failed += 1;
                bar.println(format!("failed {}: {}", id, error));
            }
            ExtractEvent::SubprocessRestarted { worker_id } => {
                bar.println(format!("worker {} restarted its extractor", worker_id));
            }
        }
        let rate = extracted as f64 / started.elapsed().as_secs_f64().max(0.001);
        bar.set_message(format!(
            "claimed {} · extracted {} · failed {} · {:.2} docs/s",
            claimed, extracted, failed, rate
        ));
    }
    bar.finish_and_clear();
}
