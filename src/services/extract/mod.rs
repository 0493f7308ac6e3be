//! Extract orchestrator: drives uploaded documents through the external
//! extractor subprocess pool.
//!
//! Workers share a FIFO queue of unextracted rows (oldest upload first)
//! and each owns one persistent subprocess. The whole per-document
//! pipeline (blob read, temp file, extraction, output writes, row
//! update) runs under a hard deadline; on expiry the worker kills and
//! replaces its subprocess. A separate watchdog restarts every
//! subprocess when overall progress stalls with work remaining.

mod subprocess;

pub use subprocess::{ExtractError, ExtractorCommand, ExtractorProcess, ExtractorResponse};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::models::DocumentRow;
use crate::repository::{ExtractionMetadata, MetadataStore};
use crate::storage::BlobStore;

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub workers: usize,
    /// Maximum rows claimed for this run.
    pub batch_size: usize,
    /// Blob prefix holding the payloads (`documents`).
    pub input_prefix: String,
    /// Blob prefix receiving text and structured output (`extracted`).
    pub output_prefix: String,
    pub command: ExtractorCommand,
    /// Deadline for one full per-document pipeline.
    pub per_document_timeout: Duration,
    /// How often the stall watchdog looks at the processed count.
    pub stall_check_interval: Duration,
    /// How long progress may flatline before all subprocesses restart.
    pub stall_threshold: Duration,
    /// Deadline for the subprocess readiness handshake.
    pub ready_timeout: Duration,
}

impl ExtractConfig {
    pub fn new(command: ExtractorCommand) -> Self {
        Self {
            workers: 2,
            batch_size: 100,
            input_prefix: "documents".to_string(),
            output_prefix: "extracted".to_string(),
            command,
            per_document_timeout: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

/// Progress events for the UI sink.
#[derive(Debug, Clone)]
pub enum ExtractEvent {
    Claimed { worker_id: usize, id: String },
    Extracted { worker_id: usize, id: String, word_count: i64 },
    Failed { worker_id: usize, id: String, error: String },
    SubprocessRestarted { worker_id: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub claimed: usize,
    pub extracted: usize,
    pub failed: usize,
}

struct WorkerContext {
    blob: Arc<dyn BlobStore>,
    repo: Arc<dyn MetadataStore>,
    config: ExtractConfig,
    queue: Arc<Mutex<VecDeque<DocumentRow>>>,
    extracted: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    /// Completions of any kind; the watchdog watches this.
    processed: Arc<AtomicUsize>,
    /// Bumped by the watchdog; workers respawn their subprocess when
    /// their local copy falls behind.
    generation: Arc<AtomicU64>,
    events: mpsc::Sender<ExtractEvent>,
}

pub struct ExtractService {
    blob: Arc<dyn BlobStore>,
    repo: Arc<dyn MetadataStore>,
    config: ExtractConfig,
}

impl ExtractService {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        repo: Arc<dyn MetadataStore>,
        config: ExtractConfig,
    ) -> Self {
        Self { blob, repo, config }
    }

    pub async fn run(&self, events: mpsc::Sender<ExtractEvent>) -> anyhow::Result<ExtractOutcome> {
        let rows = self.repo.get_unextracted(self.config.batch_size).await?;
        let claimed = rows.len();
        if claimed == 0 {
            tracing::info!("nothing to extract");
            return Ok(ExtractOutcome::default());
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(rows)));
        let extracted = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));
        let generation = Arc::new(AtomicU64::new(0));

        let worker_count = self.config.workers.min(claimed).max(1);
        tracing::info!(
            "extracting {} documents with {} workers",
            claimed,
            worker_count
        );

        let watchdog = tokio::spawn(stall_watchdog(
            Arc::clone(&processed),
            Arc::clone(&queue),
            Arc::clone(&generation),
            self.config.stall_check_interval,
            self.config.stall_threshold,
        ));

        let mut tasks: JoinSet<()> = JoinSet::new();
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                blob: Arc::clone(&self.blob),
                repo: Arc::clone(&self.repo),
                config: self.config.clone(),
                queue: Arc::clone(&queue),
                extracted: Arc::clone(&extracted),
                failed: Arc::clone(&failed),
                processed: Arc::clone(&processed),
                generation: Arc::clone(&generation),
                events: events.clone(),
            };
            tasks.spawn(worker_loop(worker_id, ctx));
        }
        while tasks.join_next().await.is_some() {}
        watchdog.abort();

        Ok(ExtractOutcome {
            claimed,
            extracted: extracted.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        })
    }
}

fn pop_next(queue: &Mutex<VecDeque<DocumentRow>>) -> Option<DocumentRow> {
    queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
}

fn queue_len(queue: &Mutex<VecDeque<DocumentRow>>) -> usize {
    queue.lock().unwrap_or_else(|e| e.into_inner()).len()
}

/// Restart every subprocess when the processed count flatlines while
/// work remains. Runs until aborted by the orchestrator.
async fn stall_watchdog(
    processed: Arc<AtomicUsize>,
    queue: Arc<Mutex<VecDeque<DocumentRow>>>,
    generation: Arc<AtomicU64>,
    check_interval: Duration,
    threshold: Duration,
) {
    let mut last_count = processed.load(Ordering::Relaxed);
    let mut last_progress = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(check_interval).await;
        let count = processed.load(Ordering::Relaxed);
        if count != last_count {
            last_count = count;
            last_progress = tokio::time::Instant::now();
            continue;
        }
        if queue_len(&queue) > 0 && last_progress.elapsed() >= threshold {
            tracing::warn!(
                "extraction stalled for {:?}, restarting all extractor subprocesses",
                last_progress.elapsed()
            );
            generation.fetch_add(1, Ordering::Relaxed);
            last_progress = tokio::time::Instant::now();
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    let mut process: Option<ExtractorProcess> = None;
    let mut seen_generation = ctx.generation.load(Ordering::Relaxed);

    loop {
        // Stall recovery: a generation bump means every worker replaces
        // its subprocess before taking more work.
        let current = ctx.generation.load(Ordering::Relaxed);
        if current != seen_generation {
            seen_generation = current;
            if let Some(p) = process.take() {
                p.kill().await;
            }
            let _ = ctx
                .events
                .send(ExtractEvent::SubprocessRestarted { worker_id })
                .await;
        }

        let Some(row) = pop_next(&ctx.queue) else {
            break;
        };
        let id = row.id.clone();
        let _ = ctx
            .events
            .send(ExtractEvent::Claimed {
                worker_id,
                id: id.clone(),
            })
            .await;

        // Spawn (or respawn) outside the per-document deadline; model
        // warmup is allowed to take far longer than one document.
        // Spawn failures are recorded on the claimed document and the
        // next document tries again.
        if process.is_none() {
            match ExtractorProcess::spawn(&ctx.config.command, ctx.config.ready_timeout).await {
                Ok(p) => process = Some(p),
                Err(e) => {
                    record_failure(&ctx, worker_id, &id, &e.to_string()).await;
                    continue;
                }
            }
        }
        let Some(proc_ref) = process.as_mut() else {
            continue;
        };

        match tokio::time::timeout(
            ctx.config.per_document_timeout,
            process_document(proc_ref, &ctx, &row),
        )
        .await
        {
            Err(_) => {
                // Deadline expired mid-pipeline: the subprocess may be
                // wedged on this document. Kill it; the next iteration
                // respawns.
                if let Some(p) = process.take() {
                    p.kill().await;
                }
                let error = format!(
                    "extraction timed out after {:?}",
                    ctx.config.per_document_timeout
                );
                record_failure(&ctx, worker_id, &id, &error).await;
            }
            Ok(Err(e)) => {
                if e.poisons_subprocess() {
                    if let Some(p) = process.take() {
                        p.kill().await;
                    }
                }
                record_failure(&ctx, worker_id, &id, &e.to_string()).await;
            }
            Ok(Ok(word_count)) => {
                ctx.extracted.fetch_add(1, Ordering::Relaxed);
                ctx.processed.fetch_add(1, Ordering::Relaxed);
                let _ = ctx
                    .events
                    .send(ExtractEvent::Extracted {
                        worker_id,
                        id,
                        word_count,
                    })
                    .await;
            }
        }
    }

    if let Some(p) = process.take() {
        p.kill().await;
    }
}

async fn record_failure(ctx: &WorkerContext, worker_id: usize, id: &str, error: &str) {
    if let Err(e) = ctx.repo.update_extraction_error(id, error).await {
        tracing::error!("failed to record extraction error for {}: {}", id, e);
    }
    ctx.failed.fetch_add(1, Ordering::Relaxed);
    ctx.processed.fetch_add(1, Ordering::Relaxed);
    let _ = ctx
        .events
        .send(ExtractEvent::Failed {
            worker_id,
            id: id.to_string(),
            error: error.to_string(),
        })
        .await;
}

/// The whole per-document pipeline. Runs under the caller's deadline;
/// dropping this future mid-flight also drops (and deletes) the temp
/// file.
async fn process_document(
    process: &mut ExtractorProcess,
    ctx: &WorkerContext,
    row: &DocumentRow,
) -> Result<i64, ExtractError> {
    let key = format!("{}/{}.docx", ctx.config.input_prefix, row.id);
    let bytes = ctx
        .blob
        .read(&key)
        .await
        .map_err(|e| ExtractError::Store(e.to_string()))?
        .ok_or_else(|| ExtractError::MissingBlob(row.id.clone()))?;

    // Worker-private temp file, named after the document; the extractor
    // reads from the local filesystem only.
    let doc_id = row.id.clone();
    let temp = tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile, std::io::Error> {
        let prefix = format!("{doc_id}-");
        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".docx")
            .tempfile()?;
        std::fs::write(temp.path(), &bytes)?;
        Ok(temp)
    })
    .await
    .map_err(|e| ExtractError::Store(format!("task join: {e}")))??;

    let response = process.extract(temp.path()).await?;
    if !response.success {
        return Err(ExtractError::PerDocument(
            response
                .error
                .unwrap_or_else(|| "extractor reported failure without detail".to_string()),
        ));
    }

    let text = response.text.clone().unwrap_or_default();
    let word_count = response.word_count.unwrap_or(0);
    let structured = serde_json::json!({
        "wordCount": response.word_count,
        "charCount": response.char_count,
        "tableCount": response.table_count,
        "imageCount": response.image_count,
        "language": response.language,
        "languageConfidence": response.language_confidence,
        "extraction": response.extraction,
    });

    let text_key = format!("{}/{}.txt", ctx.config.output_prefix, row.id);
    ctx.blob
        .write(&text_key, text.as_bytes())
        .await
        .map_err(|e| ExtractError::Store(e.to_string()))?;

    let json_key = format!("{}/{}.json", ctx.config.output_prefix, row.id);
    let json_bytes = serde_json::to_vec(&structured)
        .map_err(|e| ExtractError::Protocol(e.to_string()))?;
    ctx.blob
        .write(&json_key, &json_bytes)
        .await
        .map_err(|e| ExtractError::Store(e.to_string()))?;

    ctx.repo
        .update_extraction(
            &row.id,
            ExtractionMetadata {
                extracted_at: Utc::now(),
                word_count,
                char_count: response.char_count.unwrap_or(0),
                table_count: response.table_count.unwrap_or(0),
                image_count: response.image_count.unwrap_or(0),
            },
        )
        .await
        .map_err(|e| ExtractError::Repo(e.to_string()))?;

    Ok(word_count)
}
