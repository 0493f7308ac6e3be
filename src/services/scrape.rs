//! Scrape orchestrator: drives CDX records through fetch, validation,
//! hashing and the content-addressed store.
//!
//! A bounded pool of per-record tasks runs the state machine below.
//! Failures never escape a task: every outcome becomes a row update
//! and/or a counter increment, and the pool always drains the batch.
//!
//! ```text
//!           ┌─► skipped (url or hash already uploaded)
//! discover ─┤
//!           └─► fetch ──► fetch-fail ──► failed (sentinel id)
//!                   │
//!                   ├──► validate-fail ──► failed (id = payload hash)
//!                   │
//!                   └──► hash ──► store-check ──► skipped (concurrent upload)
//!                             └─► write_if_absent ──► uploaded
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::cdx::{CdxRecord, CdxStream};
use crate::fetch::RecordFetcher;
use crate::models::{
    compute_hash, failed_sentinel_id, filename_from_url, payload_key, DocumentStatus,
};
use crate::repository::{DocumentUpsert, MetadataStore};
use crate::storage::BlobStore;
use crate::validate::validate_docx;

/// Why a record was skipped without an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The source URL was already uploaded in an earlier run.
    UrlAlreadyUploaded,
    /// The payload hash was already uploaded, possibly by a concurrent
    /// worker in this batch.
    HashAlreadyUploaded,
}

/// Progress events for the UI sink, emitted at least once per record.
#[derive(Debug, Clone)]
pub enum ScrapeEvent {
    Discovered { url: String },
    Skipped { url: String, reason: SkipReason },
    Uploaded { id: String, url: String, bytes: usize },
    Failed { url: String, error: String },
}

/// Final tallies for one crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeOutcome {
    pub discovered: usize,
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    discovered: AtomicUsize,
    saved: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn outcome(&self) -> ScrapeOutcome {
        ScrapeOutcome {
            discovered: self.discovered.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub crawl_id: String,
    /// Worker pool size.
    pub concurrency: usize,
    /// Stop submitting new records once this many uploads landed.
    /// 0 means no cap.
    pub batch_size: usize,
    /// Skip the uploaded-URL preload and reprocess everything.
    pub force: bool,
}

/// One crawl's scrape run over shared backends.
pub struct ScrapeService {
    blob: Arc<dyn BlobStore>,
    repo: Arc<dyn MetadataStore>,
    fetcher: Arc<dyn RecordFetcher>,
    config: ScrapeConfig,
}

struct WorkerContext {
    blob: Arc<dyn BlobStore>,
    repo: Arc<dyn MetadataStore>,
    fetcher: Arc<dyn RecordFetcher>,
    uploaded_urls: Arc<HashSet<String>>,
    counters: Arc<Counters>,
    events: mpsc::Sender<ScrapeEvent>,
    crawl_id: String,
}

impl ScrapeService {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        repo: Arc<dyn MetadataStore>,
        fetcher: Arc<dyn RecordFetcher>,
        config: ScrapeConfig,
    ) -> Self {
        Self {
            blob,
            repo,
            fetcher,
            config,
        }
    }

    /// Stream the crawl's CDX records through the worker pool.
    pub async fn run(&self, events: mpsc::Sender<ScrapeEvent>) -> anyhow::Result<ScrapeOutcome> {
        let uploaded_urls = Arc::new(if self.config.force {
            HashSet::new()
        } else {
            self.repo.uploaded_url_set().await?
        });
        tracing::info!(
            "starting crawl {}: {} URLs already uploaded{}",
            self.config.crawl_id,
            uploaded_urls.len(),
            if self.config.force { " (force: ignoring)" } else { "" }
        );

        let counters = Arc::new(Counters::default());
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let max_in_flight = concurrency * 2;

        let mut stream = CdxStream::open(&*self.blob, &self.config.crawl_id).await?;
        let mut tasks: JoinSet<()> = JoinSet::new();

        while let Some(record) = stream.next().await? {
            if self.config.batch_size > 0
                && counters.saved.load(Ordering::Relaxed) >= self.config.batch_size
            {
                tracing::info!(
                    "batch limit {} reached for {}",
                    self.config.batch_size,
                    self.config.crawl_id
                );
                break;
            }

            counters.discovered.fetch_add(1, Ordering::Relaxed);
            let _ = events
                .send(ScrapeEvent::Discovered {
                    url: record.url.clone(),
                })
                .await;

            // Backpressure: never run further ahead than one extra batch
            // of in-flight records.
            while tasks.len() >= max_in_flight {
                let _ = tasks.join_next().await;
            }

            let ctx = WorkerContext {
                blob: Arc::clone(&self.blob),
                repo: Arc::clone(&self.repo),
                fetcher: Arc::clone(&self.fetcher),
                uploaded_urls: Arc::clone(&uploaded_urls),
                counters: Arc::clone(&counters),
                events: events.clone(),
                crawl_id: self.config.crawl_id.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                process_record(ctx, record).await;
            });
        }

        while tasks.join_next().await.is_some() {}
        Ok(counters.outcome())
    }
}

/// Per-record state machine. Never returns an error: terminal states
/// are row updates plus counters.
async fn process_record(ctx: WorkerContext, record: CdxRecord) {
    if ctx.uploaded_urls.contains(&record.url) {
        skip(&ctx, &record.url, SkipReason::UrlAlreadyUploaded).await;
        return;
    }

    let fetched = match ctx.fetcher.fetch(&record).await {
        Ok(fetched) => fetched,
        Err(e) => {
            record_failure(&ctx, &record, failed_sentinel_id(&record.url), e.to_string(), None)
                .await;
            return;
        }
    };
    let downloaded_at = Utc::now();

    if let Err(reason) = validate_docx(&fetched.content) {
        // The payload exists, so the row is keyed by its content hash
        // even though it never uploads.
        let id = compute_hash(&fetched.content);
        record_failure(&ctx, &record, id, reason.to_string(), Some(false)).await;
        return;
    }

    let id = compute_hash(&fetched.content);

    // Hash dedup needs a fresh read: another worker in this batch may
    // have uploaded the same bytes moments ago.
    match ctx.repo.get(&id).await {
        Ok(Some(row)) if row.status == DocumentStatus::Uploaded => {
            skip(&ctx, &record.url, SkipReason::HashAlreadyUploaded).await;
            return;
        }
        Ok(_) => {}
        Err(e) => {
            store_failure(&ctx, &record.url, &format!("metadata read failed: {e}")).await;
            return;
        }
    }

    let key = payload_key(&id);
    let created = match ctx.blob.write_if_absent(&key, &fetched.content).await {
        Ok(created) => created,
        Err(e) => {
            store_failure(&ctx, &record.url, &format!("blob write failed: {e}")).await;
            return;
        }
    };

    if !created {
        match ctx.repo.get(&id).await {
            Ok(Some(row)) if row.status == DocumentStatus::Uploaded => {
                skip(&ctx, &record.url, SkipReason::HashAlreadyUploaded).await;
                return;
            }
            // Blob present but no uploaded row: a previous writer died
            // between blob write and row upsert. The blob is
            // authoritative; write the row now.
            Ok(_) => {}
            Err(e) => {
                store_failure(&ctx, &record.url, &format!("metadata read failed: {e}")).await;
                return;
            }
        }
    }

    let row = DocumentUpsert::uploaded(
        id.clone(),
        record.url.clone(),
        ctx.crawl_id.clone(),
        filename_from_url(&record.url),
        fetched.content.len() as i64,
        downloaded_at,
        Utc::now(),
    );
    match ctx.repo.upsert(row).await {
        Ok(()) => {
            ctx.counters.saved.fetch_add(1, Ordering::Relaxed);
            let _ = ctx
                .events
                .send(ScrapeEvent::Uploaded {
                    id,
                    url: record.url.clone(),
                    bytes: fetched.content.len(),
                })
                .await;
        }
        Err(e) => {
            store_failure(&ctx, &record.url, &format!("row upsert failed: {e}")).await;
        }
    }
}

async fn skip(ctx: &WorkerContext, url: &str, reason: SkipReason) {
    ctx.counters.skipped.fetch_add(1, Ordering::Relaxed);
    let _ = ctx
        .events
        .send(ScrapeEvent::Skipped {
            url: url.to_string(),
            reason,
        })
        .await;
}

/// Terminal failure with a row: fetch and validation failures.
async fn record_failure(
    ctx: &WorkerContext,
    record: &CdxRecord,
    id: String,
    error: String,
    is_valid_docx: Option<bool>,
) {
    ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
    let row = DocumentUpsert::failed(
        id,
        record.url.clone(),
        ctx.crawl_id.clone(),
        error.clone(),
        is_valid_docx,
    );
    if let Err(e) = ctx.repo.upsert(row).await {
        tracing::error!("failed to record failure row for {}: {}", record.url, e);
    }
    let _ = ctx
        .events
        .send(ScrapeEvent::Failed {
            url: record.url.clone(),
            error,
        })
        .await;
}

/// Store-layer failure: logged and counted, no row to write.
async fn store_failure(ctx: &WorkerContext, url: &str, error: &str) {
    tracing::error!("{}: {}", url, error);
    ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
    let _ = ctx
        .events
        .send(ScrapeEvent::Failed {
            url: url.to_string(),
            error: error.to_string(),
        })
        .await;
}
