//! End-to-end scrape pipeline tests against a local blob store, an
//! in-process SQLite database and a stubbed record fetcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::mpsc;

use docxharvest::cdx::{CdxRecord, WORD_MIME};
use docxharvest::fetch::{FetchError, FetchedRecord, RecordFetcher};
use docxharvest::models::{compute_hash, payload_key, DocumentStatus};
use docxharvest::repository::{MetadataStore, SqliteMetadataStore};
use docxharvest::services::scrape::{ScrapeConfig, ScrapeService};
use docxharvest::storage::{BlobStore, KeyStream, LocalBlobStore};

/// A payload that passes structural validation.
fn valid_docx(seed: &str) -> Vec<u8> {
    let mut buf = vec![0x50, 0x4B, 0x03, 0x04];
    buf.extend_from_slice(b"[Content_Types].xml");
    buf.extend_from_slice(b"word/document.xml");
    buf.extend_from_slice(seed.as_bytes());
    buf.resize(buf.len().max(120), 0);
    buf
}

/// A payload that fails validation (no word/document entry).
fn invalid_docx() -> Vec<u8> {
    let mut buf = vec![0x50, 0x4B, 0x03, 0x04];
    buf.extend_from_slice(b"[Content_Types].xml");
    buf.resize(120, 0);
    buf
}

fn cdx_record(url: &str, offset: u64) -> CdxRecord {
    CdxRecord {
        url: url.to_string(),
        mime: WORD_MIME.to_string(),
        status: "200".to_string(),
        digest: "DIGEST".to_string(),
        length: "1024".to_string(),
        offset: offset.to_string(),
        filename: "crawl-data/seg/warc/file.warc.gz".to_string(),
    }
}

fn record_line(url: &str, offset: u64) -> String {
    serde_json::to_string(&cdx_record(url, offset)).unwrap()
}

/// Serves canned payloads by URL and counts fetches.
struct StubFetcher {
    payloads: HashMap<String, Result<Vec<u8>, String>>,
    calls: AtomicUsize,
}

impl StubFetcher {
    fn new(payloads: HashMap<String, Result<Vec<u8>, String>>) -> Self {
        Self {
            payloads,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordFetcher for StubFetcher {
    async fn fetch(&self, record: &CdxRecord) -> Result<FetchedRecord, FetchError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.payloads.get(&record.url) {
            Some(Ok(bytes)) => Ok(FetchedRecord {
                content: bytes.clone(),
                http_status: 200,
                content_type: Some(WORD_MIME.to_string()),
                content_length: bytes.len(),
            }),
            Some(Err(message)) => Err(FetchError::Network(message.clone())),
            None => Err(FetchError::Http { status: 404 }),
        }
    }
}

struct Harness {
    blob: Arc<LocalBlobStore>,
    repo: Arc<SqliteMetadataStore>,
    fetcher: Arc<StubFetcher>,
    _blob_dir: tempfile::TempDir,
    _db_dir: tempfile::TempDir,
}

impl Harness {
    async fn new(
        shard_lines: &[String],
        payloads: HashMap<String, Result<Vec<u8>, String>>,
    ) -> Self {
        let blob_dir = tempdir().unwrap();
        let db_dir = tempdir().unwrap();
        let blob = Arc::new(LocalBlobStore::new(blob_dir.path()));
        blob.write(
            "cdx-filtered/CC-TEST/00.jsonl",
            format!("{}\n", shard_lines.join("\n")).as_bytes(),
        )
        .await
        .unwrap();
        let repo =
            Arc::new(SqliteMetadataStore::open(db_dir.path().join("meta.db")).unwrap());
        Self {
            blob,
            repo,
            fetcher: Arc::new(StubFetcher::new(payloads)),
            _blob_dir: blob_dir,
            _db_dir: db_dir,
        }
    }

    fn service(&self, force: bool) -> ScrapeService {
        ScrapeService::new(
            self.blob.clone(),
            self.repo.clone(),
            self.fetcher.clone(),
            ScrapeConfig {
                crawl_id: "CC-TEST".to_string(),
                concurrency: 1,
                batch_size: 0,
                force,
            },
        )
    }

    async fn run(&self, force: bool) -> docxharvest::services::scrape::ScrapeOutcome {
        let (tx, mut rx) = mpsc::channel(1024);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let outcome = self.service(force).run(tx).await.unwrap();
        let _ = drain.await;
        outcome
    }
}

#[tokio::test]
async fn happy_path_single_record_uploads() {
    let url = "https://example.com/files/report.docx";
    let payload = valid_docx("one");
    let harness = Harness::new(
        &[record_line(url, 0)],
        HashMap::from([(url.to_string(), Ok(payload.clone()))]),
    )
    .await;

    let outcome = harness.run(false).await;
    assert_eq!(outcome.discovered, 1);
    assert_eq!(outcome.saved, 1);
    assert_eq!(outcome.skipped, 0);
    assert_eq!(outcome.failed, 0);

    let id = compute_hash(&payload);
    let stored = harness.blob.read(&payload_key(&id)).await.unwrap().unwrap();
    assert_eq!(compute_hash(&stored), id);

    let row = harness.repo.get(&id).await.unwrap().unwrap();
    assert_eq!(row.status, DocumentStatus::Uploaded);
    assert_eq!(row.source_url, url);
    assert_eq!(row.crawl_id, "CC-TEST");
    assert_eq!(row.original_filename, "report.docx");
    assert_eq!(row.is_valid_docx, Some(true));
    assert!(row.downloaded_at.is_some());
    assert!(row.uploaded_at.is_some());
}

#[tokio::test]
async fn validation_failure_writes_failed_row_and_no_blob() {
    let url = "https://example.com/bad.docx";
    let payload = invalid_docx();
    let harness = Harness::new(
        &[record_line(url, 0)],
        HashMap::from([(url.to_string(), Ok(payload.clone()))]),
    )
    .await;

    let outcome = harness.run(false).await;
    assert_eq!(outcome.saved, 0);
    assert_eq!(outcome.failed, 1);

    let id = compute_hash(&payload);
    assert_eq!(harness.blob.read(&payload_key(&id)).await.unwrap(), None);

    let row = harness.repo.get(&id).await.unwrap().unwrap();
    assert_eq!(row.status, DocumentStatus::Failed);
    assert_eq!(row.is_valid_docx, Some(false));
    assert!(row.error_message.unwrap().contains("word/document"));
}

#[tokio::test]
async fn fetch_failure_writes_sentinel_row() {
    let url = "https://example.com/gone.docx";
    let harness = Harness::new(
        &[record_line(url, 0)],
        HashMap::from([(url.to_string(), Err("connection reset".to_string()))]),
    )
    .await;

    let outcome = harness.run(false).await;
    assert_eq!(outcome.failed, 1);

    let sentinel = docxharvest::models::failed_sentinel_id(url);
    let row = harness.repo.get(&sentinel).await.unwrap().unwrap();
    assert_eq!(row.status, DocumentStatus::Failed);
    assert_eq!(row.is_valid_docx, None);
    assert!(row.error_message.unwrap().contains("connection reset"));

    // A retry of the same URL lands on the same row, not a new one.
    let outcome = harness.run(false).await;
    assert_eq!(outcome.failed, 1);
    let stats = harness.repo.stats_by_status().await.unwrap();
    assert_eq!(stats.get("failed"), Some(&1));
}

#[tokio::test]
async fn duplicate_url_in_batch_uploads_once() {
    let url = "https://example.com/dup.docx";
    let payload = valid_docx("dup");
    // Same URL twice at different archive offsets, same eventual bytes.
    let harness = Harness::new(
        &[record_line(url, 0), record_line(url, 4096)],
        HashMap::from([(url.to_string(), Ok(payload.clone()))]),
    )
    .await;

    let outcome = harness.run(false).await;
    assert_eq!(outcome.discovered, 2);
    assert_eq!(outcome.saved, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.failed, 0);

    // Exactly one blob object and one uploaded row.
    let keys = KeyStream::new(harness.blob.as_ref(), "documents/")
        .collect()
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    let stats = harness.repo.stats_by_status().await.unwrap();
    assert_eq!(stats.get("uploaded"), Some(&1));
}

#[tokio::test]
async fn second_run_skips_via_preloaded_url_set() {
    let url = "https://example.com/stable.docx";
    let payload = valid_docx("stable");
    let harness = Harness::new(
        &[record_line(url, 0)],
        HashMap::from([(url.to_string(), Ok(payload))]),
    )
    .await;

    let first = harness.run(false).await;
    assert_eq!(first.saved, 1);
    let fetches_after_first = harness.fetcher.calls();

    // Idempotence: a second run over the same crawl uploads nothing and
    // never re-fetches (the URL set short-circuits before the fetcher).
    let second = harness.run(false).await;
    assert_eq!(second.saved, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(harness.fetcher.calls(), fetches_after_first);

    let stats = harness.repo.stats_by_status().await.unwrap();
    assert_eq!(stats.get("uploaded"), Some(&1));
}

#[tokio::test]
async fn force_reprocesses_but_dedups_on_hash() {
    let url = "https://example.com/forced.docx";
    let payload = valid_docx("forced");
    let harness = Harness::new(
        &[record_line(url, 0)],
        HashMap::from([(url.to_string(), Ok(payload))]),
    )
    .await;

    assert_eq!(harness.run(false).await.saved, 1);
    let fetches_after_first = harness.fetcher.calls();

    // Force: the URL set starts empty, so the fetch is re-issued, but
    // the content hash dedups and the record counts as skipped.
    let second = harness.run(true).await;
    assert_eq!(second.saved, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(second.failed, 0);
    assert!(harness.fetcher.calls() > fetches_after_first);

    let stats = harness.repo.stats_by_status().await.unwrap();
    assert_eq!(stats.get("uploaded"), Some(&1));
}

#[tokio::test]
async fn batch_size_caps_uploads() {
    let payloads: HashMap<String, Result<Vec<u8>, String>> = (0..5)
        .map(|i| {
            let url = format!("https://example.com/{i}.docx");
            (url, Ok(valid_docx(&format!("doc-{i}"))))
        })
        .collect();
    let lines: Vec<String> = (0..5)
        .map(|i| record_line(&format!("https://example.com/{i}.docx"), i * 1000))
        .collect();
    let harness = Harness::new(&lines, payloads).await;

    let service = ScrapeService::new(
        harness.blob.clone(),
        harness.repo.clone(),
        harness.fetcher.clone(),
        ScrapeConfig {
            crawl_id: "CC-TEST".to_string(),
            concurrency: 1,
            batch_size: 2,
            force: false,
        },
    );
    let (tx, mut rx) = mpsc::channel(1024);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let outcome = service.run(tx).await.unwrap();
    let _ = drain.await;

    // The cap is checked at submission time, so in-flight records may
    // overshoot it slightly, but the stream never drains fully.
    assert!(outcome.saved >= 2);
    assert!(outcome.discovered < 5);
}

#[tokio::test]
async fn mixed_batch_tallies_every_outcome() {
    let good_url = "https://example.com/good.docx";
    let bad_url = "https://example.com/bad.docx";
    let missing_url = "https://example.com/missing.docx";
    let harness = Harness::new(
        &[
            record_line(good_url, 0),
            record_line(bad_url, 100),
            record_line(missing_url, 200),
        ],
        HashMap::from([
            (good_url.to_string(), Ok(valid_docx("good"))),
            (bad_url.to_string(), Ok(invalid_docx())),
        ]),
    )
    .await;

    let outcome = harness.run(false).await;
    assert_eq!(outcome.discovered, 3);
    assert_eq!(outcome.saved, 1);
    assert_eq!(outcome.failed, 2);
    assert_eq!(outcome.skipped, 0);
}
