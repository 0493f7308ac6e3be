//! Ranged fetches of archive records from the upstream container store.
//!
//! Each CDX record addresses a byte range inside a gzipped archive
//! container. The fetcher issues a `Range` GET against the container,
//! decompresses, parses the two-tier record, and hands the payload back.
//! All outbound requests go through the shared adaptive rate limiter;
//! 403/429/503 feed the limiter's backoff and retry on an exponential
//! schedule, other failures are terminal for the record.

mod record;

pub use record::{build_archive_record, parse_archive_record, ArchiveRecord, RecordParseError};

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cdx::CdxRecord;
use crate::rate_limit::AdaptiveRateLimiter;

/// Base URL of the archive container store.
pub const ARCHIVE_BASE_URL: &str = "https://data.commoncrawl.org";

/// Identifying User-Agent for all upstream requests.
pub const USER_AGENT: &str = concat!(
    "docxharvest/",
    env!("CARGO_PKG_VERSION"),
    " (document corpus research)"
);

/// How a fetch failed. The orchestrator branches on the variant.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by upstream (HTTP {status}) after {attempts} attempts")]
    RateLimited { status: u16, attempts: u32 },
    #[error("upstream returned HTTP {status}")]
    Http { status: u16 },
    #[error("malformed archive record: {0}")]
    Record(#[from] RecordParseError),
    #[error("invalid cdx record: {0}")]
    InvalidRecord(String),
    #[error("network error: {0}")]
    Network(String),
}

/// A successfully extracted archive record payload.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    /// The nested HTTP response body - the candidate document bytes.
    pub content: Vec<u8>,
    /// Status code of the nested (archived) HTTP response.
    pub http_status: u16,
    pub content_type: Option<String>,
    pub content_length: usize,
}

/// Fetches the payload a CDX record points at.
///
/// A trait seam so the orchestrator can run against a stub in tests.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, record: &CdxRecord) -> Result<FetchedRecord, FetchError>;
}

/// Retry and deadline knobs for the HTTP fetcher.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_backoff: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(45_000),
            max_retries: 3,
            max_backoff: Duration::from_secs(64),
        }
    }
}

/// Live fetcher over HTTP byte-range requests.
pub struct HttpArchiveFetcher {
    client: reqwest::Client,
    limiter: Arc<AdaptiveRateLimiter>,
    options: FetchOptions,
    base_url: String,
}

impl HttpArchiveFetcher {
    pub fn new(
        client: reqwest::Client,
        limiter: Arc<AdaptiveRateLimiter>,
        options: FetchOptions,
    ) -> Self {
        Self {
            client,
            limiter,
            options,
            base_url: ARCHIVE_BASE_URL.to_string(),
        }
    }

    /// Point at a different container store (tests, mirrors).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    /// One ranged request. Returns the raw (still compressed) record
    /// bytes.
    async fn request_range(
        &self,
        url: &str,
        offset: u64,
        length: u64,
    ) -> Result<(u16, Vec<u8>), FetchError> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, range)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.options.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(map_reqwest_error)?
            .to_vec();
        Ok((status, body))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

/// Gunzip if possible; bytes that fail to decompress are assumed to be
/// stored uncompressed already.
fn gunzip_or_passthrough(bytes: Vec<u8>) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
    let mut buffer = Vec::with_capacity(bytes.len() * 4);
    match decoder.read_to_end(&mut buffer) {
        Ok(_) => buffer,
        Err(_) => bytes,
    }
}

#[async_trait]
impl RecordFetcher for HttpArchiveFetcher {
    async fn fetch(&self, record: &CdxRecord) -> Result<FetchedRecord, FetchError> {
        let offset = record
            .offset_bytes()
            .ok_or_else(|| FetchError::InvalidRecord(format!("bad offset {:?}", record.offset)))?;
        let length = record
            .length_bytes()
            .filter(|l| *l > 0)
            .ok_or_else(|| FetchError::InvalidRecord(format!("bad length {:?}", record.length)))?;
        let url = format!("{}/{}", self.base_url, record.filename);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let (status, raw) = match self.request_range(&url, offset, length).await {
                Ok(r) => r,
                Err(e @ (FetchError::Timeout | FetchError::Network(_))) => {
                    // Transient transport failures retry on the same
                    // schedule as rate limits but leave the rate alone.
                    self.limiter.report_error(0);
                    if attempt > self.options.max_retries {
                        return Err(e);
                    }
                    tracing::debug!(
                        "fetch attempt {} failed ({}), retrying: {}",
                        attempt,
                        e,
                        record.url
                    );
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match status {
                // 206 for honored ranges, plus any other 2xx.
                200..=299 => {
                    let decompressed = gunzip_or_passthrough(raw);
                    let parsed = parse_archive_record(&decompressed)?;
                    self.limiter.report_success();
                    return Ok(FetchedRecord {
                        content_length: parsed.body.len(),
                        content: parsed.body,
                        http_status: parsed.http_status,
                        content_type: parsed.content_type,
                    });
                }
                403 | 429 | 503 => {
                    self.limiter.report_error(status);
                    if attempt > self.options.max_retries {
                        return Err(FetchError::RateLimited {
                            status,
                            attempts: attempt,
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        "HTTP {} for {} (attempt {}), backing off {:?}",
                        status,
                        record.url,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => {
                    self.limiter.report_error(other);
                    return Err(FetchError::Http { status: other });
                }
            }
        }
    }
}

impl HttpArchiveFetcher {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = 2u64.saturating_pow(attempt.min(16));
        Duration::from_secs(secs).min(self.options.max_backoff)
    }
}
