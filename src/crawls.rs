//! Crawl-list endpoint client.
//!
//! The upstream publishes the available monthly crawls as a JSON array
//! of `{id, name}` objects, newest first. Used to resolve "latest" and
//! "last N" when no explicit crawl id is configured.

use serde::Deserialize;
use thiserror::Error;

/// Upstream index of available crawls.
pub const CRAWL_LIST_URL: &str = "https://index.commoncrawl.org/collinfo.json";

#[derive(Debug, Error)]
pub enum CrawlListError {
    #[error("crawl list request failed: {0}")]
    Http(String),
    #[error("crawl list returned HTTP {0}")]
    Status(u16),
    #[error("crawl list is empty")]
    Empty,
}

/// One entry of the crawl list.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlInfo {
    pub id: String,
    pub name: String,
}

/// Fetch the crawl list, newest first.
pub async fn fetch_crawl_list(client: &reqwest::Client) -> Result<Vec<CrawlInfo>, CrawlListError> {
    fetch_crawl_list_from(client, CRAWL_LIST_URL).await
}

async fn fetch_crawl_list_from(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<CrawlInfo>, CrawlListError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| CrawlListError::Http(e.to_string()))?;
    if !response.status().is_success() {
        return Err(CrawlListError::Status(response.status().as_u16()));
    }
    response
        .json::<Vec<CrawlInfo>>()
        .await
        .map_err(|e| CrawlListError::Http(e.to_string()))
}

/// Resolve which crawls to process.
///
/// Precedence: explicit ids, then the configured id, then the newest
/// `latest_n` entries from the upstream list.
pub async fn resolve_crawl_ids(
    client: &reqwest::Client,
    explicit: &[String],
    configured: Option<&str>,
    latest_n: usize,
) -> Result<Vec<String>, CrawlListError> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }
    if let Some(id) = configured.filter(|id| !id.trim().is_empty()) {
        return Ok(vec![id.to_string()]);
    }

    let list = fetch_crawl_list(client).await?;
    if list.is_empty() {
        return Err(CrawlListError::Empty);
    }
    Ok(list
        .into_iter()
        .take(latest_n.max(1))
        .map(|c| c.id)
        .collect())
}
