//! Filtered CDX index records and the shard stream.
//!
//! The upstream filter job writes per-crawl JSONL shards to blob keys
//! `cdx-filtered/<crawl-id>/<shard>.jsonl`, one candidate download per
//! line. [`CdxStream`] replays those shards as a finite, single-pass pull
//! sequence; ordering is guaranteed only within a shard.
//!
//! A lower-level parser handles raw upstream CDX lines of the form
//! `surt timestamp {json}`; anything malformed or filtered out yields
//! `None`, never an error.

use serde::{Deserialize, Serialize};

use crate::storage::{BlobStore, KeyStream, StoreError};

/// MIME type a record must carry to survive filtering.
pub const WORD_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Blob key prefix holding the filtered shards for a crawl.
pub fn shard_prefix(crawl_id: &str) -> String {
    format!("cdx-filtered/{}/", crawl_id)
}

/// One candidate download out of the filtered index.
///
/// `offset`/`length` address a byte range inside the archive container
/// at `filename`; both arrive as decimal strings in the upstream format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdxRecord {
    pub url: String,
    pub mime: String,
    pub status: String,
    pub digest: String,
    pub length: String,
    pub offset: String,
    pub filename: String,
}

impl CdxRecord {
    /// Byte offset within the archive container.
    pub fn offset_bytes(&self) -> Option<u64> {
        self.offset.parse().ok()
    }

    /// Byte length of the archive record.
    pub fn length_bytes(&self) -> Option<u64> {
        self.length.parse().ok()
    }

    /// Whether this record survives the mime/status filter.
    fn passes_filter(&self) -> bool {
        self.status == "200" && self.mime == WORD_MIME
    }
}

/// Parse one raw upstream CDX line (`surt timestamp {json}`).
///
/// Returns `None` for blank lines, lines without a JSON object, JSON
/// that fails to parse, and records filtered out by mime or status.
pub fn parse_cdx_line(line: &str) -> Option<CdxRecord> {
    let brace = line.find('{')?;
    let record: CdxRecord = serde_json::from_str(&line[brace..]).ok()?;
    record.passes_filter().then_some(record)
}

/// Finite pull stream of [`CdxRecord`]s for one crawl.
///
/// Shard keys are resolved once at open; each shard is read fully into
/// memory before parsing (shards are far below 100 MB). Not restartable.
pub struct CdxStream<'a> {
    store: &'a dyn BlobStore,
    keys: std::collections::VecDeque<String>,
    records: std::collections::VecDeque<CdxRecord>,
}

impl<'a> CdxStream<'a> {
    /// List the crawl's `.jsonl` shard keys and position before the
    /// first record.
    pub async fn open(store: &'a dyn BlobStore, crawl_id: &str) -> Result<Self, StoreError> {
        let keys = KeyStream::new(store, shard_prefix(crawl_id))
            .collect()
            .await?
            .into_iter()
            .filter(|k| k.ends_with(".jsonl"))
            .collect();
        Ok(Self {
            store,
            keys,
            records: std::collections::VecDeque::new(),
        })
    }

    /// Number of shards left to read (including the current buffer's
    /// successors).
    pub fn shards_remaining(&self) -> usize {
        self.keys.len()
    }

    /// Pull the next record, or `None` at end of input.
    pub async fn next(&mut self) -> Result<Option<CdxRecord>, StoreError> {
        loop {
            if let Some(record) = self.records.pop_front() {
                return Ok(Some(record));
            }
            let Some(key) = self.keys.pop_front() else {
                return Ok(None);
            };
            let Some(bytes) = self.store.read(&key).await? else {
                tracing::warn!("cdx shard {} vanished between list and read", key);
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<CdxRecord>(line) {
                    Ok(record) if record.passes_filter() => self.records.push_back(record),
                    Ok(record) => {
                        tracing::debug!(
                            "skipping filtered record in {}: mime={} status={}",
                            key,
                            record.mime,
                            record.status
                        );
                    }
                    Err(e) => {
                        tracing::warn!("skipping malformed line in {}: {}", key, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use tempfile::tempdir;

    fn record_json(url: &str, offset: u64) -> String {
        format!(
            concat!(
                "{{\"url\":\"{}\",\"mime\":\"{}\",\"status\":\"200\",",
                "\"digest\":\"XYZ\",\"length\":\"1024\",\"offset\":\"{}\",",
                "\"filename\":\"crawl-data/seg/warc/file.warc.gz\"}}"
            ),
            url, WORD_MIME, offset
        )
    }

    #[test]
    fn parse_line_accepts_filtered_word_record() {
        let line = format!("com,example)/a.docx 20240101000000 {}", record_json("https://example.com/a.docx", 42));
        let record = parse_cdx_line(&line).unwrap();
        assert_eq!(record.url, "https://example.com/a.docx");
        assert_eq!(record.offset_bytes(), Some(42));
        assert_eq!(record.length_bytes(), Some(1024));
    }

    #[test]
    fn parse_line_rejects_blank_and_braceless() {
        assert!(parse_cdx_line("").is_none());
        assert!(parse_cdx_line("   ").is_none());
        assert!(parse_cdx_line("com,example)/a 20240101 no json here").is_none());
    }

    #[test]
    fn parse_line_rejects_malformed_json() {
        assert!(parse_cdx_line("surt ts {not valid json").is_none());
        assert!(parse_cdx_line("surt ts {\"url\": }").is_none());
    }

    #[test]
    fn parse_line_rejects_wrong_status() {
        let line = record_json("https://example.com/a.docx", 0).replace("\"200\"", "\"301\"");
        assert!(parse_cdx_line(&format!("surt ts {}", line)).is_none());
    }

    #[test]
    fn parse_line_rejects_wrong_mime() {
        let line = record_json("https://example.com/a.docx", 0).replace(WORD_MIME, "application/pdf");
        assert!(parse_cdx_line(&format!("surt ts {}", line)).is_none());
    }

    #[test]
    fn parse_line_tolerates_extra_fields() {
        let line = format!(
            "surt ts {{\"url\":\"u\",\"mime\":\"{}\",\"status\":\"200\",\"digest\":\"D\",\
             \"length\":\"5\",\"offset\":\"0\",\"filename\":\"f\",\"languages\":\"eng\"}}",
            WORD_MIME
        );
        assert!(parse_cdx_line(&line).is_some());
    }

    #[tokio::test]
    async fn stream_reads_shards_in_listing_order() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store
            .write(
                "cdx-filtered/CC-2024-01/00.jsonl",
                format!(
                    "{}\n{}\n",
                    record_json("https://a.example/1.docx", 0),
                    record_json("https://a.example/2.docx", 100)
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        store
            .write(
                "cdx-filtered/CC-2024-01/01.jsonl",
                format!("{}\n", record_json("https://b.example/3.docx", 200)).as_bytes(),
            )
            .await
            .unwrap();
        // A non-shard key under the prefix is ignored.
        store
            .write("cdx-filtered/CC-2024-01/notes.txt", b"ignore me")
            .await
            .unwrap();

        let mut stream = CdxStream::open(&store, "CC-2024-01").await.unwrap();
        let mut urls = Vec::new();
        while let Some(record) = stream.next().await.unwrap() {
            urls.push(record.url);
        }
        assert_eq!(
            urls,
            vec![
                "https://a.example/1.docx",
                "https://a.example/2.docx",
                "https://b.example/3.docx"
            ]
        );
    }

    #[tokio::test]
    async fn stream_skips_blank_and_malformed_lines() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store
            .write(
                "cdx-filtered/C/00.jsonl",
                format!(
                    "\n  \nnot json\n{}\n",
                    record_json("https://a.example/ok.docx", 0)
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut stream = CdxStream::open(&store, "C").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.url, "https://a.example/ok.docx");
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_is_empty_for_unknown_crawl() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let mut stream = CdxStream::open(&store, "nope").await.unwrap();
        assert!(stream.next().await.unwrap().is_none());
    }
}
