//! Application settings, resolved from the environment.
//!
//! Every knob has a default so a bare `docxharvest scrape` works against
//! the local filesystem. Blob backend selection: when all three R2
//! credential variables are non-empty the S3-compatible backend is used,
//! otherwise blobs live under `STORAGE_PATH`.

use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limit::RateLimiterConfig;
use crate::storage::R2Config;

/// Default local root for blobs and the database.
const DEFAULT_STORAGE_PATH: &str = "data";

/// Default database filename under the storage root.
const DEFAULT_DATABASE_FILENAME: &str = "docxharvest.db";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Crawl id override; empty means resolve the latest from upstream.
    pub crawl_id: Option<String>,
    /// Scrape worker count, clamped to 1..=50.
    pub concurrency: usize,
    pub rate_limit: RateLimiterConfig,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Retry budget for rate-limited and transient failures.
    pub max_retries: u32,
    /// Ceiling on one exponential-backoff sleep.
    pub max_backoff: Duration,
    /// Local blob/database root.
    pub storage_path: PathBuf,
    /// Database URL; `sqlite:<path>` or a bare path. Defaults to
    /// `<storage_path>/docxharvest.db`.
    pub database_url: Option<String>,
    /// S3-compatible backend, when fully configured.
    pub r2: Option<R2Config>,
    pub extract_input_prefix: String,
    pub extract_output_prefix: String,
    pub extract_batch_size: usize,
    pub extract_workers: usize,
    /// Command line used to spawn the extraction subprocess.
    pub extractor_cmd: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            crawl_id: None,
            concurrency: 10,
            rate_limit: RateLimiterConfig::default(),
            timeout: Duration::from_millis(45_000),
            max_retries: 3,
            max_backoff: Duration::from_secs(64),
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            database_url: None,
            r2: None,
            extract_input_prefix: "documents".to_string(),
            extract_output_prefix: "extracted".to_string(),
            extract_batch_size: 100,
            extract_workers: 2,
            extractor_cmd: "python3 extract_server.py".to_string(),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_nonempty(name).and_then(|v| v.parse().ok())
}

impl Settings {
    /// Read settings from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        settings.crawl_id = env_nonempty("CRAWL_ID");
        if let Some(c) = env_parse::<usize>("CONCURRENCY") {
            settings.concurrency = c.clamp(1, 50);
        }
        if let Some(rps) = env_parse::<f64>("RATE_LIMIT_RPS") {
            settings.rate_limit.initial_rps = rps;
        }
        if let Some(rps) = env_parse::<f64>("MIN_RPS") {
            settings.rate_limit.min_rps = rps;
        }
        if let Some(rps) = env_parse::<f64>("MAX_RPS") {
            settings.rate_limit.max_rps = rps;
        }
        if let Some(ms) = env_parse::<u64>("TIMEOUT_MS") {
            settings.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("MAX_RETRIES") {
            settings.max_retries = n.clamp(3, 10);
        }
        if let Some(ms) = env_parse::<u64>("MAX_BACKOFF_MS") {
            settings.max_backoff = Duration::from_millis(ms);
        }
        if let Some(path) = env_nonempty("STORAGE_PATH") {
            settings.storage_path = PathBuf::from(path);
        }
        settings.database_url = env_nonempty("DATABASE_URL");

        let account_id = env_nonempty("CLOUDFLARE_ACCOUNT_ID");
        let access_key_id = env_nonempty("R2_ACCESS_KEY_ID");
        let secret_access_key = env_nonempty("R2_SECRET_ACCESS_KEY");
        if let (Some(account_id), Some(access_key_id), Some(secret_access_key)) =
            (account_id, access_key_id, secret_access_key)
        {
            settings.r2 = Some(R2Config {
                account_id,
                access_key_id,
                secret_access_key,
                bucket: env_nonempty("R2_BUCKET_NAME").unwrap_or_else(|| "docxharvest".to_string()),
            });
        }

        if let Some(prefix) = env_nonempty("EXTRACT_INPUT_PREFIX") {
            settings.extract_input_prefix = prefix;
        }
        if let Some(prefix) = env_nonempty("EXTRACT_OUTPUT_PREFIX") {
            settings.extract_output_prefix = prefix;
        }
        if let Some(n) = env_parse::<usize>("EXTRACT_BATCH_SIZE") {
            settings.extract_batch_size = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("EXTRACT_WORKERS") {
            settings.extract_workers = n.max(1);
        }
        if let Some(cmd) = env_nonempty("EXTRACTOR_CMD") {
            settings.extractor_cmd = cmd;
        }

        settings
    }

    /// Filesystem path of the SQLite database.
    ///
    /// Accepts `sqlite:<path>` URLs or bare paths in `DATABASE_URL`.
    pub fn database_path(&self) -> PathBuf {
        match &self.database_url {
            Some(url) => {
                let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"));
                PathBuf::from(path.unwrap_or(url))
            }
            None => self.storage_path.join(DEFAULT_DATABASE_FILENAME),
        }
    }

    /// Whether the S3-compatible backend is selected.
    pub fn uses_remote_blobs(&self) -> bool {
        self.r2.is_some()
    }

    /// Ensure the local storage root exists.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage_path)
    }
}
