//! CLI commands implementation.

mod extract_cmd;
mod manifest_cmd;
mod scrape_cmd;
mod status_cmd;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::repository::SqliteMetadataStore;
use crate::storage::{BlobStore, LocalBlobStore, R2BlobStore};

#[derive(Parser)]
#[command(name = "docxharvest")]
#[command(about = "Content-addressed .docx corpus harvester for Common Crawl archives")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest validated .docx payloads for one or more crawls
    Scrape {
        /// Explicit crawl id (repeatable); default resolves the latest
        #[arg(long = "crawl")]
        crawls: Vec<String>,
        /// How many of the newest crawls to process when none are given
        #[arg(long, default_value = "1")]
        latest: usize,
        /// Worker pool size (overrides CONCURRENCY)
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Stop a crawl after this many uploads (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        batch_size: usize,
        /// Ignore the uploaded-URL set and reprocess everything
        #[arg(long)]
        force: bool,
    },

    /// Run text extraction over uploaded documents
    Extract {
        /// Extractor subprocess count (overrides EXTRACT_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Maximum documents this run (overrides EXTRACT_BATCH_SIZE)
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Write the sorted manifest of uploaded hashes
    Manifest,

    /// Show document and extraction counts
    Status,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    settings.ensure_directories()?;

    match cli.command {
        Commands::Scrape {
            crawls,
            latest,
            concurrency,
            batch_size,
            force,
        } => scrape_cmd::run(settings, crawls, latest, concurrency, batch_size, force).await,
        Commands::Extract {
            workers,
            batch_size,
        } => extract_cmd::run(settings, workers, batch_size).await,
        Commands::Manifest => manifest_cmd::run(settings).await,
        Commands::Status => status_cmd::run(settings).await,
    }
}

/// Select the blob backend: R2 when credentials are configured, the
/// local filesystem otherwise.
fn build_blob_store(settings: &Settings) -> Arc<dyn BlobStore> {
    match &settings.r2 {
        Some(r2) => {
            tracing::info!("using R2 blob store (bucket {})", r2.bucket);
            Arc::new(R2BlobStore::new(r2.clone(), reqwest::Client::new()))
        }
        None => {
            tracing::info!("using local blob store at {}", settings.storage_path.display());
            Arc::new(LocalBlobStore::new(settings.storage_path.clone()))
        }
    }
}

/// Open the metadata database configured by `DATABASE_URL` or the
/// storage root.
fn open_metadata_store(settings: &Settings) -> anyhow::Result<Arc<SqliteMetadataStore>> {
    let path = settings.database_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteMetadataStore::open(&path)?))
}
