//! docxharvest - content-addressed .docx corpus harvester.
//!
//! Assembles a deduplicated corpus of Word documents from a monthly
//! public web archive: streams pre-filtered CDX index records, fetches
//! archive-record byte ranges under an adaptive rate limit, validates
//! and hashes each payload, stores it once per unique content hash, and
//! records provenance in a relational store. A companion extract
//! pipeline drives a pool of long-lived external extractor subprocesses
//! over the uploaded set.

// Model types use `from_str` methods that return Option<Self>, not the
// Result std::str::FromStr requires.
#![allow(clippy::should_implement_trait)]

pub mod cdx;
pub mod cli;
pub mod config;
pub mod crawls;
pub mod fetch;
pub mod models;
pub mod rate_limit;
pub mod repository;
pub mod services;
pub mod storage;
pub mod validate;
