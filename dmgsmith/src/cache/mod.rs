//! Content-addressed update cache.
//!
//! Payloads are stored under their sha1 and only appear there after the
//! digest has been verified. [`download_all`] fills the cache one package at
//! a time; [`UpdateCache::prune_and_link`] keeps it in step with the active
//! update profile.

mod download;
mod storage;

#[cfg(feature = "http")]
pub use download::HttpFetcher;
pub use download::{DownloadEvent, FetchResponse, Fetcher, download_all};
pub use storage::{StagedDownload, UpdateCache, friendly_name};
pub(crate) use storage::validate_sha1;
