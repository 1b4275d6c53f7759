//! Resumable background crawler (spec.md §4.G, component G) and its
//! lease-expirer subclass (spec.md §4.H, component H), plus the versioned
//! on-disk state serializer (spec.md §3.5/§4.H, component I) shared by both.
//!
//! This crate depends on `storage-core` only for `StorageServer::basedir`
//! and `StorageServer::lock_si` — the per-SI mutex that keeps a crawl step
//! from observing a bucket mid-write (SPEC_FULL.md §5).

pub mod crawler;
pub mod error;
pub mod expirer;
pub mod state;

pub use crawler::{BucketVisitor, CrawlerTiming, PREFIX_COUNT, ShareCrawler, prefix_order};
pub use error::{CrawlerError, Result};
pub use expirer::{ExpirationMode, ExpirerConfig, LeaseExpirer, ShareTypeFilter};
pub use state::{CrawlerHistory, CrawlerState, migrate_legacy_pickle_file};
