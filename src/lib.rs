//! RadixDB — an embedded `i64 → i64` ordered index: an adaptive radix tree
//! used as a point-lookup cache in front of a disk-backed B+-tree whose
//! pages are managed by a fixed-capacity buffer pool over a single file.

pub mod btree;
pub mod cache;
pub mod config;
pub mod db;
pub mod storage;

// re export for convenience.
pub use anyhow::Result;
pub use config::Config;
pub use db::DataManager;

/// Reserved sentinel meaning "key absent" across the whole API.
/// Callers must not insert it as a value.
pub const ABSENT: i64 = i64::MIN;

/// Page size instantiated by the driver binary. Tests use smaller pages to
/// force splits with few keys.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
