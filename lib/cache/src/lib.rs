//! Persistent disk cache for texture payloads.
//!
//! An index of fixed-size records tracks every cached id. The first
//! [`entry::INLINE_HEADER_SIZE`] bytes of each payload live in a shared slot file, the rest in a
//! per-id body file. Eviction is least-recently-used, bounded by entry count and body bytes.

pub mod body_store;
pub mod config;
pub mod content_id;
pub mod deletion;
pub mod entry;
pub mod error;
pub mod index;
pub mod manager;
pub mod raster;
pub mod slot_file;
pub mod thumbnail;

pub use config::{CacheBudgets, CacheConfig};
pub use content_id::ContentId;
pub use entry::INLINE_HEADER_SIZE;
pub use error::{CacheError, CacheResult};
pub use manager::{CacheManager, CacheRead, CacheStats, WriteOutcome};
pub use raster::Raster;
