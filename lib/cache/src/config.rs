use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::entry::INLINE_HEADER_SIZE;
use crate::thumbnail::THUMBNAIL_SLOT_SIZE;

/// Hard cap on index slots, whatever the byte budget allows.
pub const DEFAULT_MAX_ENTRIES: u32 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CacheConfig {
    /// Directory holding the index, header data, thumbnails and body shards.
    pub storage_path: PathBuf,
    /// Total disk budget, split between index slots and body files.
    #[serde(default = "default_max_size_bytes")]
    #[validate(range(min = 1048576))]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_entries")]
    #[validate(range(min = 1))]
    pub max_entries: u32,
    /// Optional cap on body bytes, below what the split would allow.
    #[serde(default)]
    pub max_body_bytes: Option<u64>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_worker_threads")]
    #[validate(range(min = 1, max = 64))]
    pub worker_threads: usize,
    /// A purge evicts until body bytes drop below this share of the body budget.
    #[serde(default = "default_purge_threshold_percent")]
    #[validate(range(min = 1, max = 100))]
    pub purge_threshold_percent: u8,
}

impl CacheConfig {
    pub fn new(storage_path: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        Self {
            storage_path: storage_path.into(),
            max_size_bytes,
            max_entries: default_max_entries(),
            max_body_bytes: None,
            read_only: false,
            worker_threads: default_worker_threads(),
            purge_threshold_percent: default_purge_threshold_percent(),
        }
    }
}

/// Limits derived from a [`CacheConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudgets {
    pub max_entries: u32,
    pub max_body_bytes: u64,
    pub purge_threshold_percent: u8,
}

impl CacheBudgets {
    /// Split the byte budget: 36% for index slots, the rest for bodies.
    ///
    /// Returns the budgets and the part of `max_size_bytes` left unused.
    pub fn compute(config: &CacheConfig) -> (Self, u64) {
        let per_entry = (INLINE_HEADER_SIZE + THUMBNAIL_SLOT_SIZE) as u64;

        let entries_budget = 9 * config.max_size_bytes / 25;
        let max_entries = (entries_budget / per_entry).min(u64::from(config.max_entries)) as u32;
        let mut remaining = config.max_size_bytes - u64::from(max_entries) * per_entry;

        let max_body_bytes = match config.max_body_bytes {
            Some(cap) if cap > 0 => cap.min(remaining),
            _ => remaining,
        };
        remaining -= max_body_bytes;

        let budgets = Self {
            max_entries,
            max_body_bytes,
            purge_threshold_percent: config.purge_threshold_percent,
        };
        (budgets, remaining)
    }

    /// Body bytes a purge reclaims down to.
    pub fn purge_target(&self) -> u64 {
        self.max_body_bytes * u64::from(self.purge_threshold_percent) / 100
    }
}

const fn default_max_size_bytes() -> u64 {
    512 * 1024 * 1024
}

const fn default_max_entries() -> u32 {
    DEFAULT_MAX_ENTRIES
}

const fn default_worker_threads() -> usize {
    2
}

const fn default_purge_threshold_percent() -> u8 {
    80
}
