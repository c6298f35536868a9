use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::body_store::remove_file;
use crate::content_id::ContentId;

const DELAY_BETWEEN_PASSES: Duration = Duration::from_secs(2);
const MAX_TIME_PER_PASS: Duration = Duration::from_millis(100);

/// Body files of evicted entries, deleted a few at a time.
#[derive(Debug)]
pub struct DeletionQueue {
    files: BTreeMap<ContentId, PathBuf>,
    last_pass: Instant,
    delay_between_passes: Duration,
    max_time_per_pass: Duration,
}

impl Default for DeletionQueue {
    fn default() -> Self {
        Self::with_timing(DELAY_BETWEEN_PASSES, MAX_TIME_PER_PASS)
    }
}

impl DeletionQueue {
    pub fn with_timing(delay_between_passes: Duration, max_time_per_pass: Duration) -> Self {
        Self {
            files: BTreeMap::new(),
            last_pass: Instant::now(),
            delay_between_passes,
            max_time_per_pass,
        }
    }

    pub fn schedule(&mut self, id: ContentId, path: PathBuf) {
        self.files.insert(id, path);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Postpone the next pass, e.g. right after a purge queued a batch.
    pub fn reset_timer(&mut self) {
        self.last_pass = Instant::now();
    }

    /// Delete queued files, skipping ids that are cached again.
    ///
    /// Unless `force` is set, runs only when the pass delay elapsed and stops once the time
    /// budget is spent. Returns the number of queue entries processed.
    pub fn run_pass(&mut self, force: bool, is_cached: impl Fn(&ContentId) -> bool) -> usize {
        if self.files.is_empty() {
            return 0;
        }
        if !force && self.last_pass.elapsed() <= self.delay_between_passes {
            return 0;
        }

        let started = Instant::now();
        let mut processed = 0;
        let mut deleted = 0;
        while let Some((id, path)) = self.files.pop_first() {
            processed += 1;
            if is_cached(&id) {
                log::debug!(
                    "{} selected for removal, but cached again since",
                    path.display()
                );
            } else {
                match remove_file(&path) {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(err) => log::warn!("Failed to delete {}: {err}", path.display()),
                }
            }
            if !force && started.elapsed() > self.max_time_per_pass {
                break;
            }
        }

        if self.files.is_empty() {
            log::info!(
                "Time-sliced purge finished with {deleted} files deleted in {:?}",
                started.elapsed(),
            );
        } else {
            log::info!(
                "Time-sliced purge: {deleted} files deleted in {:?} ({} files left for next pass)",
                started.elapsed(),
                self.files.len(),
            );
        }
        self.last_pass = Instant::now();
        processed
    }
}
