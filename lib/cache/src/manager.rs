use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs_err as fs;
use parking_lot::Mutex;
use pool::{AccessMode, WorkerPool};

use crate::body_store::BodyStore;
use crate::config::{CacheBudgets, CacheConfig};
use crate::content_id::ContentId;
use crate::deletion::DeletionQueue;
use crate::entry::{body_size_for, INLINE_HEADER_SIZE};
use crate::error::{CacheError, CacheResult};
use crate::index::{CacheIndex, EntryUpdate};
use crate::raster::Raster;
use crate::slot_file::SlotFile;
use crate::thumbnail::ThumbnailStore;

pub const ENTRIES_FILE: &str = "texture.entries";
pub const HEADERS_FILE: &str = "texture.cache";
pub const THUMBNAILS_FILE: &str = "texture.thumbs";

/// Deferred stamp refreshes are written out at least this often, when the cache is idle.
const STAMP_FLUSH_INTERVAL: Duration = Duration::from_secs(300);
/// Rotation step of the validated id window, out of 256 leading-byte values.
const VALIDATE_STEP: u8 = 8;
/// Leading-byte values validated per purge pass.
const VALIDATE_WIDTH: u16 = 4;

pub type ReadCallback = Box<dyn FnOnce(CacheResult<Option<CacheRead>>) + Send + 'static>;
pub type WriteCallback = Box<dyn FnOnce(CacheResult<WriteOutcome>) + Send + 'static>;
pub type FileCallback = Box<dyn FnOnce(CacheResult<Vec<u8>>) + Send + 'static>;

/// Bytes served from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRead {
    pub data: Vec<u8>,
    /// Logical size of the whole asset.
    pub image_size: i32,
    /// The cache holds the asset up to its end.
    pub have_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// The cache already held at least as much data.
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: u32,
    pub body_bytes: u64,
    pub max_body_bytes: u64,
    pub pending_deletions: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
}

/// Disk cache of texture payloads.
///
/// Synchronous operations may be called from any thread; the `*_async` variants run on the
/// cache's worker pool, where reads of an id may overlap but writes of an id run alone.
pub struct CacheManager {
    inner: Arc<CacheInner>,
    pool: Mutex<Option<WorkerPool<ContentId>>>,
}

struct CacheInner {
    read_only: bool,
    budgets: CacheBudgets,
    bodies: BodyStore,
    state: Mutex<CacheState>,
    purge_requested: AtomicBool,
    counters: Counters,
}

struct CacheState {
    index: CacheIndex,
    headers: SlotFile,
    thumbnails: ThumbnailStore,
    deletions: DeletionQueue,
    validate_cursor: u8,
    last_stamp_flush: Instant,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl CacheManager {
    /// Open or create the cache under `config.storage_path`.
    ///
    /// Returns the manager and the part of the byte budget it doesn't use.
    pub fn init(config: &CacheConfig) -> CacheResult<(Self, u64)> {
        let (budgets, remaining) = CacheBudgets::compute(config);
        let root = config.storage_path.as_path();
        log::info!(
            "Texture cache at {}: {} entries, bodies up to {} MB",
            root.display(),
            budgets.max_entries,
            budgets.max_body_bytes / (1024 * 1024),
        );

        let bodies = BodyStore::new(root);
        if !config.read_only {
            fs::create_dir_all(root)?;
            bodies.create_dirs()?;
        }

        let state = CacheState::open(root, &budgets, &bodies, config.read_only)?;
        let inner = Arc::new(CacheInner {
            read_only: config.read_only,
            budgets,
            bodies,
            state: Mutex::new(state),
            purge_requested: AtomicBool::new(false),
            counters: Counters::default(),
        });

        // Make room if needed and check a slice of the body files
        inner.purge(true)?;

        let pool = WorkerPool::new(config.worker_threads, "texture-cache")?;
        let manager = Self {
            inner,
            pool: Mutex::new(Some(pool)),
        };
        Ok((manager, remaining))
    }

    pub fn root(&self) -> &Path {
        self.inner.bodies.root()
    }

    pub fn budgets(&self) -> CacheBudgets {
        self.inner.budgets
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn body_path(&self, id: &ContentId) -> PathBuf {
        self.inner.bodies.path(id)
    }

    pub fn read(
        &self,
        id: ContentId,
        offset: usize,
        size: usize,
    ) -> CacheResult<Option<CacheRead>> {
        self.inner.read(id, offset, size)
    }

    pub fn write(
        &self,
        id: ContentId,
        payload: &[u8],
        image_size: i32,
        raster: Option<&Raster>,
    ) -> CacheResult<WriteOutcome> {
        self.inner.write(id, payload, image_size, raster)
    }

    /// Forget `id`. Unknown ids are fine.
    pub fn remove(&self, id: ContentId) -> CacheResult<bool> {
        self.inner.remove(id)
    }

    /// Evict oldest entries until body bytes are under the purge threshold.
    ///
    /// With `validate`, body files of a rotating slice of ids are checked against their
    /// recorded sizes and mismatching entries are evicted too.
    pub fn purge(&self, validate: bool) -> CacheResult<usize> {
        self.inner.purge(validate)
    }

    pub fn read_async(
        &self,
        id: ContentId,
        offset: usize,
        size: usize,
        on_done: impl FnOnce(CacheResult<Option<CacheRead>>) + Send + 'static,
    ) {
        let on_done: ReadCallback = Box::new(on_done);
        let inner = self.inner.clone();
        let pool = self.pool.lock();
        match pool.as_ref() {
            Some(pool) => pool.submit(id, AccessMode::Shared, move || {
                on_done(inner.read(id, offset, size));
            }),
            None => {
                drop(pool);
                on_done(Err(CacheError::cancelled("texture cache is shut down")));
            }
        }
    }

    pub fn write_async(
        &self,
        id: ContentId,
        payload: Vec<u8>,
        image_size: i32,
        raster: Option<Arc<Raster>>,
        on_done: impl FnOnce(CacheResult<WriteOutcome>) + Send + 'static,
    ) {
        let on_done: WriteCallback = Box::new(on_done);
        let inner = self.inner.clone();
        let pool = self.pool.lock();
        match pool.as_ref() {
            Some(pool) => pool.submit(id, AccessMode::Exclusive, move || {
                let result = inner.write(id, &payload, image_size, raster.as_deref());
                on_done(result);
                if inner.purge_requested.load(Ordering::Relaxed) {
                    if let Err(err) = inner.purge(false) {
                        log::warn!("Texture cache purge failed: {err}");
                    }
                }
            }),
            None => {
                drop(pool);
                on_done(Err(CacheError::cancelled("texture cache is shut down")));
            }
        }
    }

    /// Read a whole file that lives outside the cache, on the cache workers.
    pub fn read_file_async(
        &self,
        id: ContentId,
        path: PathBuf,
        on_done: impl FnOnce(CacheResult<Vec<u8>>) + Send + 'static,
    ) {
        let on_done: FileCallback = Box::new(on_done);
        let pool = self.pool.lock();
        match pool.as_ref() {
            Some(pool) => pool.submit(id, AccessMode::Shared, move || {
                on_done(fs::read(&path).map_err(CacheError::from));
            }),
            None => {
                drop(pool);
                on_done(Err(CacheError::cancelled("texture cache is shut down")));
            }
        }
    }

    pub fn read_thumbnail(&self, id: ContentId) -> CacheResult<Option<Raster>> {
        let mut state = self.inner.state.lock();
        let Some((slot, _)) = state.index.lookup(&id) else {
            return Ok(None);
        };
        Ok(state.thumbnails.read(slot)?)
    }

    pub fn is_in_cache(&self, id: &ContentId) -> bool {
        self.inner.state.lock().index.contains(id)
    }

    /// Bytes of `id` held by the cache.
    pub fn cached_size(&self, id: &ContentId) -> Option<usize> {
        let state = self.inner.state.lock();
        let size = state
            .index
            .live_entries()
            .find(|(_, entry)| entry.id == *id)
            .map(|(_, entry)| entry.cached_size());
        size
    }

    pub fn entry_count(&self) -> usize {
        self.inner.state.lock().index.live_count()
    }

    pub fn body_bytes(&self) -> u64 {
        self.inner.state.lock().index.body_bytes()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let counters = &self.inner.counters;
        CacheStats {
            entries: state.index.live_count(),
            max_entries: self.inner.budgets.max_entries,
            body_bytes: state.index.body_bytes(),
            max_body_bytes: self.inner.budgets.max_body_bytes,
            pending_deletions: state.deletions.len(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            writes: counters.writes.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Jobs queued or running on the worker pool.
    pub fn pending_jobs(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, WorkerPool::pending)
    }

    /// Periodic housekeeping: deferred deletions, stamp write-back, scheduled purges.
    pub fn update(&self) {
        let idle = self.pending_jobs() == 0;
        {
            let mut state = self.inner.state.lock();
            let CacheState {
                index, deletions, ..
            } = &mut *state;
            deletions.run_pass(false, |id| index.contains(id));

            if idle && state.last_stamp_flush.elapsed() >= STAMP_FLUSH_INTERVAL {
                if let Err(err) = self.inner.flush_locked(&mut state) {
                    log::warn!("Failed to write texture cache entries: {err}");
                }
            }
        }

        if self.inner.purge_requested.load(Ordering::Relaxed) {
            if let Err(err) = self.inner.purge(false) {
                log::warn!("Texture cache purge failed: {err}");
            }
        }
    }

    /// Write deferred stamp refreshes now.
    pub fn flush_updated_entries(&self) -> CacheResult<usize> {
        let mut state = self.inner.state.lock();
        self.inner.flush_locked(&mut state)
    }

    /// Run deferred deletions, ignoring the time slicing when `force` is set.
    pub fn process_deletions(&self, force: bool) -> usize {
        let mut state = self.inner.state.lock();
        let CacheState {
            index, deletions, ..
        } = &mut *state;
        deletions.run_pass(force, |id| index.contains(id))
    }

    /// Drop all cached content.
    pub fn clear(&self) -> CacheResult<()> {
        if self.inner.read_only {
            return Err(CacheError::ReadOnly);
        }
        let mut state = self.inner.state.lock();
        self.inner.wipe_locked(&mut state)
    }

    /// Finish queued operations, stop the workers and persist what is pending. Idempotent.
    pub fn shutdown(&self) {
        let pool = self.pool.lock().take();
        let Some(mut pool) = pool else {
            return;
        };
        pool.stop();

        if let Err(err) = self.flush_updated_entries() {
            log::warn!("Failed to write texture cache entries on shutdown: {err}");
        }
        self.process_deletions(true);
        log::debug!("Texture cache is shut down");
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CacheState {
    fn open(
        root: &Path,
        budgets: &CacheBudgets,
        bodies: &BodyStore,
        read_only: bool,
    ) -> CacheResult<Self> {
        let (index, report) =
            CacheIndex::open(&root.join(ENTRIES_FILE), budgets.max_entries, read_only)?;
        let mut headers = SlotFile::open(&root.join(HEADERS_FILE), INLINE_HEADER_SIZE, read_only)?;
        let mut thumbnails = ThumbnailStore::open(&root.join(THUMBNAILS_FILE), read_only)?;

        if !read_only {
            if report.reset {
                headers.truncate(0)?;
                thumbnails.truncate(0)?;
                bodies.remove_all(false)?;
            } else if !report.moves.is_empty() || !report.removed.is_empty() {
                for &(from, to) in &report.moves {
                    if let Err(err) = headers.copy_slot(from, to) {
                        log::warn!("Failed to move texture header {from} -> {to}: {err}");
                    }
                    if thumbnails.copy_slot(from, to).is_err() {
                        // A thumbnail is optional, drop it instead
                        if let Err(err) = thumbnails.clear_slot(to) {
                            log::warn!("Failed to clear texture thumbnail {to}: {err}");
                        }
                    }
                }
                headers.truncate(index.slot_count())?;
                thumbnails.truncate(index.slot_count())?;
                // A duplicated id keeps its body for the surviving record
                for id in report.removed.iter().filter(|id| !index.contains(id)) {
                    if let Err(err) = bodies.remove(id) {
                        log::warn!("Failed to delete body of {id}: {err}");
                    }
                }
            }
        }

        Ok(Self {
            index,
            headers,
            thumbnails,
            deletions: DeletionQueue::default(),
            validate_cursor: 0,
            last_stamp_flush: Instant::now(),
        })
    }
}

impl CacheInner {
    fn read(&self, id: ContentId, offset: usize, size: usize) -> CacheResult<Option<CacheRead>> {
        let mut state = self.state.lock();
        let Some((slot, entry)) = state.index.lookup(&id) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        state.index.touch(slot);

        let image_size = entry.image_size;
        let cached = entry.cached_size();
        let end = cached.min(offset.saturating_add(size));
        if offset >= end {
            return Ok(Some(CacheRead {
                data: Vec::new(),
                image_size,
                have_all: offset >= image_size as usize,
            }));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(end - offset)?;

        if offset < INLINE_HEADER_SIZE {
            let header_end = end.min(INLINE_HEADER_SIZE);
            match state.headers.read(slot, offset, header_end - offset) {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(err) => {
                    log::warn!("Texture {id}: incorrect number of bytes read from header: {err}");
                    drop(state);
                    self.discard_corrupted(id);
                    return Ok(None);
                }
            }
        }
        drop(state);

        if end > INLINE_HEADER_SIZE {
            let body_start = offset.max(INLINE_HEADER_SIZE);
            let body_offset = (body_start - INLINE_HEADER_SIZE) as u64;
            match self.bodies.read(&id, body_offset, end - body_start) {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(err) => {
                    log::debug!("Texture {id}: incorrect number of bytes read from body: {err}");
                    self.discard_corrupted(id);
                    return Ok(None);
                }
            }
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(CacheRead {
            data,
            image_size,
            have_all: end >= image_size as usize,
        }))
    }

    fn write(
        &self,
        id: ContentId,
        payload: &[u8],
        image_size: i32,
        raster: Option<&Raster>,
    ) -> CacheResult<WriteOutcome> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        let data_size = payload.len();
        // A partial payload must fill the inline header: its length isn't recorded anywhere
        let partial_too_short = data_size < INLINE_HEADER_SIZE && data_size != image_size as usize;
        if data_size == 0 || image_size < data_size as i32 || partial_too_short {
            return Err(CacheError::InvalidWrite {
                id,
                data_size,
                image_size,
            });
        }
        let body_size = body_size_for(data_size);

        let mut state = self.state.lock();
        let (slot, is_new) = match state.index.lookup(&id) {
            Some((slot, _)) => (slot, false),
            None => {
                let allocation = self.index_op(&mut state, |index| index.allocate())?;
                if let Some(evicted) = allocation.evicted {
                    log::debug!("Texture {} evicted to reuse its slot", evicted.id);
                    state.deletions.schedule(evicted.id, self.bodies.path(&evicted.id));
                }
                (allocation.slot, true)
            }
        };

        let update = self.index_op(&mut state, |index| {
            index.update(slot, id, image_size, body_size)
        });
        match update {
            Ok(EntryUpdate::Unchanged) => return Ok(WriteOutcome::Unchanged),
            Ok(EntryUpdate::Updated) => {}
            Err(err) => {
                if is_new && !err.is_index_corruption() {
                    state.index.release(slot);
                }
                return Err(err);
            }
        }

        let inline = &payload[..data_size.min(INLINE_HEADER_SIZE)];
        if let Err(err) = state.headers.write(slot, inline) {
            log::warn!("Unable to write header entry for texture {id}: {err}");
            drop(state);
            self.discard_corrupted(id);
            return Err(CacheError::entry_corrupted(id, err.to_string()));
        }

        match raster {
            Some(raster) => {
                if let Err(err) = state.thumbnails.write(slot, raster) {
                    log::debug!("No thumbnail stored for {id}: {err}");
                }
            }
            None if is_new => {
                if let Err(err) = state.thumbnails.clear_slot(slot) {
                    log::warn!("Unable to clear stale thumbnail of texture {id}: {err}");
                }
            }
            None => {}
        }

        if state.index.body_bytes() > self.budgets.max_body_bytes {
            self.purge_requested.store(true, Ordering::Relaxed);
        }
        drop(state);

        if data_size > INLINE_HEADER_SIZE {
            if let Err(err) = self.bodies.write(&id, &payload[INLINE_HEADER_SIZE..]) {
                log::warn!("Texture {id}: failed to write body: {err}");
                self.discard_corrupted(id);
                return Err(CacheError::entry_corrupted(id, err.to_string()));
            }
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(WriteOutcome::Stored)
    }

    fn remove(&self, id: ContentId) -> CacheResult<bool> {
        if self.read_only {
            return Ok(false);
        }
        let removed = {
            let mut state = self.state.lock();
            self.index_op(&mut state, |index| index.remove(&id))?
        };
        // Attempt it even for unknown ids, a stray file may be left from a failed write
        if let Err(err) = self.bodies.remove(&id) {
            log::warn!("Failed to delete body of {id}: {err}");
        }
        Ok(removed.is_some())
    }

    fn purge(&self, validate: bool) -> CacheResult<usize> {
        self.purge_requested.store(false, Ordering::Relaxed);
        if self.read_only {
            return Ok(0);
        }

        let mut state = self.state.lock();
        let total = state.index.body_bytes();
        if !validate && total < self.budgets.max_body_bytes {
            return Ok(0);
        }

        let window = validate.then(|| {
            let start = state.validate_cursor;
            state.validate_cursor = start.wrapping_add(VALIDATE_STEP);
            log::debug!("Validating ids starting with bytes {start}..{}", u16::from(start) + VALIDATE_WIDTH);
            u16::from(start)..u16::from(start) + VALIDATE_WIDTH
        });

        let target = self.budgets.purge_target();
        let mut cache_size = total;
        let mut to_evict = Vec::new();
        for (slot, entry) in state.index.purge_candidates() {
            let evict = if cache_size >= target {
                true
            } else if let Some(window) = &window {
                window.contains(&u16::from(entry.id.first_byte()))
                    && self.body_size_mismatch(&entry.id, entry.body_size)
            } else {
                break;
            };
            if evict {
                cache_size = cache_size.saturating_sub(entry.body_size as u64);
                to_evict.push(slot);
            }
        }

        if to_evict.is_empty() {
            log::debug!("Nothing to purge from the texture cache");
            return Ok(0);
        }

        let evicted = self.index_op(&mut state, |index| index.evict_slots(&to_evict))?;
        for entry in &evicted {
            state
                .deletions
                .schedule(entry.id, self.bodies.path(&entry.id));
        }
        state.deletions.reset_timer();

        log::info!(
            "Purged {} textures, cache size {} MB, {} files scheduled for deletion",
            evicted.len(),
            state.index.body_bytes() / (1024 * 1024),
            state.deletions.len(),
        );
        Ok(evicted.len())
    }

    fn body_size_mismatch(&self, id: &ContentId, body_size: i32) -> bool {
        let actual = match self.bodies.file_size(id) {
            Ok(size) => size.unwrap_or(0),
            Err(err) => {
                log::warn!("Can't check body of {id}: {err}");
                return true;
            }
        };
        if actual != body_size as u64 {
            log::warn!(
                "Purging corrupted cached texture {id} (body size {actual} != {body_size})"
            );
            return true;
        }
        false
    }

    fn flush_locked(&self, state: &mut CacheState) -> CacheResult<usize> {
        state.last_stamp_flush = Instant::now();
        self.index_op(state, |index| index.flush_updated_entries())
    }

    /// Evict a single inconsistent entry.
    fn discard_corrupted(&self, id: ContentId) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.remove(id) {
            log::warn!("Failed to remove corrupted texture {id}: {err}");
        }
    }

    /// Run an index operation, wiping the whole cache if the index turns out corrupted.
    fn index_op<T>(
        &self,
        state: &mut CacheState,
        op: impl FnOnce(&mut CacheIndex) -> CacheResult<T>,
    ) -> CacheResult<T> {
        let result = op(&mut state.index);
        if let Err(err) = &result {
            if err.is_index_corruption() {
                log::warn!("The texture cache is corrupted, clearing it: {err}");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                if let Err(wipe_err) = self.wipe_locked(state) {
                    log::error!("Failed to clear the texture cache: {wipe_err}");
                }
            }
        }
        result
    }

    fn wipe_locked(&self, state: &mut CacheState) -> CacheResult<()> {
        state.index.clear()?;
        state.headers.truncate(0)?;
        state.thumbnails.truncate(0)?;
        self.bodies.remove_all(false)?;
        self.bodies.create_dirs()?;
        log::info!("The entire texture cache is cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{Builder, TempDir};

    use super::*;

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn open_cache(dir: &TempDir, config: impl FnOnce(&mut CacheConfig)) -> CacheManager {
        let mut cfg = CacheConfig::new(dir.path(), 64 * 1024 * 1024);
        config(&mut cfg);
        CacheManager::init(&cfg).unwrap().0
    }

    #[test]
    fn test_read_past_cached_data() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let cache = open_cache(&dir, |_| {});
        let id = ContentId::new_random();
        let data = payload(3000, 1);
        cache.write(id, &data, 10_000, None).unwrap();

        let read = cache.read(id, 0, 8000).unwrap().unwrap();
        assert_eq!(read.data, data);
        assert!(!read.have_all);
        assert_eq!(read.image_size, 10_000);

        // Offset read entirely inside the body
        let read = cache.read(id, 2000, 500).unwrap().unwrap();
        assert_eq!(read.data, &data[2000..2500]);

        // Offset read straddling the inline header
        let read = cache.read(id, 1000, 100).unwrap().unwrap();
        assert_eq!(read.data, &data[1000..1100]);
    }

    #[test]
    fn test_small_complete_asset_has_no_body() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let cache = open_cache(&dir, |_| {});
        let id = ContentId::new_random();
        let data = payload(700, 2);
        cache.write(id, &data, 700, None).unwrap();

        assert!(!cache.body_path(&id).exists());
        let read = cache.read(id, 0, 4096).unwrap().unwrap();
        assert_eq!(read.data, data);
        assert!(read.have_all);
    }

    #[test]
    fn test_invalid_writes() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let cache = open_cache(&dir, |_| {});
        let id = ContentId::new_random();

        assert!(matches!(
            cache.write(id, &[], 10, None),
            Err(CacheError::InvalidWrite { .. })
        ));
        assert!(matches!(
            cache.write(id, &payload(2000, 0), 1000, None),
            Err(CacheError::InvalidWrite { .. })
        ));
        // Partial payload that doesn't fill the inline header
        assert!(matches!(
            cache.write(id, &payload(600, 0), 5000, None),
            Err(CacheError::InvalidWrite { .. })
        ));
        assert!(!cache.is_in_cache(&id));
    }

    #[test]
    fn test_write_never_shrinks() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let cache = open_cache(&dir, |_| {});
        let id = ContentId::new_random();
        let full = payload(5000, 3);

        assert_eq!(
            cache.write(id, &full, 5000, None).unwrap(),
            WriteOutcome::Stored
        );
        assert_eq!(
            cache.write(id, &full[..2000], 5000, None).unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(cache.read(id, 0, 5000).unwrap().unwrap().data, full);
        assert_eq!(cache.cached_size(&id), Some(5000));
    }

    #[test]
    fn test_truncated_body_evicts_entry() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let cache = open_cache(&dir, |_| {});
        let id = ContentId::new_random();
        cache.write(id, &payload(4096, 4), 8192, None).unwrap();

        std::fs::write(cache.body_path(&id), b"short").unwrap();

        assert_eq!(cache.read(id, 0, 4096).unwrap(), None);
        assert!(!cache.is_in_cache(&id));
        assert_eq!(cache.stats().errors, 1);
    }

    #[test]
    fn test_thumbnail_roundtrip() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let cache = open_cache(&dir, |_| {});
        let id = ContentId::new_random();
        let raster = Raster::new(32, 32, 3, vec![9; 32 * 32 * 3]);
        cache
            .write(id, &payload(2048, 5), 4096, Some(&raster))
            .unwrap();

        let thumb = cache.read_thumbnail(id).unwrap().unwrap();
        assert_eq!((thumb.width, thumb.height), (16, 16));
        assert_eq!(cache.read_thumbnail(ContentId::new_random()).unwrap(), None);
    }

    #[test]
    fn test_version_mismatch_wipes_bodies() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let id = ContentId::new_random();
        let body_path;
        {
            let cache = open_cache(&dir, |_| {});
            cache.write(id, &payload(4096, 6), 4096, None).unwrap();
            body_path = cache.body_path(&id);
            assert!(body_path.exists());
        }

        let entries = dir.path().join(ENTRIES_FILE);
        let mut bytes = std::fs::read(&entries).unwrap();
        bytes[4..8].copy_from_slice(&32u32.to_le_bytes());
        std::fs::write(&entries, bytes).unwrap();

        let cache = open_cache(&dir, |_| {});
        assert!(!cache.is_in_cache(&id));
        assert!(!body_path.exists());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_read_only_cache() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let id = ContentId::new_random();
        let data = payload(3000, 7);
        {
            let cache = open_cache(&dir, |_| {});
            cache.write(id, &data, 3000, None).unwrap();
        }

        let cache = open_cache(&dir, |cfg| cfg.read_only = true);
        assert_eq!(cache.read(id, 0, 3000).unwrap().unwrap().data, data);
        assert!(matches!(
            cache.write(ContentId::new_random(), &data, 3000, None),
            Err(CacheError::ReadOnly)
        ));
        assert!(!cache.remove(id).unwrap());
        assert!(cache.is_in_cache(&id));
    }

    #[test]
    fn test_async_operations_complete() {
        let dir = Builder::new().prefix("cache_manager").tempdir().unwrap();
        let cache = open_cache(&dir, |_| {});
        let id = ContentId::new_random();
        let data = payload(5000, 8);

        let (tx, rx) = std::sync::mpsc::channel();
        cache.write_async(id, data.clone(), 5000, None, move |res| {
            tx.send(res.unwrap()).unwrap();
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            WriteOutcome::Stored
        );

        let (tx, rx) = std::sync::mpsc::channel();
        cache.read_async(id, 0, 5000, move |res| {
            tx.send(res.unwrap()).unwrap();
        });
        let read = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(read.data, data);

        cache.shutdown();
        let (tx, rx) = std::sync::mpsc::channel();
        cache.read_async(id, 0, 10, move |res| {
            tx.send(res.is_err()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
