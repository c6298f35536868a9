//! The entries file: a header followed by one fixed-size record per slot.
//!
//! All records are mirrored in memory, keyed by slot index. Stamp refreshes caused by reads
//! are kept in a write-back map and only reach the file on [`CacheIndex::flush_updated_entries`];
//! every other change is written through immediately.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs_err::{File, OpenOptions};
use itertools::Itertools;

use crate::content_id::ContentId;
use crate::entry::{CacheEntry, IndexHeader, ENTRY_RECORD_SIZE, INDEX_HEADER_SIZE};
use crate::error::{CacheError, CacheResult};

/// Share of the maximum entry count kept in the LRU hint set.
const LRU_HINT_PERCENT: u32 = 10;
/// Below this fill ratio reads don't refresh stamps: slots are never reused while free ones remain.
const STAMP_REFRESH_FILL_PERCENT: u32 = 75;

/// Issues unique, increasing access stamps that follow wall-clock seconds when possible.
#[derive(Debug, Default)]
pub struct AccessClock {
    last: u32,
}

impl AccessClock {
    pub fn seeded(last: u32) -> Self {
        Self { last }
    }

    pub fn next(&mut self) -> u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0);
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }
}

/// What happened while loading the index, for the owner of the companion files.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// The index was unusable and has been reset. Every companion file must be wiped.
    pub reset: bool,
    /// Entries dropped during load; their body files must go.
    pub removed: Vec<ContentId>,
    /// Slot moves `(from, to)` performed by compaction, in ascending `to` order.
    pub moves: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryUpdate {
    /// Cache already holds at least as much data.
    Unchanged,
    Updated,
}

/// A slot handed out for a new id.
#[derive(Debug)]
pub struct Allocation {
    pub slot: u32,
    /// Entry evicted to make room for the new one.
    pub evicted: Option<CacheEntry>,
}

#[derive(Debug)]
pub struct CacheIndex {
    path: PathBuf,
    file: Option<File>,
    read_only: bool,
    max_entries: u32,
    slots: Vec<CacheEntry>,
    by_id: HashMap<ContentId, u32>,
    free: BTreeSet<u32>,
    lru_hint: BTreeSet<(u32, u32)>,
    updated_stamps: BTreeMap<u32, u32>,
    body_bytes: u64,
    clock: AccessClock,
}

impl CacheIndex {
    pub fn open(path: &Path, max_entries: u32, read_only: bool) -> CacheResult<(Self, LoadReport)> {
        let file = if read_only {
            match File::open(path) {
                Ok(file) => Some(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => return Err(err.into()),
            }
        } else {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?,
            )
        };

        let mut index = Self {
            path: path.to_path_buf(),
            file,
            read_only,
            max_entries,
            slots: Vec::new(),
            by_id: HashMap::new(),
            free: BTreeSet::new(),
            lru_hint: BTreeSet::new(),
            updated_stamps: BTreeMap::new(),
            body_bytes: 0,
            clock: AccessClock::default(),
        };
        let report = index.load()?;
        Ok((index, report))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Number of slots in use by the file, live or free.
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn live_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn pending_stamp_updates(&self) -> usize {
        self.updated_stamps.len()
    }

    /// Entry at `slot`, including a stamp refresh not yet flushed.
    pub fn entry(&self, slot: u32) -> Option<CacheEntry> {
        let mut entry = *self.slots.get(slot as usize)?;
        if let Some(stamp) = self.updated_stamps.get(&slot) {
            entry.last_access = *stamp;
        }
        Some(entry)
    }

    pub fn lookup(&mut self, id: &ContentId) -> Option<(u32, CacheEntry)> {
        let slot = *self.by_id.get(id)?;
        let entry = self.entry(slot)?;
        self.lru_hint.remove(&(entry.last_access, slot));
        Some((slot, entry))
    }

    pub fn live_entries(&self) -> impl Iterator<Item = (u32, CacheEntry)> + '_ {
        self.by_id
            .values()
            .filter_map(|&slot| self.entry(slot).map(|entry| (slot, entry)))
    }

    /// Refresh the stamp of a read entry. Deferred until the next flush.
    pub fn touch(&mut self, slot: u32) {
        if self.read_only {
            return;
        }
        let threshold =
            (u64::from(self.max_entries) * u64::from(STAMP_REFRESH_FILL_PERCENT) / 100) as u32;
        if self.slot_count() < threshold {
            return;
        }
        if self.slots.get(slot as usize).is_some_and(CacheEntry::is_live) {
            let stamp = self.clock.next();
            self.updated_stamps.insert(slot, stamp);
        }
    }

    /// Find a slot for a new id: append, reuse a free slot, or evict the oldest hinted entry.
    pub fn allocate(&mut self) -> CacheResult<Allocation> {
        if let Some(allocation) = self.try_allocate()? {
            return Ok(allocation);
        }
        // The hint set ran dry, refresh it from a full scan and try again
        self.rebuild_lru_hint();
        self.try_allocate()?
            .ok_or_else(|| CacheError::index_corrupted("no slot can be allocated"))
    }

    fn try_allocate(&mut self) -> CacheResult<Option<Allocation>> {
        if self.slot_count() < self.max_entries {
            let slot = self.slot_count();
            self.slots.push(CacheEntry::free());
            return Ok(Some(Allocation {
                slot,
                evicted: None,
            }));
        }

        if let Some(slot) = self.free.pop_first() {
            return Ok(Some(Allocation {
                slot,
                evicted: None,
            }));
        }

        while let Some((_stamp, slot)) = self.lru_hint.pop_first() {
            let Some(entry) = self.entry(slot) else {
                continue;
            };
            if !entry.is_live() {
                continue;
            }
            self.clear_slot(slot);
            self.write_record(slot)?;
            self.free.remove(&slot);
            return Ok(Some(Allocation {
                slot,
                evicted: Some(entry),
            }));
        }

        Ok(None)
    }

    /// Give back a slot obtained from [`Self::allocate`] that ended up unused.
    pub fn release(&mut self, slot: u32) {
        if self.slots.get(slot as usize).is_some_and(CacheEntry::is_free) {
            self.free.insert(slot);
        }
    }

    /// Store new sizes for `id` at `slot`. Never shrinks what is already recorded.
    pub fn update(
        &mut self,
        slot: u32,
        id: ContentId,
        image_size: i32,
        body_size: i32,
    ) -> CacheResult<EntryUpdate> {
        let Some(current) = self.entry(slot) else {
            return Err(CacheError::index_corrupted(format!(
                "slot {slot} is out of range"
            )));
        };

        let is_new = current.is_free();
        if !is_new && image_size <= current.image_size && body_size <= current.body_size {
            return Ok(EntryUpdate::Unchanged);
        }

        if !is_new {
            self.body_bytes = self.body_bytes.saturating_sub(current.body_size.max(0) as u64);
            self.lru_hint.remove(&(current.last_access, slot));
        }

        self.slots[slot as usize] = CacheEntry {
            id,
            image_size,
            body_size,
            last_access: self.clock.next(),
        };
        self.updated_stamps.remove(&slot);
        self.by_id.insert(id, slot);
        self.free.remove(&slot);
        self.body_bytes += body_size.max(0) as u64;

        if is_new {
            self.write_header()?;
        }
        self.write_record(slot)?;
        Ok(EntryUpdate::Updated)
    }

    /// Mark the entry of `id` free. Returns the removed entry, if any.
    pub fn remove(&mut self, id: &ContentId) -> CacheResult<Option<CacheEntry>> {
        let Some(&slot) = self.by_id.get(id) else {
            return Ok(None);
        };
        let removed = self.clear_slot(slot);
        self.write_record(slot)?;
        Ok(removed)
    }

    /// Free several slots at once, writing their records.
    pub fn evict_slots(&mut self, slots: &[u32]) -> CacheResult<Vec<CacheEntry>> {
        let mut evicted = Vec::with_capacity(slots.len());
        for &slot in slots {
            if let Some(entry) = self.clear_slot(slot) {
                evicted.push(entry);
            }
            self.write_record(slot)?;
        }
        Ok(evicted)
    }

    fn clear_slot(&mut self, slot: u32) -> Option<CacheEntry> {
        let entry = self.entry(slot)?;
        if entry.is_free() {
            return None;
        }
        self.lru_hint.remove(&(entry.last_access, slot));
        self.updated_stamps.remove(&slot);
        if self.by_id.get(&entry.id) == Some(&slot) {
            self.by_id.remove(&entry.id);
        }
        self.body_bytes = self.body_bytes.saturating_sub(entry.body_size.max(0) as u64);
        self.slots[slot as usize] = CacheEntry::free();
        self.free.insert(slot);
        Some(entry)
    }

    /// Live entries holding a body, oldest first.
    pub fn purge_candidates(&self) -> Vec<(u32, CacheEntry)> {
        self.live_entries()
            .filter(|(_, entry)| entry.body_size > 0)
            .sorted_by_key(|(slot, entry)| (entry.last_access, *slot))
            .collect()
    }

    pub fn rebuild_lru_hint(&mut self) {
        let size = self.lru_hint_size();
        self.lru_hint = self
            .live_entries()
            .map(|(slot, entry)| (entry.last_access, slot))
            .sorted()
            .take(size)
            .collect();
    }

    fn lru_hint_size(&self) -> usize {
        ((u64::from(self.max_entries) * u64::from(LRU_HINT_PERCENT) / 100) as usize).max(1)
    }

    /// Write deferred stamp refreshes to the file.
    pub fn flush_updated_entries(&mut self) -> CacheResult<usize> {
        if self.read_only || self.updated_stamps.is_empty() {
            return Ok(0);
        }
        let updated = std::mem::take(&mut self.updated_stamps);
        for (&slot, &stamp) in &updated {
            if let Some(entry) = self.slots.get_mut(slot as usize) {
                entry.last_access = stamp;
            }
        }
        self.write_header()?;
        for &slot in updated.keys() {
            self.write_record(slot)?;
        }
        Ok(updated.len())
    }

    /// Drop every entry and reset the file to an empty index.
    pub fn clear(&mut self) -> CacheResult<()> {
        self.slots.clear();
        self.by_id.clear();
        self.free.clear();
        self.lru_hint.clear();
        self.updated_stamps.clear();
        self.body_bytes = 0;
        self.rewrite_all()
    }

    fn load(&mut self) -> CacheResult<LoadReport> {
        let mut report = LoadReport::default();

        let Some(file) = self.file.as_mut() else {
            return Ok(report);
        };

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            if !self.read_only {
                self.write_header()?;
            }
            return Ok(report);
        }

        let mut header_buf = [0u8; INDEX_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        let header = match file.read_exact(&mut header_buf) {
            Ok(()) => Some(IndexHeader::from_bytes(&header_buf)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => None,
            Err(err) => return Err(err.into()),
        };

        let header = match header {
            Some(header) if header.is_current() => header,
            other => {
                log::info!(
                    "Texture cache index {} has a different layout ({other:?}), discarding it",
                    self.path.display(),
                );
                report.reset = true;
                if !self.read_only {
                    self.rewrite_all()?;
                }
                return Ok(report);
            }
        };

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        let mut record = [0u8; ENTRY_RECORD_SIZE];
        for i in 0..header.entry_count {
            if let Err(err) = file.read_exact(&mut record) {
                log::warn!(
                    "Corrupted texture cache entries, failed at {i} / {}: {err}",
                    header.entry_count,
                );
                report.reset = true;
                if !self.read_only {
                    self.rewrite_all()?;
                }
                return Ok(report);
            }
            entries.push(CacheEntry::from_bytes(&record));
        }

        let mut purge: BTreeSet<u32> = BTreeSet::new();
        let mut live: Vec<(u32, u32)> = Vec::new();
        let mut seen: HashMap<ContentId, u32> = HashMap::new();
        for (slot, entry) in entries.iter().enumerate() {
            let slot = slot as u32;
            if entry.is_free() {
                continue;
            }
            if entry.is_corrupted() {
                log::warn!(
                    "Bad texture cache entry {slot}: {} image size {} body size {}",
                    entry.id,
                    entry.image_size,
                    entry.body_size,
                );
                purge.insert(slot);
                continue;
            }
            if let Some(previous) = seen.insert(entry.id, slot) {
                // Keep the latest record of a duplicated id
                purge.insert(previous);
            }
            live.push((entry.last_access, slot));
        }
        live.retain(|(_, slot)| !purge.contains(slot));
        live.sort_unstable();

        let live_count = live.len();
        if live_count > self.max_entries as usize {
            let excess = live_count - self.max_entries as usize;
            log::info!(
                "Texture cache entries: {live_count}, max: {}, purging {excess}",
                self.max_entries,
            );
            purge.extend(live.iter().take(excess).map(|(_, slot)| *slot));
        }

        self.clock = AccessClock::seeded(
            entries
                .iter()
                .filter(|entry| !entry.is_free())
                .map(|entry| entry.last_access)
                .max()
                .unwrap_or(0),
        );

        if purge.is_empty() {
            self.slots = entries;
        } else {
            // Compact survivors into consecutive slots
            let mut compacted = Vec::with_capacity(entries.len() - purge.len());
            for (slot, entry) in entries.into_iter().enumerate() {
                let slot = slot as u32;
                if purge.contains(&slot) {
                    report.removed.push(entry.id);
                    continue;
                }
                if entry.is_free() {
                    continue;
                }
                let to = compacted.len() as u32;
                if to != slot {
                    report.moves.push((slot, to));
                }
                compacted.push(entry);
            }
            self.slots = compacted;
        }

        for (slot, entry) in self.slots.iter().enumerate() {
            if entry.is_live() {
                self.by_id.insert(entry.id, slot as u32);
                self.body_bytes += entry.body_size as u64;
            } else {
                self.free.insert(slot as u32);
            }
        }

        if !purge.is_empty() && !self.read_only {
            self.rewrite_all()?;
        }
        self.rebuild_lru_hint();

        Ok(report)
    }

    fn rewrite_all(&mut self) -> CacheResult<()> {
        if self.read_only {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(INDEX_HEADER_SIZE + self.slots.len() * ENTRY_RECORD_SIZE);
        buf.extend_from_slice(&IndexHeader::current(self.slot_count()).to_bytes());
        for entry in &self.slots {
            buf.extend_from_slice(&entry.to_bytes());
        }
        let file = self.file_mut()?;
        file.set_len(0).map_err(index_write_error)?;
        file.seek(SeekFrom::Start(0)).map_err(index_write_error)?;
        file.write_all(&buf).map_err(index_write_error)?;
        Ok(())
    }

    fn write_header(&mut self) -> CacheResult<()> {
        if self.read_only {
            return Ok(());
        }
        let header = IndexHeader::current(self.slot_count()).to_bytes();
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(0)).map_err(index_write_error)?;
        file.write_all(&header).map_err(index_write_error)?;
        Ok(())
    }

    fn write_record(&mut self, slot: u32) -> CacheResult<()> {
        if self.read_only {
            return Ok(());
        }
        let Some(entry) = self.slots.get(slot as usize) else {
            return Err(CacheError::index_corrupted(format!(
                "slot {slot} is out of range"
            )));
        };
        let record = entry.to_bytes();
        let position = (INDEX_HEADER_SIZE + slot as usize * ENTRY_RECORD_SIZE) as u64;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(position))
            .map_err(index_write_error)?;
        file.write_all(&record).map_err(index_write_error)?;
        Ok(())
    }

    fn file_mut(&mut self) -> CacheResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| CacheError::index_corrupted("index file is not open"))
    }
}

fn index_write_error(err: io::Error) -> CacheError {
    CacheError::index_corrupted(format!("failed to write index: {err}"))
}
