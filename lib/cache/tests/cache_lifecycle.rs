use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cache::entry::{CacheEntry, ENTRY_RECORD_SIZE, INDEX_HEADER_SIZE};
use cache::manager::ENTRIES_FILE;
use cache::{CacheConfig, CacheManager, ContentId, WriteOutcome};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::Builder;

fn random_payload(rng: &mut impl Rng, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rng.fill(data.as_mut_slice());
    data
}

fn open(path: &Path, tune: impl FnOnce(&mut CacheConfig)) -> CacheManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = CacheConfig::new(path, 256 * 1024 * 1024);
    tune(&mut config);
    let (cache, _remaining) = CacheManager::init(&config).unwrap();
    cache
}

#[test]
fn test_persists_across_restart() {
    let dir = Builder::new().prefix("cache_restart").tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let items: Vec<(ContentId, Vec<u8>)> = (0..20)
        .map(|i| (ContentId::new_random(), random_payload(&mut rng, 1024 + i * 300)))
        .collect();
    {
        let cache = open(dir.path(), |_| {});
        for (id, data) in &items {
            let outcome = cache.write(*id, data, data.len() as i32, None).unwrap();
            assert_eq!(outcome, WriteOutcome::Stored);
        }
    }

    let cache = open(dir.path(), |_| {});
    assert_eq!(cache.entry_count(), items.len());
    for (id, data) in &items {
        let read = cache.read(*id, 0, data.len()).unwrap().unwrap();
        assert!(read.have_all);
        assert_eq!(&read.data, data);
    }
}

#[test]
fn test_entry_limit_evicts_oldest() {
    let dir = Builder::new().prefix("cache_entries").tempdir().unwrap();
    let cache = open(dir.path(), |config| config.max_entries = 100);
    assert_eq!(cache.budgets().max_entries, 100);

    let ids: Vec<ContentId> = (0..150).map(|_| ContentId::new_random()).collect();
    let data = vec![7u8; 2048];
    for id in &ids {
        cache.write(*id, &data, 4096, None).unwrap();
        assert!(cache.entry_count() <= 100);
    }

    assert_eq!(cache.entry_count(), 100);
    assert!(ids[..50].iter().all(|id| !cache.is_in_cache(id)));
    assert!(ids[50..].iter().all(|id| cache.is_in_cache(id)));

    cache.process_deletions(true);
    assert!(ids[..50].iter().all(|id| !cache.body_path(id).exists()));
}

#[test]
fn test_recently_read_entry_survives() {
    let dir = Builder::new().prefix("cache_lru").tempdir().unwrap();
    let cache = open(dir.path(), |config| config.max_entries = 4);
    let data = vec![1u8; 1500];

    let ids: Vec<ContentId> = (0..5).map(|_| ContentId::new_random()).collect();
    for id in &ids[..3] {
        cache.write(*id, &data, 1500, None).unwrap();
    }
    // Refresh the first one, the second becomes the oldest
    assert!(cache.read(ids[0], 0, 100).unwrap().is_some());

    cache.write(ids[3], &data, 1500, None).unwrap();
    cache.write(ids[4], &data, 1500, None).unwrap();

    assert!(cache.is_in_cache(&ids[0]));
    assert!(!cache.is_in_cache(&ids[1]));
    assert!(cache.is_in_cache(&ids[2]));
    assert!(cache.is_in_cache(&ids[4]));
}

#[test]
fn test_body_budget_purge() {
    let dir = Builder::new().prefix("cache_purge").tempdir().unwrap();
    let cache = open(dir.path(), |config| config.max_body_bytes = Some(100_000));
    let budgets = cache.budgets();
    assert_eq!(budgets.max_body_bytes, 100_000);

    let data = vec![3u8; 1024 + 10_000];
    let ids: Vec<ContentId> = (0..20).map(|_| ContentId::new_random()).collect();
    for id in &ids {
        cache.write(*id, &data, data.len() as i32, None).unwrap();
    }
    assert_eq!(cache.body_bytes(), 200_000);

    let purged = cache.purge(false).unwrap();
    assert!(purged > 0);
    assert!(cache.body_bytes() < budgets.purge_target());
    // Oldest go first
    assert!(!cache.is_in_cache(&ids[0]));
    assert!(cache.is_in_cache(&ids[19]));

    // Bodies are deleted later, in slices
    let evicted = &ids[0];
    assert!(cache.body_path(evicted).exists());
    assert_eq!(cache.stats().pending_deletions, purged);
    cache.process_deletions(true);
    assert!(!cache.body_path(evicted).exists());
    assert_eq!(cache.stats().pending_deletions, 0);
}

#[test]
fn test_recached_body_is_not_deleted() {
    let dir = Builder::new().prefix("cache_recache").tempdir().unwrap();
    let cache = open(dir.path(), |config| config.max_body_bytes = Some(5_000));
    let id = ContentId::new_random();
    let data: Vec<u8> = (0..11_024).map(|i| i as u8).collect();

    cache.write(id, &data, data.len() as i32, None).unwrap();
    assert_eq!(cache.purge(false).unwrap(), 1);
    assert!(!cache.is_in_cache(&id));

    cache.write(id, &data, data.len() as i32, None).unwrap();
    cache.process_deletions(true);

    let read = cache.read(id, 0, data.len()).unwrap().unwrap();
    assert_eq!(read.data, data);
}

#[test]
fn test_remove_is_idempotent() {
    let dir = Builder::new().prefix("cache_remove").tempdir().unwrap();
    let cache = open(dir.path(), |_| {});
    let id = ContentId::new_random();
    cache.write(id, &vec![5u8; 3000], 3000, None).unwrap();

    assert!(cache.remove(id).unwrap());
    assert!(!cache.remove(id).unwrap());
    assert!(!cache.remove(ContentId::new_random()).unwrap());
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.body_bytes(), 0);
    assert!(!cache.body_path(&id).exists());
    assert_eq!(cache.read(id, 0, 10).unwrap(), None);
}

#[test]
fn test_corrupted_record_is_dropped_on_load() {
    let dir = Builder::new().prefix("cache_corrupt").tempdir().unwrap();
    let ids: Vec<ContentId> = (0..3).map(|_| ContentId::new_random()).collect();
    let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i + 10; 2500]).collect();
    {
        let cache = open(dir.path(), |_| {});
        for (id, data) in ids.iter().zip(&payloads) {
            cache.write(*id, data, 2500, None).unwrap();
        }
    }

    // Make the middle record claim a body larger than its image
    let entries_path = dir.path().join(ENTRIES_FILE);
    let mut bytes = std::fs::read(&entries_path).unwrap();
    let at = INDEX_HEADER_SIZE + ENTRY_RECORD_SIZE;
    let mut record = [0u8; ENTRY_RECORD_SIZE];
    record.copy_from_slice(&bytes[at..at + ENTRY_RECORD_SIZE]);
    let mut entry = CacheEntry::from_bytes(&record);
    assert_eq!(entry.id, ids[1]);
    entry.body_size = entry.image_size + 5;
    bytes[at..at + ENTRY_RECORD_SIZE].copy_from_slice(&entry.to_bytes());
    std::fs::write(&entries_path, bytes).unwrap();

    let cache = open(dir.path(), |_| {});
    assert_eq!(cache.entry_count(), 2);
    assert!(!cache.is_in_cache(&ids[1]));
    // The last entry was moved into the freed slot along with its header data
    for i in [0, 2] {
        let read = cache.read(ids[i], 0, 2500).unwrap().unwrap();
        assert_eq!(read.data, payloads[i]);
    }
}

#[test]
fn test_truncated_index_resets_cache() {
    let dir = Builder::new().prefix("cache_truncated").tempdir().unwrap();
    let id = ContentId::new_random();
    {
        let cache = open(dir.path(), |_| {});
        cache.write(id, &vec![1u8; 5000], 5000, None).unwrap();
        cache
            .write(ContentId::new_random(), &vec![2u8; 5000], 5000, None)
            .unwrap();
    }

    let entries_path = dir.path().join(ENTRIES_FILE);
    let len = std::fs::metadata(&entries_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&entries_path)
        .unwrap();
    file.set_len(len - 10).unwrap();
    drop(file);

    let cache = open(dir.path(), |_| {});
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.read(id, 0, 10).unwrap(), None);
    assert!(!cache.body_path(&id).exists());

    // Usable again right away
    cache.write(id, &vec![3u8; 5000], 5000, None).unwrap();
    assert!(cache.is_in_cache(&id));
}

#[test]
fn test_clear_drops_everything() {
    let dir = Builder::new().prefix("cache_clear").tempdir().unwrap();
    let cache = open(dir.path(), |_| {});
    let ids: Vec<ContentId> = (0..5).map(|_| ContentId::new_random()).collect();
    for id in &ids {
        cache.write(*id, &vec![4u8; 4000], 4000, None).unwrap();
    }

    cache.clear().unwrap();
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.body_bytes(), 0);
    assert!(ids.iter().all(|id| !cache.body_path(id).exists()));
}

#[test]
fn test_shutdown_completes_queued_operations() {
    let dir = Builder::new().prefix("cache_shutdown").tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let items: Vec<(ContentId, Vec<u8>)> = (0..200)
        .map(|_| (ContentId::new_random(), random_payload(&mut rng, 4096)))
        .collect();

    let stored = Arc::new(AtomicUsize::new(0));
    let reads = Arc::new(AtomicUsize::new(0));
    {
        let cache = open(dir.path(), |cfg| cfg.worker_threads = 1);
        for (id, data) in &items {
            let stored = stored.clone();
            cache.write_async(*id, data.clone(), 4096, None, move |res| {
                assert_eq!(res.unwrap(), WriteOutcome::Stored);
                stored.fetch_add(1, Ordering::SeqCst);
            });
            let reads = reads.clone();
            cache.read_async(*id, 0, 4096, move |res| {
                assert!(res.unwrap().is_some());
                reads.fetch_add(1, Ordering::SeqCst);
            });
        }
        cache.shutdown();
        assert_eq!(cache.pending_jobs(), 0);
    }
    assert_eq!(stored.load(Ordering::SeqCst), items.len());
    assert_eq!(reads.load(Ordering::SeqCst), items.len());

    let cache = open(dir.path(), |_| {});
    assert_eq!(cache.entry_count(), items.len());
    for (id, data) in &items {
        let read = cache.read(*id, 0, 4096).unwrap().unwrap();
        assert!(read.have_all);
        assert_eq!(&read.data, data);
    }
}
