// Fault Injection Tests for Blockdex
// These tests simulate area write failures to ensure commits stay atomic

use blockdex::{AreaId, AreaStore, Error, IndexSetStore, MemoryAreaStore, Options, Result};
use bytes::Bytes;
use parking_lot::MutexGuard;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Memory store that fails area writes once armed.
#[derive(Debug, Default)]
struct FaultyAreaStore {
    inner: MemoryAreaStore,
    armed: AtomicBool,
    /// Writes allowed before failing while armed
    remaining: AtomicUsize,
    /// Fail deletes too
    fail_deletes: AtomicBool,
}

impl FaultyAreaStore {
    fn fail_after(&self, writes: usize) {
        self.remaining.store(writes, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.fail_deletes.store(false, Ordering::SeqCst);
    }

    fn injected() -> Error {
        Error::Io(io::Error::new(io::ErrorKind::Other, "injected write failure"))
    }
}

impl AreaStore for FaultyAreaStore {
    fn create_area(&self, size: usize) -> Result<AreaId> {
        self.inner.create_area(size)
    }

    fn read_area(&self, id: AreaId) -> Result<Bytes> {
        self.inner.read_area(id)
    }

    fn write_area(&self, id: AreaId, data: &[u8]) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err(Self::injected());
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
        }
        self.inner.write_area(id, data)
    }

    fn delete_area(&self, id: AreaId) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.delete_area(id)
    }

    fn area_size(&self, id: AreaId) -> Result<usize> {
        self.inner.area_size(id)
    }

    fn contains(&self, id: AreaId) -> bool {
        self.inner.contains(id)
    }

    fn area_count(&self) -> usize {
        self.inner.area_count()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }
}

fn setup(block_size: usize) -> (Arc<FaultyAreaStore>, IndexSetStore) {
    env_logger::try_init().ok();
    let areas = Arc::new(FaultyAreaStore::default());
    let store = IndexSetStore::create(areas.clone(), Options::default()).unwrap();
    store.prepare_indexes(2, 1, block_size).unwrap();

    let mut writer = store.snapshot();
    for i in 0..20 {
        writer.index_mut(0).unwrap().insert(i * 10).unwrap();
    }
    store.commit(writer).unwrap();
    (areas, store)
}

fn contents(store: &IndexSetStore) -> Vec<Vec<i64>> {
    let snapshot = store.snapshot();
    (0..snapshot.index_count()).map(|n| snapshot.index(n).unwrap().to_vec().unwrap()).collect()
}

/// Test that a commit failing at any write leaves no trace
#[test]
fn test_commit_failure_at_every_write() {
    let (areas, store) = setup(4);
    let before = contents(&store);
    let area_count = areas.area_count();
    let generation = store.generation(0).unwrap().id();

    let mut failures = 0;
    for allowed in 0.. {
        let mut writer = store.snapshot();
        for i in 0..10 {
            writer.index_mut(0).unwrap().insert(i * 10 + 5).unwrap();
            writer.index_mut(1).unwrap().insert(i).unwrap();
        }

        areas.fail_after(allowed);
        let result = store.commit(writer);
        areas.disarm();

        match result {
            Ok(()) => break,
            Err(err) => {
                failures += 1;
                assert!(matches!(err, Error::Commit(_)), "unexpected error: {}", err);
                assert_eq!(contents(&store), before);
                assert_eq!(areas.area_count(), area_count, "failed commit leaked areas");
                assert_eq!(store.generation(0).unwrap().id(), generation);
            }
        }
    }

    assert!(failures > 3);
    let after = contents(&store);
    assert_eq!(after[0].len(), 30);
    assert_eq!(after[1], (0..10).collect::<Vec<_>>());
}

/// Test that reopening after a failed commit sees the previous state
#[test]
fn test_reopen_after_failed_commit() {
    let (areas, store) = setup(8);
    let before = contents(&store);

    let mut writer = store.snapshot();
    writer.index_mut(0).unwrap().clear();
    areas.fail_after(1);
    assert!(store.commit(writer).is_err());
    areas.disarm();

    let reopened = IndexSetStore::open(areas.clone(), store.start_pointer(), Options::default()).unwrap();
    assert_eq!(contents(&reopened), before);
}

/// Test that failing deletes during reclamation are tolerated
#[test]
fn test_reclaim_delete_failures_are_not_fatal() {
    let (areas, store) = setup(4);

    let mut writer = store.snapshot();
    writer.index_mut(0).unwrap().remove(0).unwrap();

    areas.fail_deletes.store(true, Ordering::SeqCst);
    store.commit(writer).unwrap();
    areas.disarm();

    assert_eq!(contents(&store)[0].first(), Some(&10));
    assert_eq!(store.stats().live_generations, vec![1, 1]);
}

/// Test that a drop failing at any write leaves the index in place
#[test]
fn test_drop_index_failure_at_every_write() {
    let (areas, store) = setup(4);
    let before = contents(&store);
    let area_count = areas.area_count();
    let generation = store.generation(0).unwrap().id();
    let blocks = store.generation(0).unwrap().block_pointers();

    let mut failures = 0;
    for allowed in 0.. {
        areas.fail_after(allowed);
        let result = store.drop_index(0);
        areas.disarm();

        match result {
            Ok(()) => break,
            Err(err) => {
                failures += 1;
                assert!(matches!(err, Error::Commit(_)), "unexpected error: {}", err);
                assert_eq!(contents(&store), before);
                assert_eq!(areas.area_count(), area_count, "failed drop leaked areas");
                assert_eq!(store.generation(0).unwrap().id(), generation);

                // The persisted header still points at the old generation
                let reopened =
                    IndexSetStore::open(areas.clone(), store.start_pointer(), Options::default())
                        .unwrap();
                assert_eq!(contents(&reopened), before);
            }
        }
    }

    // Generation area, header area, start area
    assert_eq!(failures, 3);
    assert!(contents(&store)[0].is_empty());
    assert!(blocks.iter().all(|id| !areas.contains(*id)));
}

/// Test that failed preparation leaves the index count unchanged
#[test]
fn test_prepare_failure() {
    let (areas, store) = setup(4);
    let area_count = areas.area_count();

    areas.fail_after(1);
    assert!(store.prepare_indexes(3, 1, 16).is_err());
    areas.disarm();

    assert_eq!(store.index_count(), 2);
    assert_eq!(areas.area_count(), area_count);
    assert_eq!(store.prepare_indexes(1, 1, 16).unwrap(), 2..3);
}
