// Concurrent Access Tests for Blockdex
// These tests verify snapshot consistency while commits run on other threads

use blockdex::{Error, IndexSetStore, MemoryAreaStore, Options};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn new_store(indexes: usize, block_size: usize) -> Arc<IndexSetStore> {
    env_logger::try_init().ok();
    let store = IndexSetStore::create(Arc::new(MemoryAreaStore::new()), Options::default()).unwrap();
    store.prepare_indexes(indexes, 1, block_size).unwrap();
    Arc::new(store)
}

/// Test that readers always see whole commits
#[test]
fn test_readers_see_whole_commits() {
    let store = new_store(2, 8);
    let done = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicUsize::new(0));

    let mut readers = vec![];
    for _ in 0..4 {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        let observed = Arc::clone(&observed);
        readers.push(thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let snapshot = store.snapshot();
                let a = snapshot.index(0).unwrap().to_vec().unwrap();
                let b = snapshot.index(1).unwrap().to_vec().unwrap();

                // Every commit writes round r into both indexes
                assert_eq!(a.len(), b.len(), "snapshot mixes two commits");
                assert_eq!(a, (0..a.len() as i64).collect::<Vec<_>>());
                assert_eq!(b, (0..b.len() as i64).map(|v| -v).rev().collect::<Vec<_>>());
                observed.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for round in 0..200 {
        let mut writer = store.snapshot();
        writer.index_mut(0).unwrap().insert(round).unwrap();
        writer.index_mut(1).unwrap().insert(-round).unwrap();
        store.commit(writer).unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    assert!(observed.load(Ordering::Relaxed) > 0);
    assert_eq!(store.snapshot().index(0).unwrap().len(), 200);
}

/// Test concurrent writers on disjoint indexes with retry on conflict
#[test]
fn test_concurrent_writers() {
    let num_threads = 4;
    let store = new_store(num_threads, 16);
    let barrier = Arc::new(Barrier::new(num_threads));

    let mut handles = vec![];
    for thread_id in 0..num_threads {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..50 {
                let mut writer = store.snapshot();
                writer.index_mut(thread_id).unwrap().insert(i).unwrap();
                store.commit(writer).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = store.snapshot();
    for n in 0..num_threads {
        assert_eq!(snapshot.index(n).unwrap().to_vec().unwrap(), (0..50).collect::<Vec<_>>());
    }
    drop(snapshot);
    assert_eq!(store.stats().live_generations, vec![1; num_threads]);
}

/// Test contended writers on one index: losers retry until every value lands
#[test]
fn test_conflicting_writers() {
    let num_threads = 8;
    let store = new_store(1, 16);
    let barrier = Arc::new(Barrier::new(num_threads));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let mut handles = vec![];
    for thread_id in 0..num_threads {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        let conflicts = Arc::clone(&conflicts);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut inserted = 0;
            while inserted < 10 {
                let mut writer = store.snapshot();
                writer.index_mut(0).unwrap().insert((thread_id * 100 + inserted) as i64).unwrap();
                match store.commit(writer) {
                    Ok(()) => inserted += 1,
                    Err(Error::CommitConflict { .. }) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected commit error: {}", e),
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let values = store.snapshot().index(0).unwrap().to_vec().unwrap();
    let mut expected: Vec<i64> =
        (0..num_threads).flat_map(|t| (0..10).map(move |i| (t * 100 + i) as i64)).collect();
    expected.sort_unstable();
    assert_eq!(values, expected);
    assert_eq!(store.stats().live_generations, vec![1]);
}
