//! Multi-threaded stress tests: disjoint writers, reader/writer mixes, and
//! post-join structural verification.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use fastfair::BTree;

/// Verify all keys are findable, panic with details if any are missing.
fn verify_all_keys<const CARD: usize>(
    tree: &BTree<CARD>,
    keys: impl Iterator<Item = i64>,
    test_name: &str,
) {
    let guard = tree.guard();
    let mut missing: Vec<i64> = Vec::new();

    for key in keys {
        if tree.search_with_guard(key, &guard).is_none() {
            missing.push(key);
        }
    }

    assert!(
        missing.is_empty(),
        "{test_name}: missing {} keys (showing first 20): {:?}, tree.len()={}",
        missing.len(),
        &missing[..missing.len().min(20)],
        tree.len()
    );
}

/// Two threads insert disjoint halves; every key must land and the tree
/// must stay structurally sound.
#[test]
fn two_threads_disjoint_halves() {
    common::init_tracing();

    const TOTAL: i64 = 10_000;

    let tree: Arc<BTree> = Arc::new(BTree::new());

    let handles: Vec<_> = [(1i64, TOTAL / 2), (TOTAL / 2 + 1, TOTAL)]
        .into_iter()
        .map(|(from, to)| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let guard = tree.guard();
                for key in from..=to {
                    tree.insert_with_guard(key, key as u64, &guard).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    verify_all_keys(&tree, 1..=TOTAL, "two_threads_disjoint_halves");
    assert_eq!(tree.len(), TOTAL as usize);
    tree.check_invariants();
}

/// Eight threads, interleaved key ranges, small pages to force constant
/// splitting.
#[test]
fn eight_threads_interleaved_small_pages() {
    common::init_tracing();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 2_000;

    let tree: Arc<BTree<8>> = Arc::new(BTree::new());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let guard = tree.guard();
                for i in 0..PER_THREAD {
                    // Interleave: thread t owns keys congruent to t mod THREADS.
                    let key = (i * THREADS + t) as i64;
                    tree.insert_with_guard(key, key as u64 + 1, &guard).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let guard = tree.guard();
    for key in 0..(THREADS * PER_THREAD) as i64 {
        assert_eq!(
            tree.search_with_guard(key, &guard),
            Some(key as u64 + 1),
            "key {key} lost"
        );
    }
    drop(guard);

    tree.check_invariants();
}

/// One writer inserts ascending keys while a reader repeatedly range-scans:
/// every scan must be strictly ascending and contain only inserted handles.
#[test]
fn reader_sees_only_inserted_handles() {
    common::init_tracing();

    const TOTAL: i64 = 1_000;

    let tree: Arc<BTree<8>> = Arc::new(BTree::new());
    let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let writer = {
        let tree = Arc::clone(&tree);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let guard = tree.guard();
            for key in 1..=TOTAL {
                tree.insert_with_guard(key, key as u64, &guard).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let reader = {
        let tree = Arc::clone(&tree);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let guard = tree.guard();
            let mut buf: Vec<u64> = Vec::new();
            let mut scans: usize = 0;

            while !done.load(Ordering::Acquire) || scans == 0 {
                buf.clear();
                tree.search_range_with_guard(0, 2 * TOTAL, &mut buf, &guard);

                assert!(
                    buf.windows(2).all(|w| w[0] < w[1]),
                    "scan output not strictly ascending: {buf:?}"
                );
                for &handle in &buf {
                    assert!(
                        (1..=TOTAL as u64).contains(&handle),
                        "scan returned a never-inserted handle {handle:#x}"
                    );
                }

                scans += 1;
            }
            scans
        })
    };

    writer.join().unwrap();
    let scans = reader.join().unwrap();
    assert!(scans > 0);

    // The final scan after the writer finished must be complete.
    let mut buf: Vec<u64> = Vec::new();
    tree.search_range(0, 2 * TOTAL, &mut buf);
    assert_eq!(buf, (1u64..=TOTAL as u64).collect::<Vec<_>>());
}

/// Concurrent point reads against a concurrent writer: a hit must return
/// the exact handle; a miss is only legal for not-yet-inserted keys.
#[test]
fn point_reads_race_writer() {
    common::init_tracing();

    const TOTAL: i64 = 5_000;

    let tree: Arc<BTree<8>> = Arc::new(BTree::new());
    let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let writer = {
        let tree = Arc::clone(&tree);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let guard = tree.guard();
            for key in 1..=TOTAL {
                tree.insert_with_guard(key, (key as u64) * 3, &guard).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let guard = tree.guard();
                let mut key: i64 = 1;
                while !done.load(Ordering::Acquire) {
                    if let Some(handle) = tree.search_with_guard(key, &guard) {
                        assert_eq!(handle, (key as u64) * 3, "torn read for key {key}");
                    }
                    key = key % TOTAL + 1;
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    verify_all_keys(&tree, 1..=TOTAL, "point_reads_race_writer");
}

/// Concurrent inserts and deletes on disjoint key sets: deleters only touch
/// keys pre-inserted before the race.
#[test]
fn writers_and_deleters_disjoint() {
    common::init_tracing();

    const PRE: i64 = 4_000;
    const EXTRA: i64 = 4_000;

    let tree: Arc<BTree<8>> = Arc::new(BTree::new());

    {
        let guard = tree.guard();
        for key in 1..=PRE {
            tree.insert_with_guard(key, key as u64, &guard).unwrap();
        }
    }

    let inserter = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            let guard = tree.guard();
            for key in (PRE + 1)..=(PRE + EXTRA) {
                tree.insert_with_guard(key, key as u64, &guard).unwrap();
            }
        })
    };

    let deleter = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            let guard = tree.guard();
            for key in (1..=PRE).step_by(2) {
                assert!(
                    tree.delete_with_guard(key, &guard),
                    "pre-inserted key {key} must be deletable"
                );
            }
        })
    };

    inserter.join().unwrap();
    deleter.join().unwrap();

    let guard = tree.guard();
    let mut expected: HashSet<i64> = (2..=PRE).step_by(2).collect();
    expected.extend((PRE + 1)..=(PRE + EXTRA));

    for key in 1..=(PRE + EXTRA) {
        let found = tree.search_with_guard(key, &guard);
        if expected.contains(&key) {
            assert_eq!(found, Some(key as u64), "surviving key {key} lost");
        } else {
            assert_eq!(found, None, "deleted key {key} still visible");
        }
    }
    drop(guard);

    tree.check_invariants();
}
