//! Concurrent tree correctness tests.
//!
//! These drive the full engine with multiple participants: disjoint insert
//! buckets, insert/remove/reinsert waves, and the duplicate-insert race
//! where exactly one caller may win.
//!
//! Run with:
//! ```bash
//! cargo nextest run --test tree_tests --release
//! ```

#![expect(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use stamptree::StampTree;

/// Verify all keys are findable, panic with details if any are missing.
fn verify_all_present(tree: &StampTree<u64>, keys: &[u64], test_name: &str) {
    let mut missing = Vec::new();
    for &k in keys {
        if !tree.lookup(k, 0) {
            missing.push(k);
        }
    }
    if !missing.is_empty() {
        let sample: Vec<_> = missing.iter().take(20).collect();
        panic!(
            "{test_name}: missing {} keys (showing first 20): {sample:?}",
            missing.len(),
        );
    }
}

#[test]
fn disjoint_insert_buckets_4_threads() {
    common::init_tracing();

    const NUM_THREADS: usize = 4;
    const TOTAL_KEYS: usize = 16_000;
    const PER_THREAD: usize = TOTAL_KEYS / NUM_THREADS;

    let mut data: Vec<u64> = (1..=TOTAL_KEYS as u64).collect();
    data.shuffle(&mut StdRng::seed_from_u64(42));
    let data = Arc::new(data);

    let tree: Arc<StampTree<u64>> = Arc::new(StampTree::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                for j in 0..PER_THREAD {
                    let k = data[tid * PER_THREAD + j];
                    assert!(tree.insert(k, tid), "insert of fresh key {k} failed");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    verify_all_present(&tree, &data, "disjoint_insert_buckets_4_threads");
    assert_eq!(tree.range_count(1, TOTAL_KEYS as u64, 0), TOTAL_KEYS as u32);
}

#[test]
fn insert_remove_reinsert_waves() {
    common::init_tracing();

    const NUM_THREADS: usize = 8;
    const TOTAL_KEYS: usize = 16_000;
    const HALF: usize = TOTAL_KEYS / 2;

    let mut data: Vec<u64> = (1..=TOTAL_KEYS as u64).collect();
    data.shuffle(&mut StdRng::seed_from_u64(42));
    let data = Arc::new(data);

    let tree: Arc<StampTree<u64>> = Arc::new(StampTree::new(NUM_THREADS));

    // Wave 1: insert the first half, split across all threads.
    let per_thread = HALF / NUM_THREADS;
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                for j in 0..per_thread {
                    assert!(tree.insert(data[tid * per_thread + j], tid));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    verify_all_present(&tree, &data[..HALF], "wave 1");

    // Wave 2: half the threads remove the first half while the other half
    // insert the second half.
    let per_thread = TOTAL_KEYS / NUM_THREADS;
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                for j in 0..per_thread {
                    let k = data[tid * per_thread + j];
                    if tid < NUM_THREADS / 2 {
                        tree.remove(k, tid);
                    } else {
                        assert!(tree.insert(k, tid), "insert of fresh key {k} failed");
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    for (i, &k) in data.iter().enumerate() {
        let found = tree.lookup(k, 0);
        if i < HALF {
            assert!(!found, "removed key {k} still present");
        } else {
            assert!(found, "inserted key {k} missing");
        }
    }

    // Wave 3: reinsert the first half; the whole universe must be present.
    let per_thread = HALF / NUM_THREADS;
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                for j in 0..per_thread {
                    let k = data[tid * per_thread + j];
                    assert!(tree.insert(k, tid), "reinsert of removed key {k} failed");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    verify_all_present(&tree, &data, "wave 3");
}

#[test]
fn duplicate_insert_race_has_single_winner() {
    common::init_tracing();

    const ROUNDS: u64 = 200;

    let tree: Arc<StampTree<u64>> = Arc::new(StampTree::new(2));

    for round in 1..=ROUNDS {
        let key = round * 3 + 1;
        let handles: Vec<_> = (0..2usize)
            .map(|tid| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || tree.insert(key, tid))
            })
            .collect();
        let wins: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(
            wins.iter().filter(|&&w| w).count(),
            1,
            "round {round}: exactly one insert of {key} may report success: {wins:?}"
        );
        assert!(tree.lookup(key, 0));
    }
}

#[test]
fn degenerate_range_equals_lookup() {
    common::init_tracing();

    let tree: StampTree<u64> = StampTree::with_values(vec![2, 5, 9], 1);

    assert_eq!(tree.range_count(5, 5, 0), u32::from(tree.lookup(5, 0)));
    assert_eq!(tree.range_count(6, 6, 0), u32::from(tree.lookup(6, 0)));

    tree.remove(5, 0);
    assert_eq!(tree.range_count(5, 5, 0), 0);
}

#[test]
fn sentinel_insert_is_rejected_everywhere() {
    common::init_tracing();

    let tree: Arc<StampTree<u64>> = Arc::new(StampTree::new(4));
    let handles: Vec<_> = (0..4usize)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                assert!(!tree.insert(0, tid));
                assert!(tree.insert(tid as u64 + 1, tid));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(!tree.lookup(0, 0));
    for k in 1..=4 {
        assert!(tree.lookup(k, 0));
    }
}

#[test]
fn mixed_readers_and_writers_on_disjoint_keys() {
    common::init_tracing();

    const NUM_THREADS: usize = 8;
    const STABLE_KEYS: u64 = 2_048;

    // Even keys are prefilled and never touched; odd keys churn.
    let stable: Vec<u64> = (1..=STABLE_KEYS).map(|k| k * 2).collect();
    let tree: Arc<StampTree<u64>> = Arc::new(StampTree::with_values(stable.clone(), NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(tid as u64);
                let mut churn: Vec<u64> =
                    (0..256usize).map(|j| (tid * 256 + j) as u64 * 2 + 1).collect();
                churn.shuffle(&mut rng);

                for &k in &churn {
                    assert!(tree.insert(k, tid));
                    // Stable keys must stay visible through the churn.
                    let probe = (k % STABLE_KEYS + 1) * 2;
                    assert!(tree.lookup(probe, tid), "stable key {probe} vanished");
                    tree.remove(k, tid);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    verify_all_present(&tree, &stable, "mixed_readers_and_writers");
}
