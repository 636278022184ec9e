//! Range-count correctness against a prefilled tree.
//!
//! The tree holds the contiguous block `[12500, 37500]`; concurrent
//! participants fire range counts and lookups with randomized bounds and
//! compare every answer against the closed-form intersection size.
//!
//! Run with:
//! ```bash
//! cargo nextest run --test range_tests --release
//! ```

#![expect(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use stamptree::StampTree;

const LOW: u64 = 12_500;
const HIGH: u64 = 37_500;

/// Ground truth: |[lo, hi] ∩ [LOW, HIGH]|.
fn expected_count(lo: u64, hi: u64) -> u32 {
    let lo = lo.max(LOW);
    let hi = hi.min(HIGH);
    if lo > hi { 0 } else { (hi - lo + 1) as u32 }
}

fn prefilled(max_threads: usize) -> StampTree<u64> {
    StampTree::with_values((LOW..=HIGH).collect(), max_threads)
}

#[test]
fn literal_interval_answers() {
    common::init_tracing();

    let tree = prefilled(1);

    assert_eq!(tree.range_count(10_000, 20_000, 0), 7_501);
    assert_eq!(tree.range_count(40_000, 50_000, 0), 0);
    assert_eq!(tree.range_count(25_000, 25_000, 0), 1);
    assert_eq!(tree.range_count(LOW, HIGH, 0), (HIGH - LOW + 1) as u32);
    assert_eq!(tree.range_count(1, 100_000, 0), (HIGH - LOW + 1) as u32);
    assert_eq!(tree.range_count(HIGH, 100_000, 0), 1);
    assert_eq!(tree.range_count(1, LOW, 0), 1);
}

#[test]
fn concurrent_range_and_lookup_mix() {
    common::init_tracing();

    const NUM_THREADS: usize = 8;
    const PROBES_PER_THREAD: usize = 2_000;

    let tree: Arc<StampTree<u64>> = Arc::new(prefilled(NUM_THREADS));

    let mut bounds: Vec<u64> = (1..=50_000).collect();
    bounds.shuffle(&mut StdRng::seed_from_u64(42));
    let bounds = Arc::new(bounds);

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            let bounds = Arc::clone(&bounds);
            thread::spawn(move || {
                for j in (0..PROBES_PER_THREAD).step_by(2) {
                    let a = bounds[tid * PROBES_PER_THREAD + j];
                    let b = bounds[tid * PROBES_PER_THREAD + j + 1];

                    if a < b {
                        let result = tree.range_count(a, b, tid);
                        assert_eq!(
                            result,
                            expected_count(a, b),
                            "range_count({a}, {b}) disagreed with ground truth"
                        );
                    } else {
                        let in_block = (LOW..=HIGH).contains(&a);
                        assert_eq!(tree.lookup(a, tid), in_block, "lookup({a})");
                        let in_block = (LOW..=HIGH).contains(&b);
                        assert_eq!(tree.lookup(b, tid), in_block, "lookup({b})");
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn range_counts_track_concurrent_disjoint_writes() {
    common::init_tracing();

    const NUM_THREADS: usize = 4;

    // Writers churn strictly above the block; range counts over the block
    // itself must never waver.
    let tree: Arc<StampTree<u64>> = Arc::new(prefilled(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                if tid == 0 {
                    for _ in 0..400 {
                        assert_eq!(
                            tree.range_count(LOW, HIGH, tid),
                            (HIGH - LOW + 1) as u32,
                            "block count drifted under disjoint churn"
                        );
                    }
                } else {
                    let base = 50_000 + tid as u64 * 1_000;
                    for round in 0..400u64 {
                        let k = base + (round % 500);
                        tree.insert(k, tid);
                        tree.remove(k, tid);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
