//! Model-based property tests.
//!
//! Single-participant drives of the engine are compared against a
//! `BTreeSet` model: membership after arbitrary insert/remove scripts, and
//! range counts against ground-truth interval intersection.
//!
//! Run with:
//! ```bash
//! cargo nextest run --test tree_proptests --release
//! ```

#![expect(clippy::unwrap_used)]

use std::collections::BTreeSet;

use proptest::prelude::*;
use stamptree::StampTree;

/// One scripted step against a small key universe.
#[derive(Debug, Clone, Copy)]
enum Step {
    Insert(u64),
    Remove(u64),
    Lookup(u64),
    Range(u64, u64),
}

fn step_strategy(universe: u64) -> impl Strategy<Value = Step> {
    let key = 1..=universe;
    prop_oneof![
        key.clone().prop_map(Step::Insert),
        key.clone().prop_map(Step::Remove),
        key.clone().prop_map(Step::Lookup),
        (1..=universe, 1..=universe).prop_map(|(a, b)| Step::Range(a.min(b), a.max(b))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Membership always matches the model, step by step.
    ///
    /// Duplicate inserts and absent removes are filtered out: those are
    /// documented protocol misuse that trades range accuracy away.
    #[test]
    fn matches_btreeset_model(steps in prop::collection::vec(step_strategy(64), 1..200)) {
        let tree: StampTree<u64> = StampTree::new(1);
        let mut model: BTreeSet<u64> = BTreeSet::new();

        for step in steps {
            match step {
                Step::Insert(k) => {
                    if !model.contains(&k) {
                        prop_assert!(tree.insert(k, 0), "insert of absent {k} must win");
                        model.insert(k);
                    }
                }
                Step::Remove(k) => {
                    if model.contains(&k) {
                        tree.remove(k, 0);
                        model.remove(&k);
                    }
                }
                Step::Lookup(k) => {
                    prop_assert_eq!(tree.lookup(k, 0), model.contains(&k), "lookup({})", k);
                }
                Step::Range(lo, hi) => {
                    let expected = model.range(lo..=hi).count() as u32;
                    prop_assert_eq!(tree.range_count(lo, hi, 0), expected,
                        "range_count({}, {})", lo, hi);
                }
            }
        }

        // Full-universe sweep at the end.
        for k in 1..=64u64 {
            prop_assert_eq!(tree.lookup(k, 0), model.contains(&k), "final lookup({})", k);
        }
        let expected = model.len() as u32;
        prop_assert_eq!(tree.range_count(1, 64, 0), expected);
    }

    /// Prefilled construction agrees with the model for arbitrary key sets.
    #[test]
    fn with_values_matches_model(keys in prop::collection::btree_set(1..10_000u64, 0..300)) {
        let tree: StampTree<u64> = StampTree::with_values(keys.iter().copied().collect(), 1);

        for &k in &keys {
            prop_assert!(tree.lookup(k, 0), "prefilled key {} missing", k);
        }
        prop_assert_eq!(tree.range_count(1, 10_000, 0), keys.len() as u32);

        if let (Some(&lo), Some(&hi)) = (keys.iter().next(), keys.iter().next_back()) {
            if lo < hi {
                let expected = keys.range(lo..=hi).count() as u32;
                prop_assert_eq!(tree.range_count(lo, hi, 0), expected);
            }
        }
    }

    /// Rebuild-disabled trees answer identically, just slower.
    #[test]
    fn rebuild_toggle_is_transparent(keys in prop::collection::btree_set(1..500u64, 1..60)) {
        let with: StampTree<u64, true> = StampTree::new(1);
        let without: StampTree<u64, false> = StampTree::new(1);

        for &k in &keys {
            prop_assert_eq!(with.insert(k, 0), without.insert(k, 0));
        }
        for k in 1..=500u64 {
            prop_assert_eq!(with.lookup(k, 0), without.lookup(k, 0), "lookup({})", k);
        }
        let (&lo, &hi) = (keys.iter().next().unwrap(), keys.iter().next_back().unwrap());
        prop_assert_eq!(with.range_count(lo, hi.max(lo + 1), 0),
            without.range_count(lo, hi.max(lo + 1), 0));
    }
}
