//! Filepath: src/tree/loom_tests.rs
//!
//! Loom tests for the stamp-and-publish protocol.
//!
//! Loom explores all interleavings, so the models here are deliberately
//! small: they exercise the CAS-from-zero stamping rule that the engine's
//! publish step relies on, not the whole tree.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --lib tree::loom_tests`

use loom::sync::Arc;
use loom::sync::atomic::{AtomicU64, Ordering};
use loom::thread;

/// A reduced publish slot: a stamp cell that starts at zero and accepts
/// exactly one CAS, no matter how many helpers race to assign it.
struct LoomOp {
    stamp: AtomicU64,
}

impl LoomOp {
    fn new() -> Self {
        Self {
            stamp: AtomicU64::new(0),
        }
    }

    /// The engine's stamping rule: CAS from zero, keep whatever stuck.
    fn stamp(&self, fresh: u64) -> u64 {
        match self
            .stamp
            .compare_exchange(0, fresh, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => fresh,
            Err(existing) => existing,
        }
    }
}

#[test]
fn loom_stamp_assigned_exactly_once() {
    loom::model(|| {
        let counter = Arc::new(AtomicU64::new(1));
        let op = Arc::new(LoomOp::new());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let op = Arc::clone(&op);
                thread::spawn(move || {
                    let fresh = counter.fetch_add(1, Ordering::SeqCst);
                    op.stamp(fresh)
                })
            })
            .collect();

        let observed: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Both racers must agree on the single assigned stamp.
        assert_eq!(observed[0], observed[1]);
        assert_eq!(op.stamp.load(Ordering::SeqCst), observed[0]);
        assert!(observed[0] >= 1);
    });
}

#[test]
fn loom_own_stamp_orders_against_peer() {
    loom::model(|| {
        let counter = Arc::new(AtomicU64::new(1));
        let own = Arc::new(LoomOp::new());
        let peer = Arc::new(LoomOp::new());

        // The owner stamps itself; a helper stamps the peer; both observe
        // both cells afterwards.
        let owner = {
            let counter = Arc::clone(&counter);
            let own = Arc::clone(&own);
            let peer = Arc::clone(&peer);
            thread::spawn(move || {
                let own_ts = own.stamp(counter.fetch_add(1, Ordering::SeqCst));
                let peer_ts = peer.stamp(counter.fetch_add(1, Ordering::SeqCst));
                (own_ts, peer_ts)
            })
        };
        let helper = {
            let counter = Arc::clone(&counter);
            let own = Arc::clone(&own);
            let peer = Arc::clone(&peer);
            thread::spawn(move || {
                let peer_ts = peer.stamp(counter.fetch_add(1, Ordering::SeqCst));
                let own_ts = own.stamp(counter.fetch_add(1, Ordering::SeqCst));
                (own_ts, peer_ts)
            })
        };

        let (own_a, peer_a) = owner.join().unwrap();
        let (own_b, peer_b) = helper.join().unwrap();

        // Stamps are unique and final: both threads observed the same pair.
        assert_eq!(own_a, own_b);
        assert_eq!(peer_a, peer_b);
        assert_ne!(own_a, peer_a);
    });
}
