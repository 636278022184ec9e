//! Filepath: src/tree.rs
//!
//! The operation-stamped tree engine.
//!
//! [`StampTree`] drives every public call through the same three-step
//! pipeline:
//!
//! 1. **Publish & stamp** ([`StampTree::add_ops_to_root`]): the caller
//!    publishes its operation descriptor, draws a stamp from the shared
//!    counter, stamps every concurrently published peer it observes, and
//!    pushes all observed older operations — its own included — into the
//!    root queue in stamp order.
//! 2. **Drive** ([`StampTree::do_op`]): drain the root queue up to the own
//!    stamp, then drain the own visit queue, executing each visited node's
//!    queue up to the own stamp. Whoever reaches a pending operation first
//!    applies it; the per-queue monotonic admission makes double
//!    application impossible.
//! 3. **Help reclaim**: set the own bit in the shared participant mask and
//!    sweep a bounded prefix of the staged-subtree queue, freeing subtrees
//!    every participant has provably stopped referencing.
//!
//! A "fake root" (a bare child pointer plus its own queue) keeps the true
//! root uniform with every other node. Rebuilds swap whole subtrees through
//! that child pointer; the trigger and build logic live in
//! `tree/rebuild.rs`, the per-operation actions in `tree/actions.rs`.
//!
//! ## Caller contract
//!
//! Construction fixes the participant count `P` (at most 64). Every call
//! takes a stable `tid < P`, and each participant runs at most one call at
//! a time. Violating either is a protocol misuse with unspecified results;
//! out-of-range `tid` is caught by a debug assertion only.
//!
//! Reclamation is not bounded: a retired subtree is only freed after every
//! participant has re-entered the engine, so a participant that never
//! returns pins memory indefinitely.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::hazard::HazardPointers;
use crate::key::Key;
use crate::node::{Node, RetireEntry, Visit};
use crate::op::{OpKind, Operation};
use crate::queue::monotonic::{MonotonicQueue, Stamped};
use crate::queue::waitfree::{Slot, WaitFreeQueue};
use crate::tracing_helpers::{debug_log, trace_log};

mod actions;
mod rebuild;
mod test_hooks;

#[cfg(all(test, loom))]
mod loom_tests;


/// A wait-free concurrent ordered set with closed-interval range counts.
///
/// `REBUILD` toggles the weight-triggered subtree rebuilds; it exists for
/// measuring their effect and should stay `true` for real use.
pub struct StampTree<K: Key, const REBUILD: bool = true> {
    max_threads: usize,

    /// The fake root's only child; the actual tree root.
    root_child: AtomicPtr<Node<K>>,
    /// The fake root's operation queue.
    root_ops: MonotonicQueue<Operation<K>>,

    /// Per-participant published operation, null when idle.
    pending: Box<[AtomicPtr<Operation<K>>]>,

    /// Shared stamp source; linearizes all public calls.
    last_timestamp: AtomicU64,

    /// All-participants mask; a staged subtree is freed at this value.
    delete_mask: u64,
    /// Bit per participant, cleared on call entry, set after the drive step.
    set_mask: AtomicU64,
    /// Subtrees unlinked by rebuilds, awaiting a full mask.
    to_be_deleted: WaitFreeQueue<RetireEntry<K>>,
    /// Upper bound on staged entries; bounds the per-call sweep.
    staged_len: AtomicU64,

    /// Registry keeping operation descriptors alive while helpers read them.
    op_hazards: HazardPointers<Operation<K>>,
}

// SAFETY: all shared state is atomics; node and operation lifetimes are
// governed by the hazard registry and the mask-staged retirement protocol.
unsafe impl<K: Key, const REBUILD: bool> Send for StampTree<K, REBUILD> {}
unsafe impl<K: Key, const REBUILD: bool> Sync for StampTree<K, REBUILD> {}

impl<K: Key, const REBUILD: bool> StampTree<K, REBUILD> {
    /// Create an empty set for `max_threads` participants.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= max_threads <= 64`: the retirement mask is one
    /// machine word.
    #[must_use]
    pub fn new(max_threads: usize) -> Self {
        assert!(
            (1..=64).contains(&max_threads),
            "participant count must be in 1..=64"
        );

        let pending = (0..max_threads)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        Self {
            max_threads,
            root_child: AtomicPtr::new(ptr::null_mut()),
            root_ops: MonotonicQueue::new(max_threads),
            pending,
            last_timestamp: AtomicU64::new(1),
            delete_mask: (((1u128 << max_threads) - 1) & u128::from(u64::MAX)) as u64,
            set_mask: AtomicU64::new(0),
            to_be_deleted: WaitFreeQueue::new(max_threads),
            staged_len: AtomicU64::new(0),
            op_hazards: HazardPointers::new(max_threads, max_threads),
        }
    }

    /// Create a set holding `values`, balanced perfectly.
    ///
    /// Values are sorted internally; duplicates are kept as duplicate nodes
    /// and will corrupt range counts — de-duplicate first if the input may
    /// repeat.
    #[must_use]
    pub fn with_values(mut values: Vec<K>, max_threads: usize) -> Self {
        let tree = Self::new(max_threads);
        values.sort_unstable();
        tree.root_child
            .store(tree.build_subtree(&values, 1), Ordering::SeqCst);
        tree
    }

    // ========================================================================
    //  Public operations
    // ========================================================================

    /// Insert `value`.
    ///
    /// Returns `true` iff the key was absent (or tombstoned) at the
    /// linearization point. Inserting [`Key::SENTINEL`] returns `false`
    /// without side effects. Re-inserting a present key returns `false` but
    /// still updates path counters, degrading range-count accuracy — a
    /// documented caller responsibility.
    pub fn insert(&self, value: K, tid: usize) -> bool {
        debug_assert!(tid < self.max_threads);
        self.set_mask.fetch_and(!(1u64 << tid), Ordering::SeqCst);

        if value.is_sentinel() {
            return false;
        }

        let op = Box::into_raw(Box::new(Operation::new(
            OpKind::Insert,
            value,
            K::SENTINEL,
            self.max_threads,
        )));
        self.pending[tid].store(op, Ordering::SeqCst);
        self.add_ops_to_root(tid);

        self.do_op(tid);

        self.pending[tid].store(ptr::null_mut(), Ordering::SeqCst);
        // SAFETY: the descriptor is not retired yet, so it is still alive.
        let result = unsafe { &*op }.success.load(Ordering::SeqCst);
        self.op_hazards.retire(op, tid);

        result
    }

    /// Remove `value`, tombstoning the matching node if one is active.
    ///
    /// Removing an absent key still updates path counters, degrading
    /// range-count accuracy — a documented caller responsibility.
    pub fn remove(&self, value: K, tid: usize) {
        debug_assert!(tid < self.max_threads);
        self.set_mask.fetch_and(!(1u64 << tid), Ordering::SeqCst);

        let op = Box::into_raw(Box::new(Operation::new(
            OpKind::Remove,
            value,
            K::SENTINEL,
            self.max_threads,
        )));
        self.pending[tid].store(op, Ordering::SeqCst);
        self.add_ops_to_root(tid);

        self.do_op(tid);

        self.pending[tid].store(ptr::null_mut(), Ordering::SeqCst);
        self.op_hazards.retire(op, tid);
    }

    /// Whether an active node with key `value` existed at the
    /// linearization point.
    #[must_use]
    pub fn lookup(&self, value: K, tid: usize) -> bool {
        debug_assert!(tid < self.max_threads);
        self.set_mask.fetch_and(!(1u64 << tid), Ordering::SeqCst);

        let op = Box::into_raw(Box::new(Operation::new(
            OpKind::Lookup,
            value,
            K::SENTINEL,
            self.max_threads,
        )));
        self.pending[tid].store(op, Ordering::SeqCst);
        self.add_ops_to_root(tid);

        self.do_op(tid);

        self.pending[tid].store(ptr::null_mut(), Ordering::SeqCst);
        // SAFETY: the descriptor is not retired yet, so it is still alive.
        let result = unsafe { &*op }.success.load(Ordering::SeqCst);
        self.op_hazards.retire(op, tid);

        result
    }

    /// The number of active keys in the closed interval `[lower, upper]`.
    ///
    /// `lower == upper` degenerates to [`StampTree::lookup`]. The caller
    /// must pass `lower <= upper`.
    #[must_use]
    pub fn range_count(&self, lower: K, upper: K, tid: usize) -> u32 {
        debug_assert!(tid < self.max_threads);
        if lower == upper {
            return u32::from(self.lookup(lower, tid));
        }

        self.set_mask.fetch_and(!(1u64 << tid), Ordering::SeqCst);

        let op = Box::into_raw(Box::new(Operation::new(
            OpKind::RangeCount,
            lower,
            upper,
            self.max_threads,
        )));
        self.pending[tid].store(op, Ordering::SeqCst);
        self.add_ops_to_root(tid);

        let result = self.do_op(tid);

        self.pending[tid].store(ptr::null_mut(), Ordering::SeqCst);
        self.op_hazards.retire(op, tid);

        result
    }

    // ========================================================================
    //  Step A: publish & stamp
    // ========================================================================

    /// Insert the caller's operation into the root queue, together with
    /// every concurrently published operation observed with an older stamp.
    ///
    /// Stamping a peer is a CAS from zero, so a descriptor gets exactly one
    /// stamp no matter how many participants race to assign it.
    fn add_ops_to_root(&self, tid: usize) {
        let own = self.pending[tid].load(Ordering::SeqCst);
        let fresh = self.last_timestamp.fetch_add(1, Ordering::SeqCst);
        // SAFETY: the own descriptor cannot be freed before this call
        // returns; only its owner retires it.
        let own_ts = unsafe { &*own }.stamp(fresh);
        trace_log!(tid, own_ts, "stamped own operation");

        let mut to_insert: Vec<*mut Operation<K>> = Vec::with_capacity(self.max_threads);
        to_insert.push(own);

        for i in 0..self.max_threads {
            let peer = self
                .op_hazards
                .protect_ptr(i, self.pending[i].load(Ordering::SeqCst), tid);
            if peer.is_null() {
                continue;
            }
            if peer != self.pending[i].load(Ordering::SeqCst) {
                continue;
            }

            let fresh = self.last_timestamp.fetch_add(1, Ordering::SeqCst);
            // SAFETY: peer is hazard-protected and re-validated above.
            match unsafe { &*peer }.timestamp.compare_exchange(
                0,
                fresh,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    // Freshly stamped by us, so necessarily newer than own.
                }
                Err(existing) => {
                    if existing < own_ts {
                        to_insert.push(peer);
                    }
                }
            }
        }

        // Push oldest first so the monotonic admission accepts the batch.
        // SAFETY: every collected pointer is pinned (own: by ownership,
        // peers: by the hazard slot written above).
        to_insert.sort_by_key(|&op| unsafe { &*op }.timestamp());
        for &op in &to_insert {
            // SAFETY: pinned as above; stamps are final once non-zero.
            unsafe { self.root_ops.push_if(op, tid) };
        }

        self.op_hazards.clear(tid);
    }

    // ========================================================================
    //  Step B: drive own operation
    // ========================================================================

    /// Complete the caller's operation by executing it (and every older
    /// peer in its way) at all nodes it has to visit.
    ///
    /// Returns the range-count total; other kinds report through their
    /// descriptor fields.
    fn do_op(&self, tid: usize) -> u32 {
        let own = self.pending[tid].load(Ordering::SeqCst);
        // SAFETY: the own descriptor is alive for the whole call.
        let own_ref = unsafe { &*own };
        let own_ts = own_ref.timestamp();

        self.execute_until_timestamp_root(own_ts, tid);

        // Peers push the nodes this op must visit, plus the partial count
        // discovered on the way there. Only the first record per node
        // counts; repeat visits are no-ops.
        let mut partials: HashMap<*mut Node<K>, u32> = HashMap::new();
        loop {
            let visit = own_ref.to_visit.pop(tid);
            if visit == Visit::EMPTY {
                break;
            }
            partials.entry(visit.node).or_insert(visit.partial);
            self.execute_until_timestamp(visit.node, own_ts, tid, true);
        }

        let mut result: u32 = partials.values().copied().sum();
        result = result
            .wrapping_add(own_ref.lower_count.load(Ordering::SeqCst))
            .wrapping_add(own_ref.upper_count.load(Ordering::SeqCst));

        // Step C: this participant no longer holds engine references;
        // publish that and help free fully-acknowledged subtrees.
        self.set_mask.fetch_or(1u64 << tid, Ordering::SeqCst);

        let staged = self.staged_len.load(Ordering::SeqCst);
        for _ in 0..staged {
            let mut entry = self.to_be_deleted.pop(tid);
            if entry.node.is_null() {
                continue;
            }
            entry.flags |= self.set_mask.load(Ordering::SeqCst);
            if entry.flags == self.delete_mask {
                debug_log!(tid, node = ?entry.node, "freeing staged subtree");
                // SAFETY: every participant re-entered the engine after the
                // subtree was unlinked, so no references remain.
                unsafe { Self::free_subtree(entry.node) };
                self.staged_len.fetch_sub(1, Ordering::SeqCst);
            } else {
                self.to_be_deleted.push(entry, tid);
            }
        }

        result
    }

    /// Execute root-queue operations until the head's stamp passes
    /// `timestamp`.
    fn execute_until_timestamp_root(&self, timestamp: u64, tid: usize) {
        loop {
            let op = self
                .op_hazards
                .protect_ptr(0, self.root_ops.peek(tid), tid);
            if op != self.root_ops.peek(tid) {
                continue;
            }
            if op.is_null() {
                break;
            }
            // SAFETY: op is hazard-protected and re-validated while still
            // linked at the queue head.
            let op_ref = unsafe { &*op };
            let op_ts = op_ref.timestamp();
            if op_ts > timestamp {
                break;
            }

            if REBUILD && !self.rebuild_root(op_ts, tid) {
                // The root changed under us; reload the head.
                continue;
            }

            match op_ref.kind {
                OpKind::Insert => self.root_insert(op, tid),
                OpKind::Remove => self.root_remove(op, tid),
                OpKind::Lookup => self.root_lookup(op, tid),
                OpKind::RangeCount => self.root_range_count(op, tid),
            }

            self.op_hazards.clear_one(0, tid);
        }
    }

    /// Execute `n`'s queued operations until the head's stamp passes
    /// `timestamp`.
    ///
    /// `allow_rebuild` is false inside a rebuild's own drain pass, which
    /// keeps rebuilds from re-entering themselves.
    fn execute_until_timestamp(
        &self,
        n: *mut Node<K>,
        timestamp: u64,
        tid: usize,
        allow_rebuild: bool,
    ) {
        // SAFETY: visited nodes stay alive while any participant is inside
        // the engine; the retirement mask guarantees it.
        let n_ref = unsafe { &*n };
        loop {
            let op = self.op_hazards.protect_ptr(0, n_ref.ops.peek(tid), tid);
            if op != n_ref.ops.peek(tid) {
                continue;
            }
            if op.is_null() {
                break;
            }
            // SAFETY: op is hazard-protected and re-validated while still
            // linked at the queue head.
            let op_ref = unsafe { &*op };
            let op_ts = op_ref.timestamp();
            if op_ts > timestamp {
                break;
            }

            if REBUILD && allow_rebuild && !self.rebuild_children(n_ref, op_ts, tid) {
                // A child subtree was swapped; reload the head.
                continue;
            }

            match op_ref.kind {
                OpKind::Insert => self.node_insert(op, n_ref, tid),
                OpKind::Remove => self.node_remove(op, n_ref, tid),
                OpKind::Lookup => self.node_lookup(op, n_ref, tid),
                OpKind::RangeCount => self.node_range_count(op, n_ref, tid),
            }

            self.op_hazards.clear_one(0, tid);
        }
    }

    // ========================================================================
    //  Teardown
    // ========================================================================

    /// Free the whole subtree rooted at `root`, breadth-first.
    ///
    /// # Safety
    ///
    /// The subtree must be unreachable: either unlinked with a fully
    /// acknowledged retirement mask, or owned during single-threaded
    /// teardown.
    pub(crate) unsafe fn free_subtree(root: *mut Node<K>) {
        let mut queue = vec![root];
        while let Some(node) = queue.pop() {
            if node.is_null() {
                continue;
            }
            // SAFETY: per the contract, nothing else reaches these nodes.
            let node_ref = unsafe { &*node };
            queue.push(node_ref.left.load(Ordering::SeqCst));
            queue.push(node_ref.right.load(Ordering::SeqCst));
            // SAFETY: allocated by Node::boxed, freed exactly once here.
            unsafe { drop(Box::from_raw(node)) };
        }
    }
}

impl<K: Key, const REBUILD: bool> Drop for StampTree<K, REBUILD> {
    fn drop(&mut self) {
        let root = self.root_child.load(Ordering::SeqCst);
        if !root.is_null() {
            // SAFETY: exclusive access during drop.
            unsafe { Self::free_subtree(root) };
        }

        // Subtrees still staged for reclamation are ours alone now.
        loop {
            let entry = self.to_be_deleted.pop(0);
            if entry.node.is_null() {
                break;
            }
            // SAFETY: exclusive access during drop.
            unsafe { Self::free_subtree(entry.node) };
        }
    }
}
