//! Filepath: src/queue/monotonic.rs
//!
//! Conditional monotonic queue.
//!
//! Same help skeleton as [`crate::queue::waitfree`], but the queue carries
//! pointers to externally-owned timestamped elements, and admission is
//! conditional: a push only links its node when the current tail's
//! timestamp is strictly below the new element's, so the queue order is
//! always the timestamp order. Pops are conditional too — the head is only
//! unlinked when its timestamp matches the caller's expectation — and a
//! third descriptor type, `Peek`, reads the head without unlinking.
//!
//! The per-node `timestamp` mirrors the element's stamp at push time; it is
//! its own atomic because helpers read it while the element pointer is
//! being retired by its owner.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use portable_atomic::AtomicU128;

use crate::hazard::{HazardPointers, Reclaimable};
use crate::queue::{DescTag, pack_stamp, stamp_counter, stamp_tag};

// ============================================================================
//  Elements and link nodes
// ============================================================================

/// An element the monotonic queue can order.
pub trait Stamped {
    /// The element's timestamp. Must be stable once the element is pushed.
    fn timestamp(&self) -> u64;
}

pub(crate) struct MonoNode<T> {
    next: AtomicPtr<MonoNode<T>>,
    push_tid: usize,
    pop_tid: AtomicUsize,
    value: *mut T,
    /// Mirror of `value`'s stamp, readable after the element is retired.
    timestamp: AtomicU64,
}

// Link nodes are only freed through slot protection; the element pointer is
// a weak reference owned elsewhere.
impl<T> Reclaimable for MonoNode<T> {}

/// One participant's published queue operation.
///
/// The payload word is a node pointer for pushes, an element pointer for
/// completed peeks, and the expected head timestamp for pops.
struct OpDesc<T> {
    payload: u64,
    stamp: u64,
    _marker: PhantomData<*mut T>,
}

// Manual impls: the element type itself is neither copied nor compared,
// so the derives' `T:` bounds would be wrong.
impl<T> Clone for OpDesc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OpDesc<T> {}

impl<T> PartialEq for OpDesc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload && self.stamp == other.stamp
    }
}

impl<T> Eq for OpDesc<T> {}

impl<T> OpDesc<T> {
    #[inline]
    fn with_payload(payload: u64, counter: u64, tag: DescTag) -> Self {
        Self {
            payload,
            stamp: pack_stamp(tag, counter),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn with_node(node: *mut MonoNode<T>, counter: u64, tag: DescTag) -> Self {
        Self::with_payload(node as usize as u64, counter, tag)
    }

    #[inline]
    fn with_value(value: *mut T, counter: u64, tag: DescTag) -> Self {
        Self::with_payload(value as usize as u64, counter, tag)
    }

    #[inline]
    fn with_expected(expected: u64, counter: u64, tag: DescTag) -> Self {
        Self::with_payload(expected, counter, tag)
    }

    #[inline]
    fn node(self) -> *mut MonoNode<T> {
        self.payload as usize as *mut MonoNode<T>
    }

    #[inline]
    fn value(self) -> *mut T {
        self.payload as usize as *mut T
    }

    #[inline]
    fn expected(self) -> u64 {
        self.payload
    }

    #[inline]
    fn tag(self) -> DescTag {
        stamp_tag(self.stamp)
    }

    #[inline]
    fn counter(self) -> u64 {
        stamp_counter(self.stamp)
    }

    #[inline]
    fn to_bits(self) -> u128 {
        (u128::from(self.payload) << 64) | u128::from(self.stamp)
    }

    #[inline]
    fn from_bits(bits: u128) -> Self {
        Self {
            payload: (bits >> 64) as u64,
            stamp: bits as u64,
            _marker: PhantomData,
        }
    }
}

// ============================================================================
//  MonotonicQueue
// ============================================================================

const HP_TAIL: usize = 0;
const HP_HEAD: usize = 1;
const HP_NEXT: usize = 2;
/// Pushes never touch the head slot, so the prepared node reuses it.
const HP_INSERT: usize = 1;

/// Timestamp-ordered MPMC queue of `*mut T` for `max_threads` participants.
///
/// Elements are borrowed, not owned: callers keep each element alive (via
/// their own hazard protection) for as long as it may be observed through
/// the queue.
pub struct MonotonicQueue<T: Stamped> {
    max_threads: usize,
    head: AtomicPtr<MonoNode<T>>,
    tail: AtomicPtr<MonoNode<T>>,
    hazards: HazardPointers<MonoNode<T>>,
    descs: Box<[AtomicU128]>,
    next_stamp: AtomicU64,
}

// SAFETY: shared mutation is atomic; link nodes are hazard-pinned before any
// cross-thread dereference, and element pointers are only handed back to
// callers who own their protection.
unsafe impl<T: Stamped + Send + Sync> Send for MonotonicQueue<T> {}
unsafe impl<T: Stamped + Send + Sync> Sync for MonotonicQueue<T> {}

impl<T: Stamped> MonotonicQueue<T> {
    /// Create a queue for `max_threads` participants.
    #[must_use]
    pub fn new(max_threads: usize) -> Self {
        let dummy = Box::into_raw(Box::new(MonoNode {
            next: AtomicPtr::new(ptr::null_mut()),
            push_tid: 0,
            pop_tid: AtomicUsize::new(max_threads),
            value: ptr::null_mut(),
            timestamp: AtomicU64::new(0),
        }));
        let descs = (0..max_threads)
            .map(|_| {
                AtomicU128::new(
                    OpDesc::<T>::with_node(ptr::null_mut(), 0, DescTag::NotPending).to_bits(),
                )
            })
            .collect();

        Self {
            max_threads,
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            hazards: HazardPointers::new(3, max_threads),
            descs,
            next_stamp: AtomicU64::new(1),
        }
    }

    #[inline]
    fn load_desc(&self, i: usize) -> OpDesc<T> {
        OpDesc::from_bits(self.descs[i].load(Ordering::SeqCst))
    }

    #[inline]
    fn store_desc(&self, i: usize, desc: OpDesc<T>) {
        self.descs[i].store(desc.to_bits(), Ordering::SeqCst);
    }

    #[inline]
    fn cas_desc(&self, i: usize, current: OpDesc<T>, new: OpDesc<T>) -> bool {
        self.descs[i]
            .compare_exchange(
                current.to_bits(),
                new.to_bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn is_still_pending(&self, i: usize, counter: u64) -> bool {
        let d = self.load_desc(i);
        d.tag() != DescTag::NotPending && d.counter() <= counter
    }

    fn help(&self, counter: u64, tid: usize) {
        for i in 0..self.max_threads {
            let d = self.load_desc(i);
            if d.tag() != DescTag::NotPending && d.counter() <= counter {
                match d.tag() {
                    DescTag::Push => self.help_push(i, counter, tid),
                    DescTag::Pop => self.help_pop(i, counter, tid),
                    DescTag::Peek => self.help_peek(i, counter, tid),
                    DescTag::NotPending => {}
                }
            }
        }
    }

    fn help_push(&self, i: usize, counter: u64, tid: usize) {
        while self.is_still_pending(i, counter) {
            let curr_tail = self
                .hazards
                .protect_ptr(HP_TAIL, self.tail.load(Ordering::SeqCst), tid);
            if curr_tail != self.tail.load(Ordering::SeqCst) {
                continue;
            }
            // SAFETY: curr_tail is protected and matched a re-read of tail.
            let curr_next = self.hazards.protect_ptr(
                HP_NEXT,
                unsafe { &*curr_tail }.next.load(Ordering::SeqCst),
                tid,
            );
            if curr_tail != self.tail.load(Ordering::SeqCst) {
                continue;
            }

            // Admission gate: the prepared node must be newer than the tail.
            let d = self.load_desc(i);
            if d.node().is_null() {
                self.hazards.clear_one(HP_TAIL, tid);
                self.hazards.clear_one(HP_NEXT, tid);
                return;
            }
            self.hazards.protect_ptr(HP_INSERT, d.node(), tid);
            if self.load_desc(i).node() != d.node() {
                self.hazards.clear_one(HP_TAIL, tid);
                self.hazards.clear_one(HP_INSERT, tid);
                return;
            }

            if self.is_still_pending(i, counter) {
                // SAFETY: curr_tail and d.node() are both hazard-protected.
                let tail_ts = unsafe { &*curr_tail }.timestamp.load(Ordering::SeqCst);
                let node_ts = unsafe { &*d.node() }.timestamp.load(Ordering::SeqCst);
                if tail_ts >= node_ts {
                    // Out of order: complete as a no-op and discard the node.
                    let new_d =
                        OpDesc::with_node(ptr::null_mut(), d.counter(), DescTag::NotPending);
                    if self.cas_desc(i, d, new_d) {
                        self.hazards.retire(d.node(), tid);
                    }
                    self.hazards.clear_one(HP_TAIL, tid);
                    self.hazards.clear_one(HP_NEXT, tid);
                    self.hazards.clear_one(HP_INSERT, tid);
                    return;
                }
            }

            if curr_next.is_null() {
                if self.is_still_pending(i, counter) {
                    let node = self.load_desc(i).node();
                    // SAFETY: curr_tail is still hazard-protected.
                    if unsafe { &*curr_tail }
                        .next
                        .compare_exchange(curr_next, node, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.hazards.clear_one(HP_TAIL, tid);
                        self.hazards.clear_one(HP_NEXT, tid);
                        self.hazards.clear_one(HP_INSERT, tid);
                        self.help_finish_push(tid);
                        return;
                    }
                }
            } else {
                self.hazards.clear_one(HP_TAIL, tid);
                self.hazards.clear_one(HP_NEXT, tid);
                self.hazards.clear_one(HP_INSERT, tid);
                self.help_finish_push(tid);
            }
        }
    }

    fn help_finish_push(&self, tid: usize) {
        let curr_tail = self.hazards.protect(HP_TAIL, &self.tail, tid);
        // SAFETY: tail is never null and curr_tail is protected.
        let curr_next = self.hazards.protect_ptr(
            HP_NEXT,
            unsafe { &*curr_tail }.next.load(Ordering::SeqCst),
            tid,
        );
        if curr_tail == self.tail.load(Ordering::SeqCst) && !curr_next.is_null() {
            // SAFETY: curr_next is protected and was read behind a stable tail.
            let i = unsafe { &*curr_next }.push_tid;
            let d = self.load_desc(i);
            if curr_tail == self.tail.load(Ordering::SeqCst) && d.node() == curr_next {
                let new_d = OpDesc::with_node(d.node(), d.counter(), DescTag::NotPending);
                self.cas_desc(i, d, new_d);
                let _ = self.tail.compare_exchange(
                    curr_tail,
                    curr_next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
        self.hazards.clear_one(HP_TAIL, tid);
        self.hazards.clear_one(HP_NEXT, tid);
    }

    fn help_pop(&self, i: usize, counter: u64, tid: usize) {
        while self.is_still_pending(i, counter) {
            let curr_head = self
                .hazards
                .protect_ptr(HP_HEAD, self.head.load(Ordering::SeqCst), tid);
            if curr_head != self.head.load(Ordering::SeqCst) {
                continue;
            }
            let curr_tail = self
                .hazards
                .protect_ptr(HP_TAIL, self.tail.load(Ordering::SeqCst), tid);
            if curr_tail != self.tail.load(Ordering::SeqCst) {
                continue;
            }
            // SAFETY: curr_head is protected and matched a re-read of head.
            let curr_next = self.hazards.protect_ptr(
                HP_NEXT,
                unsafe { &*curr_head }.next.load(Ordering::SeqCst),
                tid,
            );

            if curr_head != self.head.load(Ordering::SeqCst) {
                continue;
            }
            if curr_head == curr_tail {
                if curr_next.is_null() {
                    // Empty queue: complete as a no-op.
                    let d = self.load_desc(i);
                    if curr_tail == self.tail.load(Ordering::SeqCst)
                        && self.is_still_pending(i, counter)
                    {
                        let new_d = OpDesc::with_expected(0, d.counter(), DescTag::NotPending);
                        self.cas_desc(i, d, new_d);
                        self.hazards.clear_one(HP_NEXT, tid);
                        self.hazards.clear_one(HP_HEAD, tid);
                        self.hazards.clear_one(HP_TAIL, tid);
                    }
                } else {
                    self.hazards.clear_one(HP_HEAD, tid);
                    self.help_finish_push(tid);
                }
            } else {
                let d = self.load_desc(i);
                if !self.is_still_pending(i, counter) {
                    self.hazards.clear_one(HP_NEXT, tid);
                    self.hazards.clear_one(HP_HEAD, tid);
                    self.hazards.clear_one(HP_TAIL, tid);
                    break;
                }

                if curr_head == self.head.load(Ordering::SeqCst) {
                    // Condition check: the head must carry the expected stamp,
                    // otherwise the pop completes without removing anything.
                    // SAFETY: curr_next is protected; non-null on this branch.
                    if unsafe { &*curr_next }.timestamp.load(Ordering::SeqCst) != d.expected() {
                        let new_d = OpDesc::with_expected(0, d.counter(), DescTag::NotPending);
                        self.cas_desc(i, d, new_d);
                        self.hazards.clear_one(HP_TAIL, tid);
                        self.hazards.clear_one(HP_HEAD, tid);
                        self.hazards.clear_one(HP_NEXT, tid);
                        return;
                    }

                    // The descriptor may have completed between the loads
                    // above; start over rather than claiming for a stale op.
                    if self.load_desc(i) != d {
                        continue;
                    }
                }
                // SAFETY: curr_head is still hazard-protected.
                let _ = unsafe { &*curr_head }.pop_tid.compare_exchange(
                    self.max_threads,
                    i,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                self.hazards.clear_one(HP_TAIL, tid);
                self.help_finish_pop(tid);
            }
        }
    }

    fn help_finish_pop(&self, tid: usize) {
        let curr_head = self
            .hazards
            .protect_ptr(HP_HEAD, self.head.load(Ordering::SeqCst), tid);
        if curr_head != self.head.load(Ordering::SeqCst) {
            return;
        }
        // SAFETY: curr_head is protected and matched a re-read of head.
        let head_ref = unsafe { &*curr_head };
        let curr_next = self
            .hazards
            .protect_ptr(HP_NEXT, head_ref.next.load(Ordering::SeqCst), tid);
        let i = head_ref.pop_tid.load(Ordering::SeqCst);
        if i != self.max_threads {
            let d = self.load_desc(i);
            if curr_head == self.head.load(Ordering::SeqCst) && !curr_next.is_null() {
                let new_d = OpDesc::with_expected(d.expected(), d.counter(), DescTag::NotPending);
                self.cas_desc(i, d, new_d);
                if self
                    .head
                    .compare_exchange(curr_head, curr_next, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.hazards.retire(curr_head, tid);
                }
            }
        }
        self.hazards.clear_one(HP_HEAD, tid);
        self.hazards.clear_one(HP_NEXT, tid);
    }

    fn help_peek(&self, i: usize, counter: u64, tid: usize) {
        while self.is_still_pending(i, counter) {
            let curr_head = self
                .hazards
                .protect_ptr(HP_HEAD, self.head.load(Ordering::SeqCst), tid);
            if curr_head != self.head.load(Ordering::SeqCst) {
                continue;
            }
            let curr_tail = self
                .hazards
                .protect_ptr(HP_TAIL, self.tail.load(Ordering::SeqCst), tid);
            if curr_tail != self.tail.load(Ordering::SeqCst) {
                continue;
            }
            // SAFETY: curr_head is protected and matched a re-read of head.
            let curr_next = self.hazards.protect_ptr(
                HP_NEXT,
                unsafe { &*curr_head }.next.load(Ordering::SeqCst),
                tid,
            );

            if curr_head != self.head.load(Ordering::SeqCst) {
                continue;
            }
            if curr_head == curr_tail {
                if curr_next.is_null() {
                    // Empty queue: the peek observes nothing.
                    let d = self.load_desc(i);
                    if curr_tail == self.tail.load(Ordering::SeqCst)
                        && self.is_still_pending(i, counter)
                    {
                        let new_d =
                            OpDesc::with_value(ptr::null_mut(), d.counter(), DescTag::NotPending);
                        self.cas_desc(i, d, new_d);
                        self.hazards.clear_one(HP_NEXT, tid);
                        self.hazards.clear_one(HP_HEAD, tid);
                        self.hazards.clear_one(HP_TAIL, tid);
                    }
                } else {
                    self.hazards.clear_one(HP_HEAD, tid);
                    self.help_finish_push(tid);
                }
            } else {
                let d = self.load_desc(i);
                if !self.is_still_pending(i, counter) {
                    self.hazards.clear_one(HP_NEXT, tid);
                    self.hazards.clear_one(HP_HEAD, tid);
                    self.hazards.clear_one(HP_TAIL, tid);
                    break;
                }
                if curr_head == self.head.load(Ordering::SeqCst) {
                    // Write the observed head element into the descriptor.
                    // SAFETY: curr_next is protected; non-null on this branch.
                    let observed = unsafe { &*curr_next }.value;
                    let new_d = OpDesc::with_value(observed, d.counter(), DescTag::NotPending);
                    if !self.cas_desc(i, d, new_d) {
                        continue;
                    }
                }
                self.hazards.clear_one(HP_NEXT, tid);
                self.hazards.clear_one(HP_HEAD, tid);
                self.hazards.clear_one(HP_TAIL, tid);
            }
        }
    }

    /// The element at the front of the queue, or null if empty.
    ///
    /// Never unlinks. The returned pointer is only as alive as the caller's
    /// own protection of the element makes it.
    #[must_use]
    pub fn peek(&self, tid: usize) -> *mut T {
        let counter = self.next_stamp.fetch_add(1, Ordering::SeqCst);
        self.store_desc(
            tid,
            OpDesc::with_value(ptr::null_mut(), counter, DescTag::Peek),
        );
        self.help(counter, tid);
        self.help_finish_pop(tid);

        self.load_desc(tid).value()
    }

    /// Append `value` iff the current tail's timestamp is strictly below
    /// `value`'s. Out-of-order pushes complete as no-ops.
    ///
    /// # Safety
    ///
    /// `value` must point to a live element whose `timestamp()` is already
    /// final, and the caller must keep the element alive for as long as any
    /// participant can observe it through this queue.
    pub unsafe fn push_if(&self, value: *mut T, tid: usize) {
        // SAFETY: per the contract, value is live here.
        let value_ts = unsafe { &*value }.timestamp();
        let node = Box::into_raw(Box::new(MonoNode {
            next: AtomicPtr::new(ptr::null_mut()),
            push_tid: tid,
            pop_tid: AtomicUsize::new(self.max_threads),
            value,
            timestamp: AtomicU64::new(value_ts),
        }));

        let counter = self.next_stamp.fetch_add(1, Ordering::SeqCst);
        self.store_desc(tid, OpDesc::with_node(node, counter, DescTag::Push));
        self.help(counter, tid);
        self.help_finish_push(tid);
    }

    /// Unlink the front element iff its timestamp equals `expected`.
    ///
    /// Does not return the element; callers peeked it already.
    pub fn pop_if(&self, expected: u64, tid: usize) {
        let counter = self.next_stamp.fetch_add(1, Ordering::SeqCst);
        self.store_desc(tid, OpDesc::with_expected(expected, counter, DescTag::Pop));
        self.help(counter, tid);
        self.help_finish_pop(tid);
    }
}

impl<T: Stamped> Drop for MonotonicQueue<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::SeqCst);
        while !node.is_null() {
            // SAFETY: teardown is single-threaded; the chain from head owns
            // every remaining link node exactly once. Elements are weak
            // references and stay untouched.
            let next = unsafe { &*node }.next.load(Ordering::SeqCst);
            unsafe { drop(Box::from_raw(node)) };
            node = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        ts: u64,
    }

    impl Stamped for Item {
        fn timestamp(&self) -> u64 {
            self.ts
        }
    }

    fn leak(ts: u64) -> *mut Item {
        Box::into_raw(Box::new(Item { ts }))
    }

    fn reclaim(items: &[*mut Item]) {
        for &item in items {
            // SAFETY: test-owned allocations, freed once.
            unsafe { drop(Box::from_raw(item)) };
        }
    }

    #[test]
    fn test_peek_empty_is_null() {
        let q: MonotonicQueue<Item> = MonotonicQueue::new(1);
        assert!(q.peek(0).is_null());
    }

    #[test]
    fn test_out_of_order_push_is_rejected() {
        let q: MonotonicQueue<Item> = MonotonicQueue::new(1);
        let items = [leak(1), leak(3), leak(2)];

        for &item in &items {
            // SAFETY: items outlive the queue usage below.
            unsafe { q.push_if(item, 0) };
        }

        // The ts=2 push lost to the ts=3 tail: drain order is 1, 3.
        let first = q.peek(0);
        // SAFETY: peeked elements are alive (owned by this test).
        assert_eq!(unsafe { &*first }.ts, 1);
        q.pop_if(1, 0);

        let second = q.peek(0);
        assert_eq!(unsafe { &*second }.ts, 3);
        q.pop_if(3, 0);

        assert!(q.peek(0).is_null());

        drop(q);
        reclaim(&items);
    }

    #[test]
    fn test_pop_if_mismatch_is_noop() {
        let q: MonotonicQueue<Item> = MonotonicQueue::new(1);
        let items = [leak(5)];
        // SAFETY: item outlives the queue usage below.
        unsafe { q.push_if(items[0], 0) };

        q.pop_if(4, 0);
        let head = q.peek(0);
        // SAFETY: peeked element is alive (owned by this test).
        assert_eq!(unsafe { &*head }.ts, 5, "mismatched pop must not unlink");

        q.pop_if(5, 0);
        assert!(q.peek(0).is_null());

        drop(q);
        reclaim(&items);
    }

    #[test]
    fn test_monotone_drain() {
        let q: MonotonicQueue<Item> = MonotonicQueue::new(1);
        let items: Vec<_> = (1..=32u64).map(leak).collect();
        for &item in &items {
            // SAFETY: items outlive the queue usage below.
            unsafe { q.push_if(item, 0) };
        }

        let mut expected = 1u64;
        loop {
            let head = q.peek(0);
            if head.is_null() {
                break;
            }
            // SAFETY: peeked element is alive (owned by this test).
            let ts = unsafe { &*head }.ts;
            assert_eq!(ts, expected);
            q.pop_if(ts, 0);
            expected += 1;
        }
        assert_eq!(expected, 33);

        drop(q);
        reclaim(&items);
    }
}
