//! Filepath: src/queue/waitfree.rs
//!
//! Multi-producer/multi-consumer wait-free FIFO.
//!
//! A Michael–Scott linked list driven through per-participant descriptors.
//! `push` and `pop` publish a descriptor, help every peer whose stamp is not
//! newer than their own, then finish their own descriptor. Link nodes are
//! reclaimed through a hazard-pointer registry whose sweep additionally
//! waits for the node to be unthreaded (`next` null, payload cleared) —
//! a helper holding a stale descriptor may still chase the node's links.
//!
//! The element type packs into a single 128-bit atomic cell via [`Slot`],
//! which covers both the plain value shape and the pair shapes used by the
//! tree (visit entries and staged subtree retirements).

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use portable_atomic::AtomicU128;

use crate::hazard::{HazardPointers, Reclaimable};
use crate::queue::{DescTag, pack_stamp, stamp_counter, stamp_tag};

// ============================================================================
//  Slot
// ============================================================================

/// A value storable in one 128-bit queue cell.
///
/// `EMPTY` doubles as the "queue was empty" pop result and as the cleared
/// payload a node must carry before its memory can be reclaimed, so it must
/// not collide with any value actually enqueued.
pub trait Slot: Copy + Eq + Send {
    /// The reserved empty value.
    const EMPTY: Self;

    /// Encode into a 128-bit cell.
    fn to_bits(self) -> u128;

    /// Decode from a 128-bit cell.
    fn from_bits(bits: u128) -> Self;
}

impl Slot for u64 {
    const EMPTY: Self = 0;

    #[inline]
    fn to_bits(self) -> u128 {
        u128::from(self)
    }

    #[inline]
    fn from_bits(bits: u128) -> Self {
        bits as Self
    }
}

// ============================================================================
//  Link nodes and descriptors
// ============================================================================

pub(crate) struct QueueNode<T: Slot> {
    next: AtomicPtr<QueueNode<T>>,
    push_tid: usize,
    /// Claiming participant of an in-flight pop; `max_threads` = unclaimed.
    pop_tid: AtomicUsize,
    value: AtomicU128,
    _marker: PhantomData<T>,
}

impl<T: Slot> QueueNode<T> {
    fn boxed(value: T, push_tid: usize, unclaimed: usize) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            push_tid,
            pop_tid: AtomicUsize::new(unclaimed),
            value: AtomicU128::new(value.to_bits()),
            _marker: PhantomData,
        }))
    }
}

impl<T: Slot> Reclaimable for QueueNode<T> {
    fn can_reclaim(&self) -> bool {
        // Unthreaded check: a popper clears both fields before retiring.
        self.next.load(Ordering::SeqCst).is_null()
            && T::from_bits(self.value.load(Ordering::SeqCst)) == T::EMPTY
    }
}

/// One participant's published queue operation.
#[derive(Clone, Copy, PartialEq, Eq)]
struct OpDesc<T: Slot> {
    node: *mut QueueNode<T>,
    stamp: u64,
}

impl<T: Slot> OpDesc<T> {
    #[inline]
    fn new(node: *mut QueueNode<T>, counter: u64, tag: DescTag) -> Self {
        Self {
            node,
            stamp: pack_stamp(tag, counter),
        }
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
        (u128::from(self.node as usize as u64) << 64) | u128::from(self.stamp)
    }

    #[inline]
    fn from_bits(bits: u128) -> Self {
        Self {
            node: ((bits >> 64) as usize) as *mut QueueNode<T>,
            stamp: bits as u64,
        }
    }
}

// ============================================================================
//  WaitFreeQueue
// ============================================================================

const HP_TAIL: usize = 0;
const HP_HEAD: usize = 1;
const HP_NEXT: usize = 2;

/// Wait-free MPMC FIFO for up to `max_threads` participants.
pub struct WaitFreeQueue<T: Slot> {
    max_threads: usize,
    head: AtomicPtr<QueueNode<T>>,
    tail: AtomicPtr<QueueNode<T>>,
    hazards: HazardPointers<QueueNode<T>>,
    descs: Box<[AtomicU128]>,
    next_stamp: AtomicU64,
}

// SAFETY: all shared mutation goes through atomics; link nodes are pinned by
// the embedded hazard registry before any cross-thread dereference.
unsafe impl<T: Slot> Send for WaitFreeQueue<T> {}
unsafe impl<T: Slot> Sync for WaitFreeQueue<T> {}

impl<T: Slot> WaitFreeQueue<T> {
    /// Create a queue for `max_threads` participants.
    #[must_use]
    pub fn new(max_threads: usize) -> Self {
        let dummy = QueueNode::boxed(T::EMPTY, 0, max_threads);
        let descs = (0..max_threads)
            .map(|_| AtomicU128::new(OpDesc::<T>::new(ptr::null_mut(), 0, DescTag::NotPending).to_bits()))
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

    /// Drive every peer descriptor with a stamp not newer than `counter`.
    fn help(&self, counter: u64, tid: usize) {
        for i in 0..self.max_threads {
            let d = self.load_desc(i);
            if d.tag() != DescTag::NotPending && d.counter() <= counter {
                match d.tag() {
                    DescTag::Push => self.help_push(i, counter, tid),
                    DescTag::Pop => self.help_pop(i, counter, tid),
                    _ => {}
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

            if curr_next.is_null() {
                if self.is_still_pending(i, counter) {
                    let node = self.load_desc(i).node;
                    // SAFETY: curr_tail is still hazard-protected.
                    if unsafe { &*curr_tail }
                        .next
                        .compare_exchange(curr_next, node, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.hazards.clear_one(HP_TAIL, tid);
                        self.hazards.clear_one(HP_NEXT, tid);
                        self.help_finish_push(tid);
                        return;
                    }
                }
            } else {
                self.hazards.clear_one(HP_TAIL, tid);
                self.hazards.clear_one(HP_NEXT, tid);
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
            if curr_tail == self.tail.load(Ordering::SeqCst) && d.node == curr_next {
                // Complete the owner first, then swing the tail.
                let new_d = OpDesc::new(d.node, d.counter(), DescTag::NotPending);
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
                    // Empty: complete the pop with a null node.
                    let d = self.load_desc(i);
                    if curr_tail == self.tail.load(Ordering::SeqCst)
                        && self.is_still_pending(i, counter)
                    {
                        let new_d =
                            OpDesc::new(ptr::null_mut(), d.counter(), DescTag::NotPending);
                        self.cas_desc(i, d, new_d);
                        self.hazards.clear_one(HP_NEXT, tid);
                        self.hazards.clear_one(HP_HEAD, tid);
                        self.hazards.clear_one(HP_TAIL, tid);
                    }
                } else {
                    // Tail is lagging; finish the in-flight push first.
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
                if curr_head == self.head.load(Ordering::SeqCst) && d.node != curr_head {
                    // Record which node this pop owns before claiming it.
                    let new_d = OpDesc::new(curr_head, d.counter(), d.tag());
                    if !self.cas_desc(i, d, new_d) {
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
                // Keep the node pointer so the owner can read its successor.
                let new_d = OpDesc::new(d.node, d.counter(), DescTag::NotPending);
                self.cas_desc(i, d, new_d);
                let _ = self.head.compare_exchange(
                    curr_head,
                    curr_next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
        self.hazards.clear_one(HP_HEAD, tid);
        self.hazards.clear_one(HP_NEXT, tid);
    }

    /// Append `value` for participant `tid`.
    pub fn push(&self, value: T, tid: usize) {
        let node = QueueNode::boxed(value, tid, self.max_threads);
        let counter = self.next_stamp.fetch_add(1, Ordering::SeqCst);
        self.store_desc(tid, OpDesc::new(node, counter, DescTag::Push));
        self.help(counter, tid);
        self.help_finish_push(tid);
    }

    /// Remove and return the oldest value, or [`Slot::EMPTY`] if none.
    pub fn pop(&self, tid: usize) -> T {
        let counter = self.next_stamp.fetch_add(1, Ordering::SeqCst);
        self.store_desc(tid, OpDesc::new(ptr::null_mut(), counter, DescTag::Pop));
        self.help(counter, tid);
        self.help_finish_pop(tid);

        let d = self.load_desc(tid);
        if d.node.is_null() {
            return T::EMPTY;
        }

        // SAFETY: d.node is the old head this pop claimed; nobody retires it
        // but us, and a claimed pop always has a non-null successor.
        let next = unsafe { &*d.node }.next.load(Ordering::SeqCst);
        // SAFETY: `next` became the new dummy; it cannot be reclaimed until
        // its value is cleared below, which only we do.
        let next_ref = unsafe { &*next };
        let value = T::from_bits(next_ref.value.load(Ordering::SeqCst));

        // Unthread before retiring so the conditional sweep can free it.
        next_ref.value.store(T::EMPTY.to_bits(), Ordering::SeqCst);
        // SAFETY: d.node is unlinked from the list and owned by this pop.
        unsafe { &*d.node }.next.store(ptr::null_mut(), Ordering::SeqCst);
        self.hazards.retire(d.node, tid);

        value
    }
}

impl<T: Slot> Drop for WaitFreeQueue<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::SeqCst);
        while !node.is_null() {
            // SAFETY: teardown is single-threaded; the chain from head owns
            // every remaining node exactly once.
            let next = unsafe { &*node }.next.load(Ordering::SeqCst);
            unsafe { drop(Box::from_raw(node)) };
            node = next;
        }
    }
}
