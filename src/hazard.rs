//! Filepath: src/hazard.rs
//!
//! Hazard-pointer registry for manual memory reclamation.
//!
//! Each participant owns `max_hps` protection slots and a private retire
//! list. Publishing a pointer into one of its slots pins the pointee: the
//! retire sweep skips anything that appears in any participant's slots.
//!
//! Queue link nodes need one extra guarantee before they may be freed: their
//! forward pointer must be unthreaded and their payload cleared, because a
//! helper that lost a race can still be about to read them through a stale
//! descriptor. The [`Reclaimable`] trait carries that predicate; plain
//! objects use the always-true default.
//!
//! # Progress
//!
//! `protect` retries are bounded by the number of concurrent publishers of
//! the source cell; `protect_ptr`, `clear`, and `clear_one` are wait-free;
//! `retire` sweeps in O(threads x slots + retire-list length).

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Gate for freeing a retired object.
///
/// The sweep only drops an object once no protection slot holds it **and**
/// `can_reclaim` returns true. Types whose lifetime is fully governed by
/// slot protection keep the default.
pub trait Reclaimable {
    /// True when the object carries no residual linkage and may be dropped.
    #[inline]
    fn can_reclaim(&self) -> bool {
        true
    }
}

/// Per-participant hazard slots plus private retire lists.
#[derive(Debug)]
pub struct HazardPointers<T> {
    max_hps: usize,
    max_threads: usize,
    /// Flat `max_threads x max_hps` slot matrix, row per participant.
    slots: Box<[AtomicPtr<T>]>,
    /// One retire list per participant, touched only by its owner.
    retired: Box<[UnsafeCell<Vec<*mut T>>]>,
}

// SAFETY: the slot matrix is atomics; each retire list is only accessed by
// the participant whose index it carries (and by `Drop`, which has `&mut`).
unsafe impl<T: Send> Send for HazardPointers<T> {}
unsafe impl<T: Send> Sync for HazardPointers<T> {}

impl<T> HazardPointers<T> {
    /// Create a registry with `max_hps` slots for each of `max_threads`
    /// participants.
    #[must_use]
    pub fn new(max_hps: usize, max_threads: usize) -> Self {
        let slots = (0..max_hps * max_threads)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let retired = (0..max_threads)
            .map(|_| UnsafeCell::new(Vec::new()))
            .collect();

        Self {
            max_hps,
            max_threads,
            slots,
            retired,
        }
    }

    #[inline]
    fn slot(&self, index: usize, tid: usize) -> &AtomicPtr<T> {
        &self.slots[tid * self.max_hps + index]
    }

    /// Pin the pointer currently held by `src` into slot `index`.
    ///
    /// Re-reads `src` until it observes the value it just published, closing
    /// the race with a concurrent retire that missed the publication.
    #[inline]
    pub fn protect(&self, index: usize, src: &AtomicPtr<T>, tid: usize) -> *mut T {
        let mut published: *mut T = ptr::null_mut();
        loop {
            let current = src.load(Ordering::SeqCst);
            if current == published {
                return current;
            }
            self.slot(index, tid).store(current, Ordering::SeqCst);
            published = current;
        }
    }

    /// Publish an already-loaded pointer into slot `index` and return it.
    ///
    /// The caller must re-validate the source itself; this is the raw store
    /// half of [`HazardPointers::protect`].
    #[inline]
    pub fn protect_ptr(&self, index: usize, ptr: *mut T, tid: usize) -> *mut T {
        self.slot(index, tid).store(ptr, Ordering::SeqCst);
        ptr
    }

    /// Clear every slot owned by `tid`.
    #[inline]
    pub fn clear(&self, tid: usize) {
        for index in 0..self.max_hps {
            self.slot(index, tid).store(ptr::null_mut(), Ordering::SeqCst);
        }
    }

    /// Clear a single slot owned by `tid`.
    #[inline]
    pub fn clear_one(&self, index: usize, tid: usize) {
        self.slot(index, tid).store(ptr::null_mut(), Ordering::SeqCst);
    }

    fn is_protected(&self, obj: *mut T) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.load(Ordering::SeqCst) == obj)
    }
}

impl<T: Reclaimable> HazardPointers<T> {
    /// Hand an unlinked object to `tid`'s retire list and sweep the list.
    ///
    /// Entries are freed once no slot protects them and their
    /// [`Reclaimable::can_reclaim`] predicate holds; the rest stay queued
    /// for a later sweep.
    ///
    /// # Safety contract (not enforced)
    ///
    /// `obj` must originate from `Box::into_raw`, be unreachable for new
    /// protections, and be retired exactly once.
    pub fn retire(&self, obj: *mut T, tid: usize) {
        debug_assert!(tid < self.max_threads);

        // SAFETY: the list at `tid` is only touched by its owning
        // participant, so this exclusive access cannot alias.
        let list = unsafe { &mut *self.retired[tid].get() };
        list.push(obj);

        list.retain(|&candidate| {
            if self.is_protected(candidate) {
                return true;
            }
            // SAFETY: candidate came from Box::into_raw and has not been
            // freed: it is still on this owner-private list.
            if !unsafe { &*candidate }.can_reclaim() {
                return true;
            }
            // SAFETY: unprotected and unthreaded, so no other participant
            // can reach it anymore.
            unsafe { drop(Box::from_raw(candidate)) };
            false
        });
    }
}

impl<T> Drop for HazardPointers<T> {
    fn drop(&mut self) {
        // Teardown is single-threaded; everything still queued is ours.
        for cell in &mut self.retired {
            let list = cell.get_mut();
            for &obj in list.iter() {
                // SAFETY: retired objects come from Box::into_raw and are
                // freed exactly once, here.
                unsafe { drop(Box::from_raw(obj)) };
            }
            list.clear();
        }
    }
}
