//! Filepath: src/op.rs
//!
//! Operation descriptors.
//!
//! Every public call allocates one [`Operation`], publishes it in the
//! caller's slot, and retires it through the operation hazard registry when
//! the call returns. Peers may still hold the descriptor through the root
//! or node queues at that point; the registry keeps it alive until every
//! protection slot lets go.
//!
//! All result fields are atomics because any helper may complete the work:
//! `success` for insert/lookup, `split`/`lower_count`/`upper_count` for
//! range counts. Helpers race to write them, and every write is either a
//! CAS from the unset value or an idempotent store of the same outcome.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::hazard::Reclaimable;
use crate::key::Key;
use crate::node::Visit;
use crate::queue::monotonic::Stamped;
use crate::queue::waitfree::WaitFreeQueue;

/// What a public call asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Remove,
    Lookup,
    RangeCount,
}

/// A published operation, shared with every helping participant.
pub struct Operation<K: Key> {
    pub(crate) kind: OpKind,
    /// Stamp from the shared counter; 0 until assigned.
    pub(crate) timestamp: AtomicU64,
    /// Nodes this operation still has to visit, with partial range counts.
    pub(crate) to_visit: WaitFreeQueue<Visit<K>>,
    /// The key, or the lower bound of a range count.
    pub(crate) value: K,
    /// The upper bound of a range count; sentinel otherwise.
    pub(crate) value2: K,
    /// First in-range key discovered by a range count; sentinel = unset.
    split: AtomicU64,
    /// Subtree totals claimed below the split point, one per half.
    pub(crate) lower_count: AtomicU32,
    pub(crate) upper_count: AtomicU32,
    /// Insert/lookup outcome.
    pub(crate) success: AtomicBool,
}

impl<K: Key> Operation<K> {
    /// Allocate a fresh, unstamped operation.
    #[must_use]
    pub(crate) fn new(kind: OpKind, value: K, value2: K, max_threads: usize) -> Self {
        Self {
            kind,
            timestamp: AtomicU64::new(0),
            to_visit: WaitFreeQueue::new(max_threads),
            value,
            value2,
            split: AtomicU64::new(K::SENTINEL.to_word()),
            lower_count: AtomicU32::new(0),
            upper_count: AtomicU32::new(0),
            success: AtomicBool::new(false),
        }
    }

    /// Claim the stamp for this operation; loses to a concurrent stamper.
    ///
    /// Returns the stamp the operation ended up with either way.
    pub(crate) fn stamp(&self, timestamp: u64) -> u64 {
        match self
            .timestamp
            .compare_exchange(0, timestamp, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => timestamp,
            Err(existing) => existing,
        }
    }

    /// The split-point key, sentinel while unset.
    #[inline]
    pub(crate) fn split_key(&self) -> K {
        K::from_word(self.split.load(Ordering::SeqCst))
    }

    /// First-writer-wins claim of the split point.
    pub(crate) fn try_set_split(&self, key: K) {
        let _ = self.split.compare_exchange(
            K::SENTINEL.to_word(),
            key.to_word(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Mark a duplicate insert. Observed nowhere; `success` stays false.
    pub(crate) fn mark_duplicate(&self) {
        self.split.store(self.value.to_word(), Ordering::SeqCst);
    }
}

impl<K: Key> Stamped for Operation<K> {
    #[inline]
    fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }
}

// Operations are freed purely by slot protection; the visit queue they own
// unthreads its nodes itself.
impl<K: Key> Reclaimable for Operation<K> {}
