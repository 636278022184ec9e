//! Filepath: src/node.rs
//!
//! Tree nodes and the queue slot types that carry them.
//!
//! A [`Node`] owns its packed state word, two atomic child pointers, and a
//! monotonic queue of the operations still pending at this position. The
//! key is immutable after construction; membership changes flip the active
//! bit in the state word, and physical unlinking only happens when a whole
//! subtree is swapped out by a rebuild.

use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::key::Key;
use crate::op::Operation;
use crate::queue::monotonic::MonotonicQueue;
use crate::queue::waitfree::Slot;
use crate::state::{AtomicNodeState, NodeState};

/// One position in the tree.
pub struct Node<K: Key> {
    pub(crate) state: AtomicNodeState,
    /// Operations routed through this node, in timestamp order.
    pub(crate) ops: MonotonicQueue<Operation<K>>,
    /// Subtree size at construction; the rebuild trigger baseline.
    pub(crate) init_size: u64,
    pub(crate) key: K,
    pub(crate) left: AtomicPtr<Node<K>>,
    pub(crate) right: AtomicPtr<Node<K>>,
}

impl<K: Key> Node<K> {
    /// Heap-allocate a node and leak it to the tree's ownership.
    pub(crate) fn boxed(
        max_threads: usize,
        init_size: u64,
        key: K,
        state: NodeState,
    ) -> *mut Self {
        Box::into_raw(Box::new(Self {
            state: AtomicNodeState::new(state),
            ops: MonotonicQueue::new(max_threads),
            init_size,
            key,
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

// ============================================================================
//  Queue slots carrying nodes
// ============================================================================

/// A pending visit: the node to process plus the partial range-count
/// contribution discovered by whoever scheduled the visit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Visit<K: Key> {
    pub node: *mut Node<K>,
    pub partial: u32,
}

// SAFETY: the pointer half is only dereferenced by engine participants that
// drain node queues under the engine's protection protocol.
unsafe impl<K: Key> Send for Visit<K> {}

impl<K: Key> Slot for Visit<K> {
    const EMPTY: Self = Self {
        node: ptr::null_mut(),
        partial: 0,
    };

    #[inline]
    fn to_bits(self) -> u128 {
        (u128::from(self.node as usize as u64) << 64) | u128::from(self.partial)
    }

    #[inline]
    fn from_bits(bits: u128) -> Self {
        Self {
            node: ((bits >> 64) as usize) as *mut Node<K>,
            partial: bits as u32,
        }
    }
}

/// A detached subtree staged for reclamation, with the participant mask
/// recorded when it was unlinked. The subtree is freed once every
/// participant's bit has been observed set afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct RetireEntry<K: Key> {
    pub flags: u64,
    pub node: *mut Node<K>,
}

// SAFETY: the pointer half names an unlinked subtree; only the participant
// that completes the mask dereferences (frees) it.
unsafe impl<K: Key> Send for RetireEntry<K> {}

impl<K: Key> Slot for RetireEntry<K> {
    const EMPTY: Self = Self {
        flags: 0,
        node: ptr::null_mut(),
    };

    #[inline]
    fn to_bits(self) -> u128 {
        (u128::from(self.node as usize as u64) << 64) | u128::from(self.flags)
    }

    #[inline]
    fn from_bits(bits: u128) -> Self {
        Self {
            node: ((bits >> 64) as usize) as *mut Node<K>,
            flags: bits as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_slot_roundtrip() {
        let node = Node::<u64>::boxed(1, 1, 42, NodeState::new(1, 1, 0, true));
        let visit = Visit { node, partial: 7 };

        let decoded = Visit::<u64>::from_bits(visit.to_bits());
        assert_eq!(decoded, visit);
        assert_eq!(decoded.partial, 7);

        assert_eq!(Visit::<u64>::EMPTY.node, ptr::null_mut());
        // SAFETY: freshly allocated above, freed once.
        unsafe { drop(Box::from_raw(node)) };
    }

    #[test]
    fn test_retire_entry_roundtrip() {
        let node = Node::<u64>::boxed(1, 1, 9, NodeState::new(1, 1, 0, true));
        let entry = RetireEntry {
            flags: 0b1011,
            node,
        };

        let decoded = RetireEntry::<u64>::from_bits(entry.to_bits());
        assert_eq!(decoded, entry);
        assert_eq!(decoded.flags, 0b1011);
        // SAFETY: freshly allocated above, freed once.
        unsafe { drop(Box::from_raw(node)) };
    }
}
