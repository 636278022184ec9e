//! Filepath: src/tree/test_hooks.rs
//!
//! Quiescent-only introspection for the test suites.
//!
//! These walk the tree with plain loads and no helping, so they are only
//! meaningful after every participant has returned from its last call.

use super::*;

impl<K: Key, const REBUILD: bool> StampTree<K, REBUILD> {
    /// Longest root-to-leaf path, tombstones included. Quiescent-only.
    #[doc(hidden)]
    #[must_use]
    pub fn height(&self) -> usize {
        fn walk<K: Key>(node: *mut Node<K>) -> usize {
            if node.is_null() {
                return 0;
            }
            // SAFETY: quiescent tree; nodes cannot be retired under us.
            let node_ref = unsafe { &*node };
            1 + walk(node_ref.left.load(Ordering::SeqCst))
                .max(walk(node_ref.right.load(Ordering::SeqCst)))
        }

        walk(self.root_child.load(Ordering::SeqCst))
    }

    /// Number of active (non-tombstoned) nodes. Quiescent-only.
    #[doc(hidden)]
    #[must_use]
    pub fn active_count(&self) -> usize {
        fn walk<K: Key>(node: *mut Node<K>) -> usize {
            if node.is_null() {
                return 0;
            }
            // SAFETY: quiescent tree; nodes cannot be retired under us.
            let node_ref = unsafe { &*node };
            usize::from(node_ref.state.load().active())
                + walk(node_ref.left.load(Ordering::SeqCst))
                + walk(node_ref.right.load(Ordering::SeqCst))
        }

        walk(self.root_child.load(Ordering::SeqCst))
    }
}
