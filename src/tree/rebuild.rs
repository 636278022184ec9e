//! Filepath: src/tree/rebuild.rs
//!
//! Weight-triggered subtree rebuilds.
//!
//! A subtree is rebuilt once its change counter outgrows half its size at
//! construction (ignoring trivially small subtrees). The rebuild drains
//! every queue in the subtree up to the triggering stamp — with rebuilds
//! disabled, so the drain cannot recurse — collects the active keys, and
//! builds a perfectly balanced replacement whose nodes are stamped one
//! below the trigger, which lets the triggering operation traverse the
//! fresh subtree afterwards. The parent pointer is swapped by CAS; the
//! loser tears its build down, the winner stages the old subtree for
//! mask-gated reclamation. Either way the caller must reload its queue
//! head, because peer operations advanced underneath.
//!
//! Rebuilds double as the physical remove: tombstones are simply not
//! collected.

use std::collections::VecDeque;

use super::*;
use crate::state::NodeState;

/// Rebuild trigger: enough churn relative to the built size, and not a
/// subtree too small to matter.
fn needs_rebuild(state: NodeState, init_size: u64) -> bool {
    u64::from(state.changes()) > init_size / 2 && (state.size() > 5 || init_size > 5)
}

impl<K: Key, const REBUILD: bool> StampTree<K, REBUILD> {
    /// Rebuild the fake root's child if it needs it.
    ///
    /// Returns false when the caller must reload its queue head.
    pub(super) fn rebuild_root(&self, timestamp: u64, tid: usize) -> bool {
        let child = self.root_child.load(Ordering::SeqCst);
        if child.is_null() {
            return true;
        }
        // SAFETY: the tree root stays alive while any participant is inside
        // the engine.
        let child_ref = unsafe { &*child };
        if !needs_rebuild(child_ref.state.load(), child_ref.init_size) {
            return true;
        }

        debug_log!(tid, timestamp, "rebuilding root subtree");
        let fresh = self.rebuild(child, timestamp, tid);
        match self
            .root_child
            .compare_exchange(child, fresh, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.stage_retire(child, tid);
                false
            }
            Err(_) => {
                if !fresh.is_null() {
                    // SAFETY: the losing build was never published.
                    unsafe { Self::free_subtree(fresh) };
                }
                false
            }
        }
    }

    /// Rebuild either child of `n` if it needs it.
    ///
    /// Returns false when the caller must reload its queue head.
    pub(super) fn rebuild_children(&self, n: &Node<K>, timestamp: u64, tid: usize) -> bool {
        let mut swapped = false;

        for side in [&n.left, &n.right] {
            let child = side.load(Ordering::SeqCst);
            if child.is_null() {
                continue;
            }
            // SAFETY: children of a visited node stay alive under the
            // retirement mask.
            let child_ref = unsafe { &*child };
            if !needs_rebuild(child_ref.state.load(), child_ref.init_size) {
                continue;
            }

            debug_log!(tid, timestamp, "rebuilding inner subtree");
            let fresh = self.rebuild(child, timestamp, tid);
            match side.compare_exchange(child, fresh, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    self.stage_retire(child, tid);
                    swapped = true;
                }
                Err(_) => {
                    if !fresh.is_null() {
                        // SAFETY: the losing build was never published.
                        unsafe { Self::free_subtree(fresh) };
                    }
                    return false;
                }
            }
        }

        !swapped
    }

    /// Materialize a balanced replacement for the subtree at `n`.
    ///
    /// Null when every key below `n` is tombstoned.
    fn rebuild(&self, n: *mut Node<K>, timestamp: u64, tid: usize) -> *mut Node<K> {
        // Pass 1: complete every pending operation up to the trigger stamp,
        // breadth-first, with rebuilds suppressed.
        let mut frontier: VecDeque<*mut Node<K>> = VecDeque::new();
        frontier.push_back(n);
        while let Some(node) = frontier.pop_front() {
            self.execute_until_timestamp(node, timestamp, tid, false);

            // SAFETY: subtree nodes stay alive under the retirement mask.
            let node_ref = unsafe { &*node };
            for child in [
                node_ref.left.load(Ordering::SeqCst),
                node_ref.right.load(Ordering::SeqCst),
            ] {
                if !child.is_null() {
                    frontier.push_back(child);
                }
            }
        }

        // Pass 2: collect the keys that survived.
        // SAFETY: as above.
        let n_ref = unsafe { &*n };
        let snapshot = n_ref.state.load();
        let mut keys: Vec<K> =
            Vec::with_capacity(n_ref.init_size as usize + snapshot.changes() as usize);
        frontier.push_back(n);
        while let Some(node) = frontier.pop_front() {
            // SAFETY: as above.
            let node_ref = unsafe { &*node };
            if node_ref.state.load().active() {
                keys.push(node_ref.key);
            }
            for child in [
                node_ref.left.load(Ordering::SeqCst),
                node_ref.right.load(Ordering::SeqCst),
            ] {
                if !child.is_null() {
                    frontier.push_back(child);
                }
            }
        }

        keys.sort_unstable();
        if keys.is_empty() {
            return std::ptr::null_mut();
        }
        self.build_subtree(&keys, timestamp)
    }

    /// Build a perfectly balanced subtree over sorted `keys`, every node
    /// stamped just below `timestamp` so the triggering operation can still
    /// traverse it.
    pub(super) fn build_subtree(&self, keys: &[K], timestamp: u64) -> *mut Node<K> {
        if keys.is_empty() {
            return std::ptr::null_mut();
        }

        let mid = (keys.len() - 1) / 2;
        let size = keys.len() as u32;
        let node = Node::boxed(
            self.max_threads,
            u64::from(size),
            keys[mid],
            NodeState::new(timestamp - 1, size, 0, true),
        );

        // SAFETY: freshly allocated, exclusively ours until published.
        let node_ref = unsafe { &*node };
        node_ref
            .left
            .store(self.build_subtree(&keys[..mid], timestamp), Ordering::SeqCst);
        node_ref.right.store(
            self.build_subtree(&keys[mid + 1..], timestamp),
            Ordering::SeqCst,
        );

        node
    }

    /// Stage an unlinked subtree for mask-gated reclamation.
    fn stage_retire(&self, old_root: *mut Node<K>, tid: usize) {
        self.to_be_deleted.push(
            RetireEntry {
                flags: self.set_mask.load(Ordering::SeqCst),
                node: old_root,
            },
            tid,
        );
        self.staged_len.fetch_add(1, Ordering::SeqCst);
    }
}
