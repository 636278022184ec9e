//! Filepath: src/tree/actions.rs
//!
//! Per-operation actions at the fake root and at inner nodes.
//!
//! Every action follows the same shape: read the relevant child pointer and
//! its state snapshot, decide between terminating here and forwarding, and
//! finish with a conditional pop of the operation from the current queue.
//! Forwarding is a triple: record the child in the operation's visit queue,
//! CAS the child's state word to the operation's stamp (at most one CAS per
//! stamp ever succeeds per node), and push the operation into the child's
//! queue. The visit record always precedes the queue push, so the owner is
//! guaranteed to find every node its operation entered.
//!
//! Range counts carry extra bookkeeping: the first in-range node found
//! becomes the operation's split point, and below it each flank either
//! claims a whole inner subtree's size or forwards one step further.

use super::*;
use crate::state::NodeState;

impl<K: Key, const REBUILD: bool> StampTree<K, REBUILD> {
    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert action at the fake root. `op` must be hazard-protected.
    pub(super) fn root_insert(&self, op: *mut Operation<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let child = self.root_child.load(Ordering::SeqCst);

        if child.is_null() {
            let new_node = Node::boxed(
                self.max_threads,
                1,
                op_ref.value,
                NodeState::new(op_ref.timestamp(), 1, 0, true),
            );
            match self.root_child.compare_exchange(
                child,
                new_node,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => op_ref.success.store(true, Ordering::SeqCst),
                // Another helper of this same op installed its node first.
                // SAFETY: ours never became visible.
                Err(_) => unsafe { drop(Box::from_raw(new_node)) },
            }
        } else {
            // SAFETY: the tree root stays alive while any participant is
            // inside the engine.
            let child_ref = unsafe { &*child };
            let state = child_ref.state.load();

            if child_ref.key == op_ref.value {
                if state.last_timestamp() >= op_ref.timestamp() {
                    // Already applied here; just retire it from the queue.
                    self.root_ops.pop_if(op_ref.timestamp(), tid);
                    return;
                }

                if state.active() {
                    op_ref.mark_duplicate();
                } else {
                    // Reactivation is an insert applied at this node: the
                    // subtree regains one active member (this node itself).
                    let new_state = NodeState::new(
                        op_ref.timestamp(),
                        state.size().wrapping_add(1),
                        state.changes().wrapping_add(1),
                        true,
                    );
                    if child_ref.state.compare_exchange(state, new_state) {
                        op_ref.success.store(true, Ordering::SeqCst);
                    }
                }
            } else {
                self.forward_insert(op, child_ref, tid);
            }
        }

        self.root_ops.pop_if(op_ref.timestamp(), tid);
    }

    /// Insert action at inner node `n`. `op` must be hazard-protected.
    pub(super) fn node_insert(&self, op: *mut Operation<K>, n: &Node<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        // An insert terminates at its matching node, so the key differs
        // from n's whenever the op reaches n's queue.
        let side = if op_ref.value < n.key {
            &n.left
        } else {
            &n.right
        };

        let child = side.load(Ordering::SeqCst);
        if child.is_null() {
            let new_node = Node::boxed(
                self.max_threads,
                1,
                op_ref.value,
                NodeState::new(op_ref.timestamp(), 1, 0, true),
            );
            match side.compare_exchange(child, new_node, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => op_ref.success.store(true, Ordering::SeqCst),
                // SAFETY: the losing node never became visible.
                Err(_) => unsafe { drop(Box::from_raw(new_node)) },
            }
        } else {
            // SAFETY: children of a visited node stay alive under the
            // retirement mask.
            let child_ref = unsafe { &*child };
            if child_ref.key == op_ref.value {
                let state = child_ref.state.load();
                if state.last_timestamp() < op_ref.timestamp() {
                    if state.active() {
                        op_ref.mark_duplicate();
                    } else {
                        // Reactivation counts as an insert applied here.
                        let new_state = NodeState::new(
                            op_ref.timestamp(),
                            state.size().wrapping_add(1),
                            state.changes().wrapping_add(1),
                            true,
                        );
                        if child_ref.state.compare_exchange(state, new_state) {
                            op_ref.success.store(true, Ordering::SeqCst);
                        }
                    }
                }
            } else {
                self.forward_insert(op, child_ref, tid);
            }
        }

        n.ops.pop_if(op_ref.timestamp(), tid);
    }

    /// Forward an insert one level down: record the visit, bump the child's
    /// counters once for this stamp, and enqueue the op at the child.
    fn forward_insert(&self, op: *mut Operation<K>, child: &Node<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let state = child.state.load();

        op_ref.to_visit.push(
            Visit {
                node: child as *const Node<K> as *mut Node<K>,
                partial: 0,
            },
            tid,
        );
        if state.last_timestamp() < op_ref.timestamp() {
            let new_state = NodeState::new(
                op_ref.timestamp(),
                state.size().wrapping_add(1),
                state.changes().wrapping_add(1),
                state.active(),
            );
            child.state.compare_exchange(state, new_state);
        }
        // SAFETY: op is pinned by the caller's hazard slot for the push.
        unsafe { child.ops.push_if(op, tid) };
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    /// Remove action at the fake root. `op` must be hazard-protected.
    pub(super) fn root_remove(&self, op: *mut Operation<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let child = self.root_child.load(Ordering::SeqCst);

        if !child.is_null() {
            // SAFETY: the tree root stays alive while any participant is
            // inside the engine.
            self.apply_remove(op, unsafe { &*child }, tid);
        }

        self.root_ops.pop_if(op_ref.timestamp(), tid);
    }

    /// Remove action at inner node `n`. `op` must be hazard-protected.
    pub(super) fn node_remove(&self, op: *mut Operation<K>, n: &Node<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let child = if op_ref.value < n.key {
            n.left.load(Ordering::SeqCst)
        } else {
            n.right.load(Ordering::SeqCst)
        };

        if !child.is_null() {
            // SAFETY: children of a visited node stay alive under the
            // retirement mask.
            self.apply_remove(op, unsafe { &*child }, tid);
        }

        n.ops.pop_if(op_ref.timestamp(), tid);
    }

    /// Shared remove step: tombstone a matching child in place, forward the
    /// op through a non-matching one. Both decrement the subtree size.
    fn apply_remove(&self, op: *mut Operation<K>, child: &Node<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let state = child.state.load();
        let matches = child.key == op_ref.value;

        if !matches {
            op_ref.to_visit.push(
                Visit {
                    node: child as *const Node<K> as *mut Node<K>,
                    partial: 0,
                },
                tid,
            );
        }

        if state.last_timestamp() < op_ref.timestamp() {
            let new_state = NodeState::new(
                op_ref.timestamp(),
                state.size().wrapping_sub(1),
                state.changes().wrapping_add(1),
                state.active() && !matches,
            );
            child.state.compare_exchange(state, new_state);
        }

        if !matches {
            // SAFETY: op is pinned by the caller's hazard slot for the push.
            unsafe { child.ops.push_if(op, tid) };
        }
    }

    // ========================================================================
    //  Lookup
    // ========================================================================

    /// Lookup action at the fake root. `op` must be hazard-protected.
    pub(super) fn root_lookup(&self, op: *mut Operation<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let child = self.root_child.load(Ordering::SeqCst);

        if !child.is_null() {
            // SAFETY: the tree root stays alive while any participant is
            // inside the engine.
            self.apply_lookup(op, unsafe { &*child }, tid);
        }

        self.root_ops.pop_if(op_ref.timestamp(), tid);
    }

    /// Lookup action at inner node `n`. `op` must be hazard-protected.
    pub(super) fn node_lookup(&self, op: *mut Operation<K>, n: &Node<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let child = if op_ref.value < n.key {
            n.left.load(Ordering::SeqCst)
        } else {
            n.right.load(Ordering::SeqCst)
        };

        if !child.is_null() {
            // SAFETY: children of a visited node stay alive under the
            // retirement mask.
            self.apply_lookup(op, unsafe { &*child }, tid);
        }

        n.ops.pop_if(op_ref.timestamp(), tid);
    }

    /// Shared lookup step: answer at a matching child, forward through a
    /// non-matching one. Bumps the navigated child's last-seen stamp only.
    fn apply_lookup(&self, op: *mut Operation<K>, child: &Node<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let state = child.state.load();
        let matches = child.key == op_ref.value;

        if matches {
            if state.active() && state.last_timestamp() < op_ref.timestamp() {
                op_ref.success.store(true, Ordering::SeqCst);
            }
        } else {
            op_ref.to_visit.push(
                Visit {
                    node: child as *const Node<K> as *mut Node<K>,
                    partial: 0,
                },
                tid,
            );
        }

        if state.last_timestamp() < op_ref.timestamp() {
            let new_state = NodeState::new(
                op_ref.timestamp(),
                state.size(),
                state.changes(),
                state.active(),
            );
            child.state.compare_exchange(state, new_state);
        }

        if !matches {
            // SAFETY: op is pinned by the caller's hazard slot for the push.
            unsafe { child.ops.push_if(op, tid) };
        }
    }

    // ========================================================================
    //  Range count
    // ========================================================================

    /// Range-count action at the fake root. `op` must be hazard-protected.
    pub(super) fn root_range_count(&self, op: *mut Operation<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let child = self.root_child.load(Ordering::SeqCst);

        if !child.is_null() {
            // SAFETY: the tree root stays alive while any participant is
            // inside the engine.
            let child_ref = unsafe { &*child };
            if child_ref.key >= op_ref.value && child_ref.key <= op_ref.value2 {
                // The root is the topmost in-range node: the split point.
                // A tombstoned split point still partitions the traversal
                // but contributes nothing to the count.
                op_ref.try_set_split(child_ref.key);
                op_ref.to_visit.push(
                    Visit {
                        node: child,
                        partial: u32::from(child_ref.state.load().active()),
                    },
                    tid,
                );
                // SAFETY: op is pinned for the push.
                unsafe { child_ref.ops.push_if(op, tid) };
            }
            // Unconditional second record; the first-write-wins bookkeeping
            // in do_op keeps the in-range partial, and the duplicate queue
            // push is rejected by the monotonic admission.
            op_ref.to_visit.push(
                Visit {
                    node: child,
                    partial: 0,
                },
                tid,
            );
            // SAFETY: op is pinned for the push.
            unsafe { child_ref.ops.push_if(op, tid) };
        }

        self.root_ops.pop_if(op_ref.timestamp(), tid);
    }

    /// Range-count action at inner node `n`. `op` must be hazard-protected.
    pub(super) fn node_range_count(&self, op: *mut Operation<K>, n: &Node<K>, tid: usize) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        let split = op_ref.split_key();

        if split.is_sentinel() {
            // Above the split point: n itself is outside the interval, but
            // a child may be the topmost node inside it.
            let child = n.left.load(Ordering::SeqCst);
            if !child.is_null() {
                // SAFETY: children of a visited node stay alive under the
                // retirement mask.
                let child_ref = unsafe { &*child };
                if child_ref.key >= op_ref.value && child_ref.key <= op_ref.value2 {
                    op_ref.try_set_split(child_ref.key);
                    op_ref.to_visit.push(
                        Visit {
                            node: child,
                            partial: u32::from(child_ref.state.load().active()),
                        },
                        tid,
                    );
                    // SAFETY: op is pinned for the push.
                    unsafe { child_ref.ops.push_if(op, tid) };
                } else if n.key > op_ref.value2 {
                    // The whole interval lies left of n.
                    op_ref.to_visit.push(
                        Visit {
                            node: child,
                            partial: 0,
                        },
                        tid,
                    );
                    // SAFETY: op is pinned for the push.
                    unsafe { child_ref.ops.push_if(op, tid) };
                }
            }

            let child = n.right.load(Ordering::SeqCst);
            if !child.is_null() {
                // SAFETY: as above.
                let child_ref = unsafe { &*child };
                if child_ref.key >= op_ref.value && child_ref.key <= op_ref.value2 {
                    op_ref.try_set_split(child_ref.key);
                    op_ref.to_visit.push(
                        Visit {
                            node: child,
                            partial: u32::from(child_ref.state.load().active()),
                        },
                        tid,
                    );
                    // SAFETY: op is pinned for the push.
                    unsafe { child_ref.ops.push_if(op, tid) };
                } else if n.key < op_ref.value {
                    // The whole interval lies right of n.
                    op_ref.to_visit.push(
                        Visit {
                            node: child,
                            partial: 0,
                        },
                        tid,
                    );
                    // SAFETY: op is pinned for the push.
                    unsafe { child_ref.ops.push_if(op, tid) };
                }
            }
        } else if n.key == split {
            // At the split point: fork into the two flanks.
            let child = n.left.load(Ordering::SeqCst);
            if !child.is_null() && n.key != op_ref.value {
                // SAFETY: as above.
                let child_ref = unsafe { &*child };
                let counted = child_ref.key >= op_ref.value && child_ref.state.load().active();
                op_ref.to_visit.push(
                    Visit {
                        node: child,
                        partial: u32::from(counted),
                    },
                    tid,
                );
                // SAFETY: op is pinned for the push.
                unsafe { child_ref.ops.push_if(op, tid) };
            }

            let child = n.right.load(Ordering::SeqCst);
            if !child.is_null() && n.key != op_ref.value2 {
                // SAFETY: as above.
                let child_ref = unsafe { &*child };
                let counted = child_ref.key <= op_ref.value2 && child_ref.state.load().active();
                op_ref.to_visit.push(
                    Visit {
                        node: child,
                        partial: u32::from(counted),
                    },
                    tid,
                );
                // SAFETY: op is pinned for the push.
                unsafe { child_ref.ops.push_if(op, tid) };
            }
        } else if n.key > split {
            // Upper flank: inner side faces the split, bound is the upper end.
            self.split_descend(
                op,
                n,
                n.left.load(Ordering::SeqCst),
                n.right.load(Ordering::SeqCst),
                op_ref.value2,
                false,
                tid,
            );
        } else {
            // Lower flank: mirror image against the lower bound.
            self.split_descend(
                op,
                n,
                n.right.load(Ordering::SeqCst),
                n.left.load(Ordering::SeqCst),
                op_ref.value,
                true,
                tid,
            );
        }

        n.ops.pop_if(op_ref.timestamp(), tid);
    }

    /// One step of a split range count along a flank.
    ///
    /// `inner` faces the split point and is entirely in-range whenever `n`
    /// is; `outer` faces the interval bound. `lower` selects which half's
    /// claim cell absorbs a terminal inner-subtree total.
    #[allow(clippy::too_many_arguments)]
    fn split_descend(
        &self,
        op: *mut Operation<K>,
        n: &Node<K>,
        inner: *mut Node<K>,
        outer: *mut Node<K>,
        bound: K,
        lower: bool,
        tid: usize,
    ) {
        // SAFETY: op is pinned by the caller's hazard slot.
        let op_ref = unsafe { &*op };
        // Strictly between the split point and the bound, bound excluded.
        let inside = |key: K| if lower { key > bound } else { key < bound };

        if inside(n.key) {
            // n is in range: the whole inner subtree is too. Claim its size
            // and continue along the outer side.
            let inner_size = if inner.is_null() {
                0
            } else {
                // SAFETY: children of a visited node stay alive under the
                // retirement mask. The node queue was drained up to this
                // op's stamp before this read, so the size is current.
                unsafe { &*inner }.state.load().size()
            };

            if outer.is_null() {
                let cell = if lower {
                    &op_ref.lower_count
                } else {
                    &op_ref.upper_count
                };
                let _ = cell.compare_exchange(0, inner_size, Ordering::SeqCst, Ordering::SeqCst);
            } else {
                // SAFETY: as above.
                let outer_ref = unsafe { &*outer };
                let outer_in = (inside(outer_ref.key) || outer_ref.key == bound)
                    && outer_ref.state.load().active();
                op_ref.to_visit.push(
                    Visit {
                        node: outer,
                        partial: inner_size + u32::from(outer_in),
                    },
                    tid,
                );
                // SAFETY: op is pinned for the push.
                unsafe { outer_ref.ops.push_if(op, tid) };
            }
        } else if n.key == bound {
            // n closes the interval: the inner subtree finishes this flank.
            if !inner.is_null() {
                // SAFETY: as above.
                let inner_size = unsafe { &*inner }.state.load().size();
                let cell = if lower {
                    &op_ref.lower_count
                } else {
                    &op_ref.upper_count
                };
                let _ = cell.compare_exchange(0, inner_size, Ordering::SeqCst, Ordering::SeqCst);
            }
        } else {
            // n overshot the bound: only the inner side can intersect.
            if !inner.is_null() {
                // SAFETY: as above.
                let inner_ref = unsafe { &*inner };
                let inner_in = (inside(inner_ref.key) || inner_ref.key == bound)
                    && inner_ref.state.load().active();
                op_ref.to_visit.push(
                    Visit {
                        node: inner,
                        partial: u32::from(inner_in),
                    },
                    tid,
                );
                // SAFETY: op is pinned for the push.
                unsafe { inner_ref.ops.push_if(op, tid) };
            }
        }
    }
}
