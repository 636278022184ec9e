//! # Stamptree
//!
//! A wait-free concurrent ordered set of integers with asymptotically
//! efficient closed-interval range counts, after the wait-free trees of
//! Kokorin, Yudov, Aksenov, and Alistarh.
//!
//! ## Design
//!
//! The set is a binary search tree in which operations, not threads, are
//! the unit of scheduling. Every public call publishes an operation
//! descriptor, draws a stamp from a shared monotonic counter, and enqueues
//! itself — together with every concurrently published peer — into the
//! root's timestamp-ordered queue. Each node carries such a queue;
//! operations flow down the tree strictly in stamp order, applied by
//! whichever participant gets there first. Removals tombstone in place, and
//! subtrees whose change count outgrows their size are rebuilt into
//! perfectly balanced form, which is also when tombstones are physically
//! dropped.
//!
//! Range counts run in two phases: above the split point (the first node
//! inside the interval) they descend both flanks; below it each visited
//! node either claims an entire inner subtree's size in O(1) or forwards
//! the query one child further. Combined with the rebuilds this keeps a
//! count over any interval logarithmic amortized.
//!
//! ## Progress
//!
//! Every operation is linearizable (the shared stamp counter orders them)
//! and each participant's call is wait-free, with two documented gaps:
//! retired subtrees are only freed once every participant has re-entered
//! the engine, and the packed per-node state word needs a 16-byte CAS —
//! on targets without one, `portable-atomic` substitutes a brief blocking
//! fallback.
//!
//! ## Usage
//!
//! Callers are *participants*: construction fixes `max_threads`, and every
//! call takes a stable participant id `tid < max_threads`. At most one call
//! per participant may be in flight at a time.
//!
//! ```rust
//! use stamptree::StampTree;
//!
//! let tree: StampTree<u64> = StampTree::new(2);
//! assert!(tree.insert(10, 0));
//! assert!(tree.lookup(10, 0));
//! tree.remove(10, 0);
//! assert!(!tree.lookup(10, 0));
//! ```

pub mod hazard;
pub mod key;
pub mod node;
pub mod op;
pub mod queue;
pub mod state;
pub mod tree;

mod tracing_helpers;

pub use key::Key;
pub use tree::StampTree;
