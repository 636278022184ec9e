//! Filepath: src/state.rs
//!
//! Packed node state word.
//!
//! [`NodeState`] combines the active flag, the last timestamp seen at the
//! node, the active-subtree size, and the change counter in a single `u128`
//! so that every update is one full-word CAS. [`AtomicNodeState`] wraps the
//! word in a [`portable_atomic::AtomicU128`], which compiles to a native
//! 16-byte CAS where the target has one and to portable-atomic's fallback
//! everywhere else.
//!
//! # Concurrency Model
//!
//! 1. Readers: `load()` a snapshot, inspect fields.
//! 2. Writers: build a new [`NodeState`] from the snapshot and
//!    `compare_exchange`. A lost CAS means a peer applied the same
//!    timestamped update first; the loser moves on.
//!
//! The update protocol keeps `last_timestamp` monotonically non-decreasing:
//! an op only attempts the CAS when the snapshot's timestamp is strictly
//! below its own, and at most one op per timestamp reaches any given queue.

use portable_atomic::{AtomicU128, Ordering};

// ============================================================================
//  Bit Layout
// ============================================================================

/// Active flag: the node's key is currently a member of the set.
const ACTIVE_BIT: u128 = 1 << 127;

/// Low bit of the 63-bit last-seen-timestamp field.
const TS_SHIFT: u32 = 64;

/// Mask of the timestamp field (63 bits, below the active bit).
const TS_MASK: u128 = ((1 << 63) - 1) << TS_SHIFT;

/// Low bit of the 32-bit subtree-size field.
const SIZE_SHIFT: u32 = 32;

/// Mask of the subtree-size field.
const SIZE_MASK: u128 = 0xFFFF_FFFF << SIZE_SHIFT;

/// Mask of the change-counter field (lowest 32 bits).
const CHANGES_MASK: u128 = 0xFFFF_FFFF;

// ============================================================================
//  NodeState
// ============================================================================

/// A decoded-on-demand snapshot of a node's packed state word.
///
/// # Layout
/// Bit 127: `active` | Bits 64-126: `last_timestamp` |
/// Bits 32-63: `size` | Bits 0-31: `changes`
///
/// # Example
///
/// ```rust
/// use stamptree::state::NodeState;
///
/// let s = NodeState::new(7, 3, 1, true);
///
/// assert!(s.active());
/// assert_eq!(s.last_timestamp(), 7);
/// assert_eq!(s.size(), 3);
/// assert_eq!(s.changes(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState(u128);

impl NodeState {
    /// Pack a new state word.
    ///
    /// `last_timestamp` is truncated to 63 bits; the shared operation
    /// counter never reaches that range in practice.
    #[must_use]
    pub const fn new(last_timestamp: u64, size: u32, changes: u32, active: bool) -> Self {
        let ts = ((last_timestamp as u128) << TS_SHIFT) & TS_MASK;
        let active_bit = if active { ACTIVE_BIT } else { 0 };

        Self(active_bit | ts | ((size as u128) << SIZE_SHIFT) | changes as u128)
    }

    /// Check whether the node's key is a current member.
    #[inline]
    #[must_use]
    pub const fn active(self) -> bool {
        self.0 & ACTIVE_BIT != 0
    }

    /// The highest operation timestamp applied at this node.
    #[inline]
    #[must_use]
    pub const fn last_timestamp(self) -> u64 {
        ((self.0 & TS_MASK) >> TS_SHIFT) as u64
    }

    /// Active keys in the subtree rooted here, self included when active.
    #[inline]
    #[must_use]
    pub const fn size(self) -> u32 {
        ((self.0 & SIZE_MASK) >> SIZE_SHIFT) as u32
    }

    /// Insert/remove events applied below here since the last rebuild.
    #[inline]
    #[must_use]
    pub const fn changes(self) -> u32 {
        (self.0 & CHANGES_MASK) as u32
    }

    /// The raw packed word.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u128 {
        self.0
    }

    /// Rehydrate from a raw packed word.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }
}

// ============================================================================
//  AtomicNodeState
// ============================================================================

/// The atomic cell holding a node's packed state word.
#[derive(Debug)]
pub struct AtomicNodeState {
    value: AtomicU128,
}

impl AtomicNodeState {
    /// Create a cell holding `state`.
    #[must_use]
    pub const fn new(state: NodeState) -> Self {
        Self {
            value: AtomicU128::new(state.bits()),
        }
    }

    /// Snapshot the current state word.
    #[inline]
    #[must_use]
    pub fn load(&self) -> NodeState {
        NodeState::from_bits(self.value.load(Ordering::SeqCst))
    }

    /// Replace `current` with `new` if the word is unchanged.
    ///
    /// Returns `true` on success. A failed exchange is not retried by
    /// callers: the protocol guarantees a peer applied an equivalent update.
    #[inline]
    pub fn compare_exchange(&self, current: NodeState, new: NodeState) -> bool {
        self.value
            .compare_exchange(
                current.bits(),
                new.bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
