//! Filepath: src/key.rs
//!
//! Key abstraction for the tree.
//!
//! Keys are totally ordered integer scalars with a reserved zero value
//! ([`Key::SENTINEL`]). The sentinel is rejected by `insert` and doubles as
//! the internal "unset" marker in per-operation atomic cells, so it can never
//! be a member of the set.
//!
//! Every key must round-trip losslessly through a `u64` word
//! ([`Key::to_word`]/[`Key::from_word`]). Atomic cells holding keys (the
//! range split point) store the word representation in an `AtomicU64`; the
//! cells are only ever compared for equality and CAS'd from the sentinel
//! word, so the encoding does not need to preserve ordering.

/// An ordered integer key with a reserved zero sentinel.
pub trait Key: Copy + Ord + Send + Sync + 'static {
    /// The reserved "unset" value. Illegal as a user key.
    const SENTINEL: Self;

    /// Encode into a `u64` word for atomic storage.
    fn to_word(self) -> u64;

    /// Decode from a `u64` word produced by [`Key::to_word`].
    fn from_word(word: u64) -> Self;

    /// Check for the reserved sentinel.
    #[inline]
    fn is_sentinel(self) -> bool {
        self == Self::SENTINEL
    }
}

impl Key for u64 {
    const SENTINEL: Self = 0;

    #[inline]
    fn to_word(self) -> u64 {
        self
    }

    #[inline]
    fn from_word(word: u64) -> Self {
        word
    }
}

impl Key for u32 {
    const SENTINEL: Self = 0;

    #[inline]
    fn to_word(self) -> u64 {
        u64::from(self)
    }

    #[inline]
    fn from_word(word: u64) -> Self {
        word as Self
    }
}

impl Key for usize {
    const SENTINEL: Self = 0;

    #[inline]
    fn to_word(self) -> u64 {
        self as u64
    }

    #[inline]
    fn from_word(word: u64) -> Self {
        word as Self
    }
}

// Signed keys are stored by bit pattern. The word is only compared for
// equality, never ordered, so sign handling is a plain cast both ways.

impl Key for i64 {
    const SENTINEL: Self = 0;

    #[inline]
    fn to_word(self) -> u64 {
        self as u64
    }

    #[inline]
    fn from_word(word: u64) -> Self {
        word as Self
    }
}

impl Key for i32 {
    const SENTINEL: Self = 0;

    #[inline]
    fn to_word(self) -> u64 {
        u64::from(self as u32)
    }

    #[inline]
    fn from_word(word: u64) -> Self {
        word as u32 as Self
    }
}
