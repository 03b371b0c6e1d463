//! File state flags and their per-directory aggregate.

use bitflags::bitflags;

bitflags! {
    /// Status bits of a tracked file.
    ///
    /// The meaning of each bit belongs to the caller; the tree only answers
    /// set/unset containment queries over them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StateFlags: u16 {
        /// Present in the first parent.
        const EXIST_P1   = 1 << 0;
        /// Present in the second parent.
        const EXIST_P2   = 1 << 1;
        /// Present in the snapshot being built.
        const EXIST_NEXT = 1 << 2;
        /// Matched by ignore rules.
        const IGNORED    = 1 << 3;
        /// Must be re-checked on disk.
        const NEED_CHECK = 1 << 4;
        /// Has a copy source.
        const COPIED     = 1 << 5;
    }
}

impl StateFlags {
    /// Whether these flags contain every bit of `set` and none of `unset`.
    pub fn matches(self, set: StateFlags, unset: StateFlags) -> bool {
        self.contains(set) && !self.intersects(unset)
    }

    /// Decode from the on-disk representation, rejecting unknown bits.
    pub(crate) fn from_stored(bits: u16) -> Option<Self> {
        StateFlags::from_bits(bits)
    }
}

/// Union and intersection of the flags of every file below a directory.
///
/// An empty directory aggregates to all-empty, which is conservative: it
/// never causes a subtree holding a match to be skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregatedState {
    pub union: StateFlags,
    pub intersection: StateFlags,
}

impl AggregatedState {
    /// Aggregate of a single file.
    pub fn of_file(flags: StateFlags) -> Self {
        Self {
            union: flags,
            intersection: flags,
        }
    }

    /// Combine two aggregates.
    pub fn merge(self, other: AggregatedState) -> Self {
        Self {
            union: self.union | other.union,
            intersection: self.intersection & other.intersection,
        }
    }

    /// Whether a subtree with this aggregate can hold a file matching the filter.
    pub fn may_match(&self, set: StateFlags, unset: StateFlags) -> bool {
        self.union.contains(set) && !self.intersection.intersects(unset)
    }
}
