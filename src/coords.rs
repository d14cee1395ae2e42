//! Genomic coordinate ordering shared by the read and variant streams
//!
//! Both inputs are coordinate-sorted under the same (target id, 0-based
//! position) order. Every comparison in the crate (read vs variant, variant
//! vs variant, window eviction) goes through [`GenomicPos`].

use std::fmt;

/// A (reference sequence id, 0-based position) pair.
///
/// Field order matters: the derived `Ord` compares `tid` first, then `pos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenomicPos {
    /// Reference sequence id (BAM target id)
    pub tid: i32,
    /// 0-based position on that sequence
    pub pos: i64,
}

impl GenomicPos {
    pub fn new(tid: i32, pos: i64) -> Self {
        Self { tid, pos }
    }

    /// True iff `self` strictly precedes `other`.
    #[inline]
    pub fn precedes(&self, other: &GenomicPos) -> bool {
        self < other
    }
}

impl fmt::Display for GenomicPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {} pos {}", self.tid, self.pos)
    }
}
