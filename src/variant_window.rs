//! Sliding window of variants relevant to the read in flight
//!
//! Both streams are coordinate-sorted, so the window only ever moves forward.
//! Per read, [`VariantWindow::resync`] runs three phases:
//!
//! 1. catch-up: discard look-ahead variants that precede the read start
//! 2. fill: move look-ahead variants that precede the read end into the window
//! 3. evict: drop windowed variants that precede the read start
//!
//! A mis-sorted input silently yields an incomplete window; sortedness is a
//! caller obligation and is not checked here.

use std::collections::VecDeque;

use anyhow::Result;
use log::debug;

use crate::coords::GenomicPos;
use crate::records::VariantRecord;

/// Window bookkeeping counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WindowStats {
    /// Variants discarded because no remaining read can reach them
    pub variants_skipped: usize,
    /// Variants pulled into the window
    pub variants_windowed: usize,
    /// Windowed variants dropped once reads moved past them
    pub variants_evicted: usize,
}

impl WindowStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            variants_skipped: self.variants_skipped + other.variants_skipped,
            variants_windowed: self.variants_windowed + other.variants_windowed,
            variants_evicted: self.variants_evicted + other.variants_evicted,
        }
    }
}

/// Owns the variant stream and the ordered window pulled from it
pub struct VariantWindow<I>
where
    I: Iterator<Item = Result<VariantRecord>>,
{
    source: I,
    /// Next variant read from the stream but not yet windowed; `None` once exhausted
    ahead: Option<VariantRecord>,
    window: VecDeque<VariantRecord>,
    stats: WindowStats,
}

impl<I> VariantWindow<I>
where
    I: Iterator<Item = Result<VariantRecord>>,
{
    /// Wrap a sorted variant stream, priming the look-ahead slot.
    pub fn new(source: I) -> Result<Self> {
        let mut window = Self {
            source,
            ahead: None,
            window: VecDeque::new(),
            stats: WindowStats::default(),
        };
        window.advance()?;
        Ok(window)
    }

    /// Pull the next variant into the look-ahead slot, returning the one it replaces.
    fn advance(&mut self) -> Result<Option<VariantRecord>> {
        let next = self.source.next().transpose()?;
        Ok(std::mem::replace(&mut self.ahead, next))
    }

    fn ahead_precedes(&self, bound: &GenomicPos) -> bool {
        self.ahead
            .as_ref()
            .is_some_and(|v| v.coord().precedes(bound))
    }

    /// Resynchronise against a read spanning `[start, end)`.
    pub fn resync(&mut self, start: GenomicPos, end: GenomicPos) -> Result<()> {
        // Catch-up
        while self.ahead_precedes(&start) {
            if let Some(skipped) = self.advance()? {
                debug!("The variant at {} is before the read at {}, skipped", skipped.coord(), start);
                self.stats.variants_skipped += 1;
            }
        }

        // Fill
        while self.ahead_precedes(&end) {
            if let Some(pushed) = self.advance()? {
                debug!("The variant at {} is before the read end at {}, pushed", pushed.coord(), end);
                self.window.push_back(pushed);
                self.stats.variants_windowed += 1;
            }
        }

        // Evict
        while self
            .window
            .front()
            .is_some_and(|v| v.coord().precedes(&start))
        {
            if let Some(evicted) = self.window.pop_front() {
                debug!("The variant at {} is destroyed", evicted.coord());
                self.stats.variants_evicted += 1;
            }
        }

        Ok(())
    }

    /// Variants currently in the window, in coordinate order.
    pub fn variants(&self) -> &VecDeque<VariantRecord> {
        &self.window
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// True once the variant stream has nothing left to read.
    pub fn is_exhausted(&self) -> bool {
        self.ahead.is_none()
    }

    pub fn stats(&self) -> &WindowStats {
        &self.stats
    }

    /// The underlying variant stream.
    pub fn source(&self) -> &I {
        &self.source
    }
}
