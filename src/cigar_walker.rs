//! CIGAR walk and per-base mutation engine
//!
//! Walks one alignment left to right, keeping a query cursor (index into the
//! stored sequence/qualities) and a reference cursor. Only M/=/X bases are
//! eligible for mutation; everything else either copies or skips bases.
//!
//! ## CIGAR Operations
//! - M/=/X: consume both ref and query, one base at a time, mutation eligible
//! - I: consume query only, bases copied verbatim
//! - S: consume query only, bases dropped
//! - D: consume ref only
//! - H: consume neither
//! - N/P: unsupported, the walk fails
//!
//! ## Variant Selection
//!
//! At each eligible reference position the co-located group (all windowed
//! variants at exactly that tid/position) shares one probability budget.
//! Members are scanned in window order accumulating their allele fractions;
//! the first member whose running sum reaches the read's draw is applied.
//! The sum is not normalised, so a group whose fractions add past 1.0 always
//! applies some member.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use log::{error, info, warn};
use rust_htslib::bam::record::Cigar;

use crate::coords::GenomicPos;
use crate::records::{AlignmentRecord, VariantClass, VariantRecord};

/// Phred quality given to every inserted base after the anchor.
pub const INSERTED_BASE_QUALITY: u8 = 30;

// ============================================================================
// Statistics
// ============================================================================

/// Per-base mutation tallies
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MutationStats {
    /// Positions where a selected variant was applied
    pub kept_variants: usize,
    /// Positions with variants where none was applied
    pub skipped_variants: usize,
    /// Eligible positions with no windowed variant
    pub no_variant_positions: usize,
    pub kept_snv: usize,
    pub kept_mnv: usize,
    pub kept_insertion: usize,
    pub kept_deletion: usize,
    /// Selected variants with an allele shape the engine cannot simulate
    pub unsupported_variants: usize,
    /// Selected deletions that did not fit in the remaining M/=/X span
    pub truncated_deletions: usize,
}

impl MutationStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            kept_variants: self.kept_variants + other.kept_variants,
            skipped_variants: self.skipped_variants + other.skipped_variants,
            no_variant_positions: self.no_variant_positions + other.no_variant_positions,
            kept_snv: self.kept_snv + other.kept_snv,
            kept_mnv: self.kept_mnv + other.kept_mnv,
            kept_insertion: self.kept_insertion + other.kept_insertion,
            kept_deletion: self.kept_deletion + other.kept_deletion,
            unsupported_variants: self.unsupported_variants + other.unsupported_variants,
            truncated_deletions: self.truncated_deletions + other.truncated_deletions,
        }
    }

    /// Count one applied variant, returning the running total for its class.
    fn record_kept(&mut self, class: VariantClass) -> usize {
        let counter = match class {
            VariantClass::Snv => &mut self.kept_snv,
            VariantClass::Mnv => &mut self.kept_mnv,
            VariantClass::Insertion => &mut self.kept_insertion,
            VariantClass::Deletion => &mut self.kept_deletion,
            VariantClass::Unsupported => return 0,
        };
        *counter += 1;
        self.kept_variants += 1;
        *counter
    }
}

/// Rewritten read in alignment orientation (qualities are raw phred)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpikedRead {
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

// ============================================================================
// Variant Selection
// ============================================================================

/// Pick the member of a co-located group that the draw lands in.
///
/// Returns `None` when the draw exceeds the group's cumulative fraction.
pub fn select_variant<'a, G>(group: G, draw: f64, default_allele_fraction: f64) -> Option<&'a VariantRecord>
where
    G: IntoIterator<Item = &'a VariantRecord>,
{
    let mut cumulative_fraction = 0.0;
    for variant in group {
        cumulative_fraction += variant.fraction_or(default_allele_fraction);
        if draw <= cumulative_fraction {
            return Some(variant);
        }
    }
    None
}

// ============================================================================
// CIGAR Walk
// ============================================================================

fn base_at(read: &AlignmentRecord, query_pos: usize) -> Result<(u8, u8)> {
    match (read.seq.get(query_pos), read.qual.get(query_pos)) {
        (Some(&base), Some(&qual)) => Ok((base, qual)),
        _ => bail!(
            "The read {} has CIGAR query length beyond its {} stored bases",
            read.name_lossy(),
            read.seq.len().min(read.qual.len())
        ),
    }
}

fn push_original(read: &AlignmentRecord, query_pos: usize, out: &mut SpikedRead) -> Result<()> {
    let (base, qual) = base_at(read, query_pos)?;
    out.seq.push(base);
    out.qual.push(qual);
    Ok(())
}

fn log_milestone(count: usize, read: &AlignmentRecord, variant: &VariantRecord) {
    if count.is_power_of_two() {
        info!(
            "The read with name {} is spiked with the {}-variant at {} ({} so far)",
            read.name_lossy(),
            variant.class().label(),
            variant.coord(),
            count
        );
    }
}

/// Apply `variant` at the current base, returning how many extra
/// reference/query bases past the current one it consumed.
fn apply_variant(
    read: &AlignmentRecord,
    variant: &VariantRecord,
    query_pos: usize,
    remaining_in_span: usize,
    out: &mut SpikedRead,
    stats: &mut MutationStats,
) -> Result<usize> {
    let alt = &variant.alt_allele;

    match variant.class() {
        VariantClass::Snv => {
            let (_, qual) = base_at(read, query_pos)?;
            out.seq.push(alt[0]);
            out.qual.push(qual);
            let n = stats.record_kept(VariantClass::Snv);
            log_milestone(n, read, variant);
            Ok(0)
        }
        VariantClass::Mnv => {
            warn!(
                "The MNV at {} is decomposed into SNV and only the first SNV is simulated",
                variant.coord()
            );
            let (_, qual) = base_at(read, query_pos)?;
            out.seq.push(alt[0]);
            out.qual.push(qual);
            let n = stats.record_kept(VariantClass::Mnv);
            log_milestone(n, read, variant);
            Ok(0)
        }
        VariantClass::Insertion => {
            let (_, qual) = base_at(read, query_pos)?;
            out.seq.extend_from_slice(alt);
            out.qual.push(qual);
            out.qual
                .extend(std::iter::repeat(INSERTED_BASE_QUALITY).take(alt.len() - 1));
            let n = stats.record_kept(VariantClass::Insertion);
            log_milestone(n, read, variant);
            Ok(0)
        }
        VariantClass::Deletion => {
            let ref_len = variant.ref_allele.len();
            if ref_len <= remaining_in_span {
                let n = stats.record_kept(VariantClass::Deletion);
                log_milestone(n, read, variant);
                Ok(ref_len - 1)
            } else {
                // Does not fit in this M/=/X span; leave the base untouched
                push_original(read, query_pos, out)?;
                stats.skipped_variants += 1;
                stats.truncated_deletions += 1;
                Ok(0)
            }
        }
        VariantClass::Unsupported => {
            error!(
                "The variant at {} ({} -> {}) failed to be processed!",
                variant.coord(),
                String::from_utf8_lossy(&variant.ref_allele),
                String::from_utf8_lossy(alt)
            );
            push_original(read, query_pos, out)?;
            stats.skipped_variants += 1;
            stats.unsupported_variants += 1;
            Ok(0)
        }
    }
}

/// Rewrite one read against the current variant window.
///
/// `draw` is the read's UMI draw in `[0, 1)`. Fails on CIGAR operations that
/// would desynchronise the reference/query cursors (N, P) and on records
/// whose stored sequence is shorter than their CIGAR.
pub fn spike_read(
    read: &AlignmentRecord,
    window: &VecDeque<VariantRecord>,
    draw: f64,
    default_allele_fraction: f64,
    stats: &mut MutationStats,
) -> Result<SpikedRead> {
    let mut out = SpikedRead {
        seq: Vec::with_capacity(read.seq.len() + 8),
        qual: Vec::with_capacity(read.qual.len() + 8),
    };
    let mut query_pos: usize = 0;
    let mut ref_pos: i64 = read.pos;
    // Window entries before `cursor` lie behind `ref_pos`
    let mut cursor: usize = 0;

    for op in read.cigar.iter() {
        match op {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                let span = *len as usize;
                let mut j = 0;
                while j < span {
                    let here = GenomicPos::new(read.tid, ref_pos);
                    while cursor < window.len() && window[cursor].coord().precedes(&here) {
                        cursor += 1;
                    }

                    let mut extra = 0;
                    if window.get(cursor).is_some_and(|v| v.coord() == here) {
                        let group = window.range(cursor..).take_while(|v| v.coord() == here);
                        match select_variant(group, draw, default_allele_fraction) {
                            Some(variant) => {
                                extra = apply_variant(read, variant, query_pos, span - j, &mut out, stats)?;
                            }
                            None => {
                                push_original(read, query_pos, &mut out)?;
                                stats.skipped_variants += 1;
                            }
                        }
                    } else {
                        push_original(read, query_pos, &mut out)?;
                        stats.no_variant_positions += 1;
                    }

                    j += 1 + extra;
                    query_pos += 1 + extra;
                    ref_pos += 1 + extra as i64;
                }
            }
            Cigar::Ins(len) => {
                for _ in 0..*len {
                    push_original(read, query_pos, &mut out)?;
                    query_pos += 1;
                }
            }
            Cigar::SoftClip(len) => {
                query_pos += *len as usize;
            }
            Cigar::Del(len) => {
                ref_pos += i64::from(*len);
            }
            Cigar::HardClip(_) => {}
            Cigar::RefSkip(_) | Cigar::Pad(_) => {
                bail!(
                    "The cigar code {} is invalid at {} for read {}",
                    op.char(),
                    read.start(),
                    read.name_lossy()
                );
            }
        }
    }

    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::CigarString;

    const READ_SEQ: &[u8] = b"ACGTACGTAC";

    fn read_with_cigar(cigar: &str, seq: &[u8]) -> AlignmentRecord {
        let cigar = CigarString::try_from(cigar).unwrap();
        let qual: Vec<u8> = (0..seq.len() as u8).map(|i| 20 + i).collect();
        AlignmentRecord::new(b"read#UMI", 0, 100, cigar, seq, &qual)
    }

    fn window(variants: Vec<VariantRecord>) -> VecDeque<VariantRecord> {
        variants.into_iter().collect()
    }

    fn var(pos: i64, ref_allele: &[u8], alt: &[u8], fraction: f64) -> VariantRecord {
        VariantRecord::new(0, pos, ref_allele, alt, Some(fraction))
    }

    #[test]
    fn test_snv_replaces_single_base() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(103, b"T", b"G", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.5, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGGACGTAC");
        assert_eq!(out.qual, read.qual);
        assert_eq!(stats.kept_snv, 1);
        assert_eq!(stats.kept_variants, 1);
        assert_eq!(stats.no_variant_positions, 9);
    }

    #[test]
    fn test_snv_threshold_is_inclusive() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(103, b"T", b"G", 0.25)]);

        let mut stats = MutationStats::default();
        let applied = spike_read(&read, &w, 0.25, 0.1, &mut stats).unwrap();
        assert_eq!(applied.seq[3], b'G');

        let mut stats = MutationStats::default();
        let skipped = spike_read(&read, &w, 0.250001, 0.1, &mut stats).unwrap();
        assert_eq!(skipped.seq, READ_SEQ);
        assert_eq!(stats.skipped_variants, 1);
        assert_eq!(stats.kept_variants, 0);
    }

    #[test]
    fn test_default_fraction_used_when_absent() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![VariantRecord::new(0, 101, b"C", b"A", None)]);

        let mut stats = MutationStats::default();
        let out = spike_read(&read, &w, 0.3, 0.4, &mut stats).unwrap();
        assert_eq!(out.seq[1], b'A');

        let mut stats = MutationStats::default();
        let out = spike_read(&read, &w, 0.5, 0.4, &mut stats).unwrap();
        assert_eq!(out.seq[1], b'C');
    }

    #[test]
    fn test_colocated_group_cumulative_budget() {
        let group = vec![var(104, b"A", b"C", 0.3), var(104, b"A", b"G", 0.3)];

        assert_eq!(select_variant(&group, 0.2, 0.1).map(|v| v.alt_allele[0]), Some(b'C'));
        // 0.3 < 0.5 <= 0.6: the second member applies
        assert_eq!(select_variant(&group, 0.5, 0.1).map(|v| v.alt_allele[0]), Some(b'G'));
        assert_eq!(select_variant(&group, 0.6, 0.1).map(|v| v.alt_allele[0]), Some(b'G'));
        assert!(select_variant(&group, 0.61, 0.1).is_none());
    }

    #[test]
    fn test_colocated_group_over_budget_always_applies() {
        let group = vec![var(104, b"A", b"C", 0.7), var(104, b"A", b"G", 0.7)];
        assert_eq!(select_variant(&group, 0.99, 0.1).map(|v| v.alt_allele[0]), Some(b'G'));
    }

    #[test]
    fn test_colocated_group_in_walk() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(104, b"A", b"C", 0.3), var(104, b"A", b"G", 0.3)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.5, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGTGCGTAC");
        assert_eq!(stats.kept_snv, 1);
        assert_eq!(stats.skipped_variants, 0);
    }

    #[test]
    fn test_mnv_only_first_base_simulated() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(102, b"GTA", b"CCC", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACCTACGTAC");
        assert_eq!(stats.kept_mnv, 1);
    }

    #[test]
    fn test_insertion_emits_alt_with_low_confidence_quals() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(102, b"G", b"GTT", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGTTTACGTAC");
        assert_eq!(out.seq.len(), out.qual.len());
        assert_eq!(&out.qual[..3], &read.qual[..3]);
        assert_eq!(&out.qual[3..5], &[INSERTED_BASE_QUALITY, INSERTED_BASE_QUALITY]);
        assert_eq!(&out.qual[5..], &read.qual[3..]);
        assert_eq!(stats.kept_insertion, 1);
    }

    #[test]
    fn test_deletion_consumes_window_without_emission() {
        let read = read_with_cigar("10M", READ_SEQ);
        // ref GTA at 102..105
        let w = window(vec![var(102, b"GTA", b"G", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACCGTAC");
        assert_eq!(out.qual.len(), 7);
        assert_eq!(&out.qual[2..], &read.qual[5..]);
        assert_eq!(stats.kept_deletion, 1);
        assert_eq!(stats.no_variant_positions, 7);
    }

    #[test]
    fn test_deletion_exactly_filling_span_applies() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(107, b"TAC", b"T", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGTACG");
        assert_eq!(stats.kept_deletion, 1);
    }

    #[test]
    fn test_deletion_past_span_is_passthrough() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(108, b"ACGT", b"A", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, READ_SEQ);
        assert_eq!(out.qual, read.qual);
        assert_eq!(stats.kept_deletion, 0);
        assert_eq!(stats.truncated_deletions, 1);
        assert_eq!(stats.skipped_variants, 1);
    }

    #[test]
    fn test_deletion_bounded_by_current_cigar_span() {
        // 5M1I4M: variant at 103 needs 3 ref bases but only 2 remain in the first M
        let read = read_with_cigar("5M1I4M", b"ACGTAGCGTA");
        let w = window(vec![var(103, b"TAC", b"T", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGTAGCGTA");
        assert_eq!(stats.truncated_deletions, 1);
    }

    #[test]
    fn test_unsupported_shape_is_passthrough() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![var(101, b"CG", b"TTA", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, READ_SEQ);
        assert_eq!(stats.unsupported_variants, 1);
        assert_eq!(stats.skipped_variants, 1);
        assert_eq!(stats.kept_variants, 0);
    }

    #[test]
    fn test_variant_inside_cigar_deletion_is_never_reached() {
        // 5M2D5M: ref 100..105 matched, 105..107 deleted, 107..112 matched
        let read = read_with_cigar("5M2D5M", READ_SEQ);
        let w = window(vec![var(105, b"C", b"G", 1.0), var(106, b"G", b"A", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, READ_SEQ);
        assert_eq!(stats.kept_variants, 0);
        assert_eq!(stats.skipped_variants, 0);
        assert_eq!(stats.no_variant_positions, 10);
    }

    #[test]
    fn test_variant_after_cigar_deletion_uses_shifted_query() {
        // Second M block starts at ref 107 with query offset 5
        let read = read_with_cigar("5M2D5M", READ_SEQ);
        let w = window(vec![var(107, b"C", b"T", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGTATGTAC");
    }

    #[test]
    fn test_insertion_bases_copied_and_not_mutated() {
        // 4M2I4M: query 4..6 inserted, ref 104 maps to query 6
        let read = read_with_cigar("4M2I4M", READ_SEQ);
        let w = window(vec![var(104, b"G", b"A", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGTACATAC");
        assert_eq!(stats.kept_snv, 1);
    }

    #[test]
    fn test_soft_clips_dropped_and_offset_query() {
        // 2S8M: ref 100 maps to query 2
        let read = read_with_cigar("2S8M", READ_SEQ);
        let w = window(vec![var(100, b"G", b"C", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"CTACGTAC");
        assert_eq!(out.qual, &read.qual[2..]);
    }

    #[test]
    fn test_hard_clips_consume_nothing() {
        let read = read_with_cigar("3H10M3H", READ_SEQ);
        let w = window(vec![var(109, b"C", b"G", 1.0)]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ACGTACGTAG");
    }

    #[test]
    fn test_ref_skip_is_fatal() {
        let read = read_with_cigar("5M100N5M", READ_SEQ);
        let w = window(vec![var(300, b"A", b"T", 1.0)]);
        let mut stats = MutationStats::default();

        let err = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap_err();
        assert!(err.to_string().contains("cigar code N"));
        assert!(err.to_string().contains("read#UMI"));
    }

    #[test]
    fn test_short_sequence_is_fatal() {
        let read = read_with_cigar("10M", b"ACGT");
        let w = window(vec![var(109, b"A", b"T", 1.0)]);
        let mut stats = MutationStats::default();

        assert!(spike_read(&read, &w, 0.0, 0.1, &mut stats).is_err());
    }

    #[test]
    fn test_variant_on_other_contig_ignored() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![VariantRecord::new(1, 103, b"T", b"G", Some(1.0))]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.0, 0.1, &mut stats).unwrap();
        assert_eq!(out.seq, READ_SEQ);
        assert_eq!(stats.no_variant_positions, 10);
    }

    #[test]
    fn test_multiple_variants_in_one_read() {
        let read = read_with_cigar("10M", READ_SEQ);
        let w = window(vec![
            var(99, b"A", b"T", 1.0),
            var(101, b"C", b"T", 1.0),
            var(105, b"C", b"CAA", 1.0),
            var(108, b"A", b"G", 0.0),
        ]);
        let mut stats = MutationStats::default();

        let out = spike_read(&read, &w, 0.01, 0.1, &mut stats).unwrap();

        assert_eq!(out.seq, b"ATGTACAAGTAC");
        assert_eq!(stats.kept_snv, 1);
        assert_eq!(stats.kept_insertion, 1);
        assert_eq!(stats.skipped_variants, 1);
        assert_eq!(stats.kept_variants, 2);
    }

    #[test]
    fn test_stats_merge() {
        let a = MutationStats { kept_snv: 2, kept_variants: 2, ..Default::default() };
        let b = MutationStats { kept_deletion: 1, kept_variants: 1, ..Default::default() };
        let merged = a.merge(b);
        assert_eq!(merged.kept_variants, 3);
        assert_eq!(merged.kept_snv, 2);
        assert_eq!(merged.kept_deletion, 1);
    }
}
