//! Single-pass spiking pipeline: sorted BAM + sorted VCF -> paired FASTQ
//!
//! For every alignment record, in order:
//! 1. secondary/supplementary records are dropped
//! 2. the variant window is resynchronised against the read span
//! 3. if the window holds variants, the CIGAR walk rewrites the read using
//!    the read's UMI draw; otherwise the read passes through untouched
//! 4. the result is oriented and routed to the R1 or R2 FASTQ
//!
//! Processing is strictly sequential and deterministic for a given pair of
//! inputs. htslib decompression threads and gzip compression threads only
//! touch I/O.

use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::info;
use rust_htslib::{bam, bam::Read as BamRead};

use crate::cigar_walker::{spike_read, MutationStats, SpikedRead};
use crate::fastq::{Mate, PairedFastqWriter};
use crate::records::{AlignmentRecord, VariantRecord};
use crate::umi_hash::{umi_draw, DEFAULT_UMI_SEPARATOR};
use crate::variant_reader::{build_tid_lookup, VcfReadStats, VcfVariantReader};
use crate::variant_window::{VariantWindow, WindowStats};

/// Default target allele fraction for variants without an `FA` value
pub const DEFAULT_ALLELE_FRACTION: f64 = 0.1;

const PROGRESS_INTERVAL: usize = 10_000_000;

// ============================================================================
// Configuration and Statistics
// ============================================================================

/// Configuration for a spiking run
#[derive(Debug, Clone)]
pub struct SpikeConfig {
    /// Allele fraction used when a variant carries none
    pub default_allele_fraction: f64,
    /// Byte separating the read-name prefix from the UMI
    pub umi_separator: u8,
    /// htslib BAM decompression threads
    pub read_threads: usize,
    /// Gzip threads per FASTQ file (0 or 1 = single-threaded)
    pub compression_threads: usize,
    /// Gzip the FASTQ outputs
    pub compress_output: bool,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            default_allele_fraction: DEFAULT_ALLELE_FRACTION,
            umi_separator: DEFAULT_UMI_SEPARATOR,
            read_threads: 1,
            compression_threads: 1,
            compress_output: true,
        }
    }
}

impl SpikeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.default_allele_fraction.is_finite() || self.default_allele_fraction < 0.0 {
            bail!(
                "Default allele fraction must be a finite non-negative number, got {}",
                self.default_allele_fraction
            );
        }
        Ok(())
    }
}

/// Statistics returned from a spiking run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SpikeStats {
    /// Alignment records read
    pub total_reads: usize,
    /// Secondary/supplementary records dropped
    pub reads_filtered: usize,
    /// Reads rewritten through the CIGAR walk
    pub reads_walked: usize,
    /// Reads emitted unchanged because no variant was windowed
    pub reads_passthrough: usize,
    pub r1_written: usize,
    pub r2_written: usize,
    pub window: WindowStats,
    pub mutations: MutationStats,
    pub vcf: VcfReadStats,
    /// Time spent streaming the BAM (ms)
    pub bam_stream_ms: u64,
}

impl SpikeStats {
    /// Merge stats from separate runs into a single aggregate
    pub fn merge(self, other: Self) -> Self {
        Self {
            total_reads: self.total_reads + other.total_reads,
            reads_filtered: self.reads_filtered + other.reads_filtered,
            reads_walked: self.reads_walked + other.reads_walked,
            reads_passthrough: self.reads_passthrough + other.reads_passthrough,
            r1_written: self.r1_written + other.r1_written,
            r2_written: self.r2_written + other.r2_written,
            window: self.window.merge(other.window),
            mutations: self.mutations.merge(other.mutations),
            vcf: self.vcf.merge(other.vcf),
            bam_stream_ms: self.bam_stream_ms + other.bam_stream_ms,
        }
    }

    /// End-of-run summary
    pub fn log_summary(&self) {
        let m = &self.mutations;
        info!(
            "In total: kept {} read support, skipped {} read support, and skipped {} no-variant CMATCH cigars.",
            m.kept_variants, m.skipped_variants, m.no_variant_positions
        );
        info!("Kept {} snv read support", m.kept_snv);
        info!("Kept {} mnv read support", m.kept_mnv);
        info!("Kept {} insertion read support", m.kept_insertion);
        info!("Kept {} deletion read support", m.kept_deletion);
        if m.unsupported_variants > 0 || m.truncated_deletions > 0 {
            info!(
                "Passed through {} unsupported variants and {} deletions exceeding their CIGAR span",
                m.unsupported_variants, m.truncated_deletions
            );
        }
        info!(
            "Reads: {} total, {} filtered, {} walked, {} passed through, {} R1, {} R2",
            self.total_reads,
            self.reads_filtered,
            self.reads_walked,
            self.reads_passthrough,
            self.r1_written,
            self.r2_written
        );
        info!(
            "Variants: {} skipped, {} windowed, {} evicted",
            self.window.variants_skipped, self.window.variants_windowed, self.window.variants_evicted
        );
        info!(
            "VCF: {} records, {} unknown contig, {} without ALT, {} non-nucleotide ALT, {} multi-allelic",
            self.vcf.records_read,
            self.vcf.unknown_contig,
            self.vcf.no_alt,
            self.vcf.symbolic_alt,
            self.vcf.multiallelic
        );
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Merge-joins a read stream against a variant stream
pub struct VariantSpiker<I>
where
    I: Iterator<Item = Result<VariantRecord>>,
{
    window: VariantWindow<I>,
    default_allele_fraction: f64,
    umi_separator: u8,
    stats: SpikeStats,
}

impl<I> VariantSpiker<I>
where
    I: Iterator<Item = Result<VariantRecord>>,
{
    pub fn new(variants: I, config: &SpikeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            window: VariantWindow::new(variants)?,
            default_allele_fraction: config.default_allele_fraction,
            umi_separator: config.umi_separator,
            stats: SpikeStats::default(),
        })
    }

    /// Rewrite one read in alignment orientation.
    ///
    /// Unmapped reads and reads with an empty window come back unchanged.
    pub fn rewrite(&mut self, read: &AlignmentRecord) -> Result<SpikedRead> {
        if !read.is_unmapped() {
            self.window.resync(read.start(), read.end())?;
            if !self.window.is_empty() {
                let draw = umi_draw(&read.name, self.umi_separator);
                let spiked = spike_read(
                    read,
                    self.window.variants(),
                    draw,
                    self.default_allele_fraction,
                    &mut self.stats.mutations,
                )?;
                self.stats.reads_walked += 1;
                return Ok(spiked);
            }
        }

        self.stats.reads_passthrough += 1;
        Ok(SpikedRead {
            seq: read.seq.clone(),
            qual: read.qual.clone(),
        })
    }

    /// Rewrite and emit one read. Returns the mate channel it went to, or
    /// `None` for filtered records.
    pub fn process_read<W: Write>(
        &mut self,
        read: &AlignmentRecord,
        out: &mut PairedFastqWriter<W>,
    ) -> Result<Option<Mate>> {
        self.stats.total_reads += 1;
        if read.is_secondary_or_supplementary {
            self.stats.reads_filtered += 1;
            return Ok(None);
        }

        let spiked = self.rewrite(read)?;
        let mate = out.write_read(read, spiked.seq, spiked.qual)?;
        match mate {
            Mate::R1 => self.stats.r1_written += 1,
            Mate::R2 => self.stats.r2_written += 1,
        }
        Ok(Some(mate))
    }

    pub fn window(&self) -> &VariantWindow<I> {
        &self.window
    }

    pub fn stats(&self) -> &SpikeStats {
        &self.stats
    }

    /// Final statistics, including the window's bookkeeping.
    pub fn into_stats(self) -> SpikeStats {
        SpikeStats {
            window: self.window.stats().clone(),
            ..self.stats
        }
    }
}

/// Spike variants from `vcf_path` into reads from `bam_path`, writing R1/R2 FASTQ.
///
/// Both inputs must be coordinate-sorted with the same contig order; this is
/// not checked.
///
/// # Returns
/// SpikeStats with processing statistics
pub fn spike_variants<P: AsRef<Path>>(
    bam_path: P,
    vcf_path: P,
    r1_path: P,
    r2_path: P,
    config: &SpikeConfig,
) -> Result<SpikeStats> {
    config.validate()?;
    let t0 = Instant::now();

    let mut bam = bam::Reader::from_path(bam_path.as_ref())
        .with_context(|| format!("Failed to open BAM {}", bam_path.as_ref().display()))?;
    if config.read_threads > 1 {
        bam.set_threads(config.read_threads)
            .context("Failed to set BAM reader threads")?;
    }

    let tid_lookup = build_tid_lookup(bam.header());
    let variants = VcfVariantReader::from_path(vcf_path.as_ref(), tid_lookup)?;
    let mut spiker = VariantSpiker::new(variants, config)?;

    let mut writer = PairedFastqWriter::create(
        r1_path.as_ref(),
        r2_path.as_ref(),
        config.compress_output,
        config.compression_threads,
    )?;

    info!(
        "Spiking variants from {} into {}",
        vcf_path.as_ref().display(),
        bam_path.as_ref().display()
    );

    let mut record = bam::Record::new();
    loop {
        match bam.read(&mut record) {
            Some(Ok(())) => {
                let read = AlignmentRecord::from_bam(&record);
                spiker.process_read(&read, &mut writer)?;

                let seen = spiker.stats().total_reads;
                if seen % PROGRESS_INTERVAL == 0 {
                    info!(
                        "  {} reads, {} variants applied",
                        seen,
                        spiker.stats().mutations.kept_variants
                    );
                }
            }
            Some(Err(e)) => return Err(e).context("Failed to read BAM record"),
            None => break,
        }
    }

    writer.finish()?;

    let vcf = spiker.window().source().stats().clone();
    let mut stats = spiker.into_stats();
    stats.vcf = vcf;
    stats.bam_stream_ms = t0.elapsed().as_millis() as u64;

    stats.log_summary();
    Ok(stats)
}

// ============================================================================
// Tests
// ============================================================================
