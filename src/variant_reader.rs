//! Streaming VCF reader using noodles
//!
//! Yields one [`VariantRecord`] per VCF line, with the contig translated to
//! the alignment file's target id so that reads and variants share a single
//! coordinate order. Plain and BGZF-compressed (`.gz`/`.bgz`) VCF are
//! supported.
//!
//! The target allele fraction comes from the FORMAT `FA` field: the last
//! value of the last sample carrying one. Records without it use the
//! configured default downstream.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use noodles_bgzf as bgzf;
use noodles_vcf as vcf;
use rust_htslib::bam;
use rustc_hash::FxHashMap;

use crate::records::{is_nucleotide_allele, VariantRecord};

/// FORMAT key holding the per-record target allele fraction
pub const ALLELE_FRACTION_KEY: &str = "FA";

const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// Map each contig name in a BAM header to its target id.
pub fn build_tid_lookup(header: &bam::HeaderView) -> FxHashMap<String, i32> {
    (0..header.target_count())
        .map(|tid| {
            let name = String::from_utf8_lossy(header.tid2name(tid)).into_owned();
            (name, tid as i32)
        })
        .collect()
}

/// Counters for VCF lines that never became variants
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VcfReadStats {
    pub records_read: usize,
    /// Contig missing from the alignment header
    pub unknown_contig: usize,
    /// No ALT allele (`.`)
    pub no_alt: usize,
    /// More than one ALT allele; only the first was kept
    pub multiallelic: usize,
    /// ALT is not a nucleotide sequence (`<DEL>`, breakends, `*`)
    pub symbolic_alt: usize,
}

impl VcfReadStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            records_read: self.records_read + other.records_read,
            unknown_contig: self.unknown_contig + other.unknown_contig,
            no_alt: self.no_alt + other.no_alt,
            multiallelic: self.multiallelic + other.multiallelic,
            symbolic_alt: self.symbolic_alt + other.symbolic_alt,
        }
    }
}

/// Pull-based VCF variant source
pub struct VcfVariantReader {
    reader: vcf::io::Reader<Box<dyn BufRead>>,
    header: vcf::Header,
    tid_lookup: FxHashMap<String, i32>,
    record: vcf::Record,
    stats: VcfReadStats,
}

impl VcfVariantReader {
    /// Open `vcf_path`, choosing BGZF decoding from the extension.
    pub fn from_path<P: AsRef<Path>>(vcf_path: P, tid_lookup: FxHashMap<String, i32>) -> Result<Self> {
        let vcf_path = vcf_path.as_ref();
        let path_str = vcf_path.to_string_lossy().to_lowercase();
        let is_gzipped = path_str.ends_with(".gz") || path_str.ends_with(".bgz");

        let file = File::open(vcf_path)
            .with_context(|| format!("Failed to open VCF file {}", vcf_path.display()))?;
        let inner: Box<dyn BufRead> = if is_gzipped {
            Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, bgzf::Reader::new(file)))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file))
        };

        Self::from_reader(inner, tid_lookup)
    }

    /// Wrap any buffered VCF text stream.
    pub fn from_reader(inner: Box<dyn BufRead>, tid_lookup: FxHashMap<String, i32>) -> Result<Self> {
        let mut reader = vcf::io::Reader::new(inner);
        let header = reader.read_header().context("Failed to read VCF header")?;

        Ok(Self {
            reader,
            header,
            tid_lookup,
            record: vcf::Record::default(),
            stats: VcfReadStats::default(),
        })
    }

    pub fn stats(&self) -> &VcfReadStats {
        &self.stats
    }

    /// Read the next usable variant, skipping lines that cannot be placed.
    fn read_variant(&mut self) -> Result<Option<VariantRecord>> {
        loop {
            let n = self
                .reader
                .read_record(&mut self.record)
                .context("Failed to read VCF record")?;
            if n == 0 {
                return Ok(None);
            }
            self.stats.records_read += 1;

            if let Some(variant) = self.convert_record()? {
                return Ok(Some(variant));
            }
        }
    }

    fn convert_record(&mut self) -> Result<Option<VariantRecord>> {
        use vcf::variant::record::AlternateBases;

        let record = &self.record;
        let chrom = record.reference_sequence_name();

        let tid = match self.tid_lookup.get(chrom) {
            Some(&tid) => tid,
            None => {
                warn!("Variant contig {} is not in the alignment header, skipped", chrom);
                self.stats.unknown_contig += 1;
                return Ok(None);
            }
        };

        let pos = match record.variant_start() {
            Some(p) => p.context("Invalid VCF position")?.get() as i64 - 1,
            None => return Ok(None),
        };

        let ref_allele = record.reference_bases().as_bytes().to_vec();
        let alt_alleles: Vec<String> = record
            .alternate_bases()
            .iter()
            .map(|a| a.map(|s| s.to_string()))
            .collect::<std::io::Result<_>>()
            .context("Invalid VCF ALT field")?;

        let alt_allele = match alt_alleles.first() {
            Some(alt) => alt.as_bytes().to_vec(),
            None => {
                debug!("Variant at {}:{} has no ALT allele, skipped", chrom, pos + 1);
                self.stats.no_alt += 1;
                return Ok(None);
            }
        };
        if !is_nucleotide_allele(&alt_allele) {
            warn!(
                "Variant at {}:{} has non-nucleotide ALT {}, skipped",
                chrom,
                pos + 1,
                alt_alleles[0]
            );
            self.stats.symbolic_alt += 1;
            return Ok(None);
        }
        if alt_alleles.len() > 1 {
            warn!(
                "Variant at {}:{} is multi-allelic; only the first ALT {} is simulated",
                chrom,
                pos + 1,
                alt_alleles[0]
            );
            self.stats.multiallelic += 1;
        }

        let allele_fraction = allele_fraction(record, &self.header)?;

        Ok(Some(VariantRecord {
            tid,
            pos,
            ref_allele,
            alt_allele,
            allele_fraction,
        }))
    }
}

impl Iterator for VcfVariantReader {
    type Item = Result<VariantRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_variant().transpose()
    }
}

/// FORMAT `FA` of a record: last value of the last sample that has one.
fn allele_fraction(record: &vcf::Record, header: &vcf::Header) -> Result<Option<f64>> {
    use vcf::variant::record::samples::series::value::Array;
    use vcf::variant::record::samples::series::Value;
    use vcf::variant::record::samples::Sample as SampleTrait;

    let mut fraction = None;
    for sample in record.samples().iter() {
        let value = match sample.get(header, ALLELE_FRACTION_KEY) {
            Some(Ok(Some(v))) => v,
            Some(Err(e)) => return Err(e).context("Invalid FORMAT FA value"),
            _ => continue,
        };

        match value {
            Value::Float(f) => fraction = Some(f64::from(f)),
            Value::Integer(n) => fraction = Some(f64::from(n)),
            Value::String(s) => {
                if let Some(last) = s.split(',').filter_map(|v| v.trim().parse::<f64>().ok()).last() {
                    fraction = Some(last);
                }
            }
            Value::Array(Array::Float(values)) => {
                for v in values.iter() {
                    if let Some(f) = v.context("Invalid FORMAT FA value")? {
                        fraction = Some(f64::from(f));
                    }
                }
            }
            Value::Array(Array::Integer(values)) => {
                for v in values.iter() {
                    if let Some(n) = v.context("Invalid FORMAT FA value")? {
                        fraction = Some(f64::from(n));
                    }
                }
            }
            _ => {}
        }
    }

    Ok(fraction)
}
