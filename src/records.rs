//! Decoded alignment and variant records consumed by the spiking core
//!
//! `AlignmentRecord` is an owned snapshot of one `bam::Record`: the core never
//! touches htslib's packed representation. `VariantRecord` is one biallelic
//! VCF line keyed to the BAM header's target ids.

use anyhow::{bail, Result};
use rust_htslib::bam;
use rust_htslib::bam::record::{Cigar, CigarString};

use crate::coords::GenomicPos;

// Matches htslib's `seq_nt16_str` table for BAM 4-bit base encoding.
const DECODE_BASE: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

/// BAM stores 0xFF in every quality slot when qualities are absent.
const MISSING_QUALITY: u8 = 0xff;

/// Phred quality substituted for records without stored qualities.
pub const FILL_QUALITY: u8 = 30;

/// Highest raw phred value that still maps to a printable character (`~`) at +33.
pub const MAX_PHRED: u8 = 93;

const IUPAC_NUCLEOTIDES: &[u8] = b"ACGTUNRYSWKMBDHV";

// ============================================================================
// Alignment Records
// ============================================================================

/// One decoded alignment record
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRecord {
    /// Read name (may embed a UMI after a separator)
    pub name: Vec<u8>,
    /// Reference sequence id (-1 when unmapped)
    pub tid: i32,
    /// 0-based leftmost mapped position
    pub pos: i64,
    pub cigar: CigarString,
    /// ASCII nucleotide symbols
    pub seq: Vec<u8>,
    /// Raw phred qualities (no +33 offset)
    pub qual: Vec<u8>,
    pub is_reverse: bool,
    pub is_first_of_pair: bool,
    pub is_second_of_pair: bool,
    pub is_secondary_or_supplementary: bool,
}

impl AlignmentRecord {
    /// Build a forward-strand, unpaired record. Mostly useful in tests and benches.
    pub fn new(name: &[u8], tid: i32, pos: i64, cigar: CigarString, seq: &[u8], qual: &[u8]) -> Self {
        Self {
            name: name.to_vec(),
            tid,
            pos,
            cigar,
            seq: seq.to_vec(),
            qual: qual.to_vec(),
            is_reverse: false,
            is_first_of_pair: false,
            is_second_of_pair: false,
            is_secondary_or_supplementary: false,
        }
    }

    /// Decode an htslib record.
    pub fn from_bam(read: &bam::Record) -> Self {
        let mut seq = Vec::new();
        let mut qual = Vec::new();
        decode_seq_into(read, &mut seq);
        copy_qual_into(read, &mut qual);

        Self {
            name: read.qname().to_vec(),
            tid: read.tid(),
            pos: read.pos(),
            cigar: read.cigar().take(),
            seq,
            qual,
            is_reverse: read.is_reverse(),
            is_first_of_pair: read.is_first_in_template(),
            is_second_of_pair: read.is_last_in_template(),
            is_secondary_or_supplementary: read.is_secondary() || read.is_supplementary(),
        }
    }

    /// Leftmost mapped position.
    pub fn start(&self) -> GenomicPos {
        GenomicPos::new(self.tid, self.pos)
    }

    /// Exclusive end: start plus every reference-consuming CIGAR length.
    pub fn end(&self) -> GenomicPos {
        let ref_len: i64 = self
            .cigar
            .iter()
            .map(|op| match op {
                Cigar::Match(len)
                | Cigar::Del(len)
                | Cigar::RefSkip(len)
                | Cigar::Equal(len)
                | Cigar::Diff(len) => i64::from(*len),
                Cigar::Ins(_) | Cigar::SoftClip(_) | Cigar::HardClip(_) | Cigar::Pad(_) => 0,
            })
            .sum();
        GenomicPos::new(self.tid, self.pos + ref_len)
    }

    /// Unmapped records carry no alignment to walk.
    pub fn is_unmapped(&self) -> bool {
        self.tid < 0 || self.pos < 0 || self.cigar.is_empty()
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Decode a BAM record's 4-bit encoded sequence into `out`, reusing its allocation.
pub fn decode_seq_into(read: &bam::Record, out: &mut Vec<u8>) {
    let seq = read.seq();
    let len = seq.len();

    out.clear();
    out.reserve(len);
    // Two bases per packed byte, high nibble first.
    for packed in seq.encoded.iter().copied() {
        for nibble in [packed >> 4, packed & 0x0f] {
            if out.len() == len {
                return;
            }
            out.push(DECODE_BASE[nibble as usize]);
        }
    }
}

/// Copy a BAM record's qualities into `out`, substituting [`FILL_QUALITY`]
/// when the record has none stored.
pub fn copy_qual_into(read: &bam::Record, out: &mut Vec<u8>) {
    let qual = read.qual();
    out.clear();
    if qual.first() == Some(&MISSING_QUALITY) {
        out.resize(qual.len(), FILL_QUALITY);
    } else {
        out.extend_from_slice(qual);
    }
}

// ============================================================================
// Variant Records
// ============================================================================

/// Shape of a variant, from its (REF, ALT) lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantClass {
    /// 1 ref base, 1 alt base
    Snv,
    /// Equal ref/alt lengths greater than one
    Mnv,
    /// 1 ref base, longer alt
    Insertion,
    /// Longer ref, 1 alt base
    Deletion,
    /// Anything else (complex substitutions, empty alleles)
    Unsupported,
}

impl VariantClass {
    pub fn classify(ref_allele: &[u8], alt_allele: &[u8]) -> Self {
        match (ref_allele.len(), alt_allele.len()) {
            (1, 1) => VariantClass::Snv,
            (r, a) if r == a && r > 1 => VariantClass::Mnv,
            (1, a) if a > 1 => VariantClass::Insertion,
            (r, 1) if r > 1 => VariantClass::Deletion,
            _ => VariantClass::Unsupported,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VariantClass::Snv => "snv",
            VariantClass::Mnv => "mnv",
            VariantClass::Insertion => "ins",
            VariantClass::Deletion => "del",
            VariantClass::Unsupported => "unsupported",
        }
    }
}

/// One biallelic variant to spike
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRecord {
    /// BAM target id of the variant's contig
    pub tid: i32,
    /// 0-based position of the first REF base
    pub pos: i64,
    pub ref_allele: Vec<u8>,
    pub alt_allele: Vec<u8>,
    /// Per-record target fraction; `None` falls back to the configured default
    pub allele_fraction: Option<f64>,
}

impl VariantRecord {
    pub fn new(tid: i32, pos: i64, ref_allele: &[u8], alt_allele: &[u8], allele_fraction: Option<f64>) -> Self {
        Self {
            tid,
            pos,
            ref_allele: ref_allele.to_vec(),
            alt_allele: alt_allele.to_vec(),
            allele_fraction,
        }
    }

    pub fn coord(&self) -> GenomicPos {
        GenomicPos::new(self.tid, self.pos)
    }

    pub fn class(&self) -> VariantClass {
        VariantClass::classify(&self.ref_allele, &self.alt_allele)
    }

    pub fn fraction_or(&self, default_allele_fraction: f64) -> f64 {
        self.allele_fraction.unwrap_or(default_allele_fraction)
    }
}

/// True if every byte is an IUPAC nucleotide code (either case).
///
/// Symbolic (`<DEL>`), breakend (`N[chr2:5[`) and spanning-deletion (`*`)
/// alleles fail this check.
pub fn is_nucleotide_allele(allele: &[u8]) -> bool {
    !allele.is_empty()
        && allele
            .iter()
            .all(|b| IUPAC_NUCLEOTIDES.contains(&b.to_ascii_uppercase()))
}

/// Fail if any base is outside printable ASCII (`!`..=`~`).
///
/// Allele alphabets are enforced when variants are read; this guards the
/// emitted record as a whole.
pub fn check_printable(name: &[u8], seq: &[u8]) -> Result<()> {
    if let Some(idx) = seq.iter().position(|&b| b <= b' ' || b > b'~') {
        bail!(
            "The read with qname {} is invalid: non-printable base 0x{:02x} at offset {} (qlen = {})",
            String::from_utf8_lossy(name),
            seq[idx],
            idx,
            seq.len()
        );
    }
    Ok(())
}

/// Fail if a raw phred value cannot be written as a Phred+33 character.
pub fn check_qualities(name: &[u8], qual: &[u8]) -> Result<()> {
    if let Some(idx) = qual.iter().position(|&q| q > MAX_PHRED) {
        bail!(
            "The read with qname {} is invalid: quality {} at offset {} exceeds {}",
            String::from_utf8_lossy(name),
            qual[idx],
            idx,
            MAX_PHRED
        );
    }
    Ok(())
}
