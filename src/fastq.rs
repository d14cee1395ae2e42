//! Strand orientation, mate routing and paired FASTQ output
//!
//! Records are written as `@name\nSEQ\n+\nQUAL\n` with Phred+33 qualities.
//! Reverse-strand reads are reverse-complemented (qualities reversed only)
//! so the FASTQ holds the bases as sequenced.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::Compression;
use gzp::{deflate::Gzip, ZBuilder, ZWriter};

use crate::records::{check_printable, check_qualities, AlignmentRecord};

/// Offset between raw phred values and their FASTQ characters.
pub const PHRED_OFFSET: u8 = 33;

const WRITE_BUFFER_BYTES: usize = 1024 * 1024;

// ============================================================================
// Orientation
// ============================================================================

/// Complement one base, case-preserving; non-ACGT symbols pass through.
#[inline]
pub fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'a' => b't',
        b't' => b'a',
        b'c' => b'g',
        b'g' => b'c',
        other => other,
    }
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&b| complement(b)).collect()
}

/// Orient a rewritten read for output and shift qualities to Phred+33.
///
/// Returns `(sequence, quality_chars)`. Qualities must not exceed
/// [`MAX_PHRED`](crate::records::MAX_PHRED); [`PairedFastqWriter::write_read`]
/// checks this before calling.
pub fn orient_for_output(is_reverse: bool, seq: Vec<u8>, qual: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    let seq = if is_reverse { reverse_complement(&seq) } else { seq };
    let ordered: Box<dyn Iterator<Item = u8>> = if is_reverse {
        Box::new(qual.into_iter().rev())
    } else {
        Box::new(qual.into_iter())
    };
    let qual_chars = ordered.map(|q| q.saturating_add(PHRED_OFFSET)).collect();
    (seq, qual_chars)
}

// ============================================================================
// Mate Routing
// ============================================================================

/// Output channel for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mate {
    R1,
    R2,
}

impl Mate {
    /// First-of-pair wins, then second-of-pair; anything else goes to R1.
    pub fn route(read: &AlignmentRecord) -> Self {
        if read.is_first_of_pair {
            Mate::R1
        } else if read.is_second_of_pair {
            Mate::R2
        } else {
            Mate::R1
        }
    }
}

// ============================================================================
// Writers
// ============================================================================

/// One FASTQ output file, gzip-compressed or plain
pub enum FastqSink {
    Gzip(Box<dyn ZWriter>),
    Plain(BufWriter<File>),
}

impl FastqSink {
    /// Create `path`. `compression_threads` above 1 compresses in parallel (pigz-like).
    pub fn create<P: AsRef<Path>>(path: P, compress: bool, compression_threads: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create FASTQ {}", path.display()))?;

        if compress {
            let writer = ZBuilder::<Gzip, _>::new()
                .num_threads(compression_threads)
                .compression_level(Compression::fast())
                .from_writer(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file));
            Ok(FastqSink::Gzip(writer))
        } else {
            Ok(FastqSink::Plain(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file)))
        }
    }

    /// Flush and, for gzip, write the trailer.
    pub fn finish(self) -> Result<()> {
        match self {
            FastqSink::Gzip(mut writer) => writer.finish().context("Failed to finish gzip FASTQ"),
            FastqSink::Plain(mut writer) => writer.flush().context("Failed to flush FASTQ"),
        }
    }
}

impl Write for FastqSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            FastqSink::Gzip(w) => w.write(buf),
            FastqSink::Plain(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            FastqSink::Gzip(w) => w.flush(),
            FastqSink::Plain(w) => w.flush(),
        }
    }
}

/// Write one FASTQ entry; `qual_chars` must already carry the +33 offset.
pub fn write_fastq_record<W: Write>(writer: &mut W, name: &[u8], seq: &[u8], qual_chars: &[u8]) -> Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(name)?;
    writer.write_all(b"\n")?;
    writer.write_all(seq)?;
    writer.write_all(b"\n+\n")?;
    writer.write_all(qual_chars)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Mate-1 / mate-2 FASTQ pair
pub struct PairedFastqWriter<W: Write> {
    r1: W,
    r2: W,
    r1_written: usize,
    r2_written: usize,
}

impl<W: Write> PairedFastqWriter<W> {
    pub fn new(r1: W, r2: W) -> Self {
        Self {
            r1,
            r2,
            r1_written: 0,
            r2_written: 0,
        }
    }

    /// Orient, validate and route one read. `seq`/`qual` are in alignment
    /// orientation with raw phred qualities.
    pub fn write_read(&mut self, read: &AlignmentRecord, seq: Vec<u8>, qual: Vec<u8>) -> Result<Mate> {
        check_printable(&read.name, &seq)?;
        check_qualities(&read.name, &qual)?;
        let (seq, qual_chars) = orient_for_output(read.is_reverse, seq, qual);

        let mate = Mate::route(read);
        match mate {
            Mate::R1 => {
                write_fastq_record(&mut self.r1, &read.name, &seq, &qual_chars)
                    .context("Failed to write R1 FASTQ entry")?;
                self.r1_written += 1;
            }
            Mate::R2 => {
                write_fastq_record(&mut self.r2, &read.name, &seq, &qual_chars)
                    .context("Failed to write R2 FASTQ entry")?;
                self.r2_written += 1;
            }
        }
        Ok(mate)
    }

    /// (R1, R2) records written so far
    pub fn counts(&self) -> (usize, usize) {
        (self.r1_written, self.r2_written)
    }

    pub fn into_inner(self) -> (W, W) {
        (self.r1, self.r2)
    }
}

impl PairedFastqWriter<FastqSink> {
    pub fn create<P: AsRef<Path>>(
        r1_path: P,
        r2_path: P,
        compress: bool,
        compression_threads: usize,
    ) -> Result<Self> {
        let r1 = FastqSink::create(r1_path, compress, compression_threads)?;
        let r2 = FastqSink::create(r2_path, compress, compression_threads)?;
        Ok(Self::new(r1, r2))
    }

    pub fn finish(self) -> Result<()> {
        let (r1, r2) = self.into_inner();
        r1.finish().context("Failed to finish R1")?;
        r2.finish().context("Failed to finish R2")?;
        Ok(())
    }
}
