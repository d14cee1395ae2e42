use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use env_logger::Env;
use log::info;
use umi_spike::{spike_variants, SpikeConfig};

/// Spike variants from a sorted VCF into the reads of a sorted BAM.
///
/// Each read is mutated at a variant when the hash of its UMI (the read-name
/// suffix after the separator) falls under the variant's allele fraction, so
/// all reads of a UMI family agree. Output is R1/R2 FASTQ.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Coordinate-sorted input BAM
    #[arg(short = 'b', long = "bam")]
    bam: PathBuf,

    /// Coordinate-sorted VCF with the same contig order (plain or bgzipped)
    #[arg(short = 'v', long = "vcf")]
    vcf: PathBuf,

    /// Output FASTQ for first-of-pair and unpaired reads
    #[arg(short = '1', long = "r1")]
    r1: PathBuf,

    /// Output FASTQ for second-of-pair reads
    #[arg(short = '2', long = "r2")]
    r2: PathBuf,

    /// Allele fraction for variants without a FORMAT FA value
    #[arg(short = 'f', long = "allele-fraction", default_value_t = 0.1)]
    allele_fraction: f64,

    /// Character that precedes the UMI in read names
    #[arg(long = "umi-separator", default_value_t = '#')]
    umi_separator: char,

    /// BAM decompression threads
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Gzip compression threads per FASTQ output
    #[arg(long = "compression-threads", default_value_t = 1)]
    compression_threads: usize,

    /// Write plain-text FASTQ instead of gzip
    #[arg(long = "no-compress")]
    no_compress: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !args.umi_separator.is_ascii() {
        bail!("The UMI separator must be an ASCII character, got {:?}", args.umi_separator);
    }

    let config = SpikeConfig {
        default_allele_fraction: args.allele_fraction,
        umi_separator: args.umi_separator as u8,
        read_threads: args.threads,
        compression_threads: args.compression_threads,
        compress_output: !args.no_compress,
    };

    let stats = spike_variants(&args.bam, &args.vcf, &args.r1, &args.r2, &config)?;
    info!(
        "Wrote {} R1 and {} R2 records in {:.2}s",
        stats.r1_written,
        stats.r2_written,
        stats.bam_stream_ms as f64 / 1000.0
    );
    Ok(())
}
