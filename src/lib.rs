#![allow(non_local_definitions)]

//! Spike synthetic variants into coordinate-sorted alignments.
//!
//! Reads from a sorted BAM and variants from a sorted VCF are merge-joined in
//! one pass. Each read's fate at a variant is decided by a hash of the UMI in
//! its name, so every read of a UMI family makes the same decision.

// Modules
pub mod cigar_walker;
pub mod coords;
pub mod fastq;
pub mod records;
pub mod spike_pipeline; // Single-pass BAM + VCF -> paired FASTQ driver
pub mod umi_hash;
pub mod variant_reader;
pub mod variant_window;

pub use cigar_walker::{select_variant, spike_read, MutationStats, SpikedRead};
pub use coords::GenomicPos;
pub use fastq::{FastqSink, Mate, PairedFastqWriter};
pub use records::{AlignmentRecord, VariantClass, VariantRecord};
pub use spike_pipeline::{spike_variants, SpikeConfig, SpikeStats, VariantSpiker};
pub use umi_hash::{umi_draw, umi_hash, DEFAULT_UMI_SEPARATOR};
pub use variant_reader::{build_tid_lookup, VcfVariantReader};
pub use variant_window::{VariantWindow, WindowStats};

// ============================================================================
// PyO3 Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    use crate::spike_pipeline;

    fn separator_byte(umi_separator: &str) -> PyResult<u8> {
        match umi_separator.as_bytes() {
            [b] => Ok(*b),
            _ => Err(PyValueError::new_err(format!(
                "UMI separator must be a single byte, got {:?}",
                umi_separator
            ))),
        }
    }

    /// Spike variants into reads and write paired FASTQ (Rust implementation)
    ///
    /// # Arguments
    /// * `bam_path` - Coordinate-sorted input BAM
    /// * `vcf_path` - Coordinate-sorted VCF (plain or bgzipped), same contig order
    /// * `out_r1` / `out_r2` - Output FASTQ paths
    /// * `allele_fraction` - Fraction for variants without a FORMAT `FA`
    /// * `umi_separator` - Character preceding the UMI in read names
    /// * `compress_output` - Gzip the FASTQ outputs
    /// * `threads` - BAM decompression threads
    /// * `compression_threads` - Gzip threads per output
    ///
    /// # Returns
    /// Dictionary of run statistics
    ///
    /// # Example (Python)
    /// ```python
    /// import umi_spike
    /// stats = umi_spike.spike_variants("in.bam", "truth.vcf.gz", "r1.fq.gz", "r2.fq.gz")
    /// print(stats["kept_variants"])
    /// ```
    #[pyfunction]
    #[pyo3(name = "spike_variants", signature = (
        bam_path,
        vcf_path,
        out_r1,
        out_r2,
        allele_fraction = spike_pipeline::DEFAULT_ALLELE_FRACTION,
        umi_separator = "#",
        compress_output = true,
        threads = 1,
        compression_threads = 1
    ))]
    #[allow(clippy::too_many_arguments)]
    fn spike_variants_py(
        py: Python,
        bam_path: &str,
        vcf_path: &str,
        out_r1: &str,
        out_r2: &str,
        allele_fraction: f64,
        umi_separator: &str,
        compress_output: bool,
        threads: usize,
        compression_threads: usize,
    ) -> PyResult<PyObject> {
        use pyo3::types::PyDict;

        let config = spike_pipeline::SpikeConfig {
            default_allele_fraction: allele_fraction,
            umi_separator: separator_byte(umi_separator)?,
            read_threads: threads,
            compression_threads,
            compress_output,
        };

        let stats = py
            .allow_threads(|| spike_pipeline::spike_variants(bam_path, vcf_path, out_r1, out_r2, &config))
            .map_err(|e| PyRuntimeError::new_err(format!("Variant spiking failed: {:#}", e)))?;

        let py_dict = PyDict::new(py);
        py_dict.set_item("total_reads", stats.total_reads)?;
        py_dict.set_item("reads_filtered", stats.reads_filtered)?;
        py_dict.set_item("reads_walked", stats.reads_walked)?;
        py_dict.set_item("reads_passthrough", stats.reads_passthrough)?;
        py_dict.set_item("r1_written", stats.r1_written)?;
        py_dict.set_item("r2_written", stats.r2_written)?;
        py_dict.set_item("kept_variants", stats.mutations.kept_variants)?;
        py_dict.set_item("skipped_variants", stats.mutations.skipped_variants)?;
        py_dict.set_item("no_variant_positions", stats.mutations.no_variant_positions)?;
        py_dict.set_item("kept_snv", stats.mutations.kept_snv)?;
        py_dict.set_item("kept_mnv", stats.mutations.kept_mnv)?;
        py_dict.set_item("kept_insertion", stats.mutations.kept_insertion)?;
        py_dict.set_item("kept_deletion", stats.mutations.kept_deletion)?;
        py_dict.set_item("unsupported_variants", stats.mutations.unsupported_variants)?;
        py_dict.set_item("truncated_deletions", stats.mutations.truncated_deletions)?;
        py_dict.set_item("variants_skipped", stats.window.variants_skipped)?;
        py_dict.set_item("variants_windowed", stats.window.variants_windowed)?;
        py_dict.set_item("variants_evicted", stats.window.variants_evicted)?;
        py_dict.set_item("vcf_records_read", stats.vcf.records_read)?;
        py_dict.set_item("vcf_symbolic_alt", stats.vcf.symbolic_alt)?;
        py_dict.set_item("bam_stream_ms", stats.bam_stream_ms)?;

        Ok(py_dict.into())
    }

    /// UMI draw in [0, 1) for a read name
    #[pyfunction]
    #[pyo3(name = "umi_draw", signature = (name, umi_separator = "#"))]
    fn umi_draw_py(name: &str, umi_separator: &str) -> PyResult<f64> {
        Ok(crate::umi_hash::umi_draw(name.as_bytes(), separator_byte(umi_separator)?))
    }

    /// Python module
    #[pymodule]
    fn umi_spike(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(spike_variants_py, m)?)?;
        m.add_function(wrap_pyfunction!(umi_draw_py, m)?)?;
        Ok(())
    }
}
