//! *bamfetch* is a crate for indexed region queries over BGZF-compressed BAM files,
//! written completely in Rust.
//!
//! ## Overview
//!
//! The crate opens an alignment container together with its BAI index and iterates exactly
//! the records overlapping a genomic interval, in file order:
//!
//! * [bamfetch::IndexedReader](bam_reader/struct.IndexedReader.html) - the container handle;
//! fetches records from random genomic regions and from the unplaced unmapped tail.
//! * [bamfetch::BamReader](bam_reader/struct.BamReader.html) - reads a container
//! consecutively, without an index.
//! * [bamfetch::Region](bam_reader/struct.Region.html) - a query, built from a raw
//! `(reference id, start, end)` triple or parsed from a `"name:start-end"` string.
//!
//! The [bgzip](bgzip/index.html) module reads and writes the underlying block-compressed
//! streams directly, and the [index](index/index.html) module exposes the loaded index with
//! its binning scheme.
//!
//! ## Usage
//!
//! The following code opens `in.bam` with its index `in.bam.bai` and prints the names of all
//! records overlapping `2:600001-700000`:
//!
//! ```rust,no_run
//! fn main() {
//!     let mut reader = bamfetch::IndexedReader::from_path("in.bam").unwrap();
//!
//!     for record in reader.fetch(&bamfetch::Region::new(1, 600_000, 700_000)).unwrap() {
//!         let record = record.unwrap();
//!         println!("{}", String::from_utf8_lossy(record.name()));
//!     }
//! }
//! ```
//!
//! Errors are never folded into empty results: an unknown reference or a malformed range
//! fails when the iterator is created, while a query that matches nothing simply yields no
//! records. See [Error](enum.Error.html) for the full taxonomy.

extern crate byteorder;
extern crate crc32fast;
extern crate flate2;
extern crate thiserror;

pub mod bam_reader;
pub mod bgzip;
pub mod error;
pub mod header;
pub mod index;
pub mod record;

pub use bam_reader::{BamReader, IndexedReader, Region, RegionViewer, UnmappedViewer};
pub use error::{Error, Result};
pub use header::Header;
pub use index::Index;
pub use record::Record;

/// A trait for reading records.
///
/// You can use a single record to avoid allocations:
/// ```rust,no_run
/// # use bamfetch::RecordReader;
/// # let mut reader = bamfetch::IndexedReader::from_path("in.bam").unwrap();
/// # let mut viewer = reader.fetch(&bamfetch::Region::new(0, 0, 100)).unwrap();
/// let mut record = bamfetch::Record::new();
/// loop {
///     match viewer.read_into(&mut record) {
///         // New record is saved into record.
///         Ok(()) => {},
///         // NoMoreRecords represents stop iteration.
///         Err(bamfetch::Error::NoMoreRecords) => break,
///         Err(e) => panic!("{}", e),
///     }
///     // Do something with the record.
/// }
/// ```
/// Or you can just iterate over records:
/// ```rust,no_run
/// # let mut reader = bamfetch::IndexedReader::from_path("in.bam").unwrap();
/// for record in reader.fetch(&bamfetch::Region::new(0, 0, 100)).unwrap() {
///     let record = record.unwrap();
///     // Do something with the record.
/// }
/// ```
pub trait RecordReader: Iterator<Item = Result<Record>> {
    /// Reads the next record into `record`, overwriting it in place. This allows to skip
    /// excessive memory allocation. The reader never keeps a reference to the record.
    ///
    /// # Errors
    ///
    /// Once the reader is exhausted, this and every following call return
    /// [NoMoreRecords](error/enum.Error.html#variant.NoMoreRecords).
    ///
    /// [Corrupted](error/enum.Error.html#variant.Corrupted) and
    /// [Truncated](error/enum.Error.html#variant.Truncated) terminate the reader: the error
    /// is reported once and later calls return `NoMoreRecords`. Records yielded before the
    /// failure remain valid.
    ///
    /// If the function returns an error, the record is cleared.
    fn read_into(&mut self, record: &mut Record) -> Result<()>;
}
