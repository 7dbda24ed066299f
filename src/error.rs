//! Crate-wide error type.

use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error produced while opening a container, loading an index, constructing a
/// query or reading records.
///
/// # Variants
///
/// * `Open` - the container file is missing, unreadable or does not start with
/// the BAM magic.
/// * `Index` - the index file is missing, older than the data file, or
/// structurally invalid. Also returned when a query hits a reference sequence
/// whose index entry was damaged.
/// * `InvalidRegion` - the query names an unknown reference or an impossible
/// range. Raised when the query is constructed, never silently turned into an
/// empty result.
/// * `Corrupted` - decoding produced impossible values (negative lengths,
/// mismatching flags). Terminates the current iterator.
/// * `Truncated` - reading a record or a compressed block was interrupted by
/// an I/O error, including mid-record end of file. Terminates the current
/// iterator.
/// * `NoMoreRecords` - the end-of-stream marker, returned by every call after
/// an iterator is exhausted. Represents `StopIteration`, not a failure.
/// * `InvalidPosition` - a sequential read was attempted after region
/// iteration moved the stream; call `rewind` first.
/// * `Closed` - the container handle was closed while this iterator was still
/// alive.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open container: {0}")]
    Open(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("corrupted record: {0}")]
    Corrupted(&'static str),
    #[error("truncated record: {0}")]
    Truncated(#[source] io::Error),
    #[error("no more records")]
    NoMoreRecords,
    #[error("stream position undefined after region iteration, rewind first")]
    InvalidPosition,
    #[error("container handle was closed")]
    Closed,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Truncated(e)
    }
}
