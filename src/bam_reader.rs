//! Indexed and consecutive readers over alignment containers.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::fmt::{self, Display, Formatter};
use std::result;

use super::bgzip::read::{ChunksReader, ConsecutiveReader, SharedStream};
use super::error::{Error, Result};
use super::header::Header;
use super::index::{self, Index, VirtualOffset};
use super::record::Record;
use super::RecordReader;

/// A query: a reference sequence and a half-open, 0-based coordinate interval `[start, end)`.
///
/// Can be built from a raw triple with [new](#method.new), or from a symbolic region string
/// with [parse](#method.parse); both produce the same representation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Region {
    ref_id: u32,
    start: u32,
    end: u32,
}

impl Region {
    /// Creates a region from a 0-based reference id and a half-open interval `[start, end)`.
    /// The values are validated when the region is fetched.
    pub fn new(ref_id: u32, start: u32, end: u32) -> Region {
        Region { ref_id, start, end }
    }

    /// Parses a symbolic region string against the header's reference table.
    ///
    /// Accepted forms are `name`, `name:start` and `name:start-end`, with 1-based inclusive
    /// coordinates and optional thousands separators, so `"chr1:1,001-2,000"` denotes the
    /// same region as `Region::new(0, 1_000, 2_000)` (assuming `chr1` has id 0). A name
    /// containing `:` is tried verbatim first.
    pub fn parse(s: &str, header: &Header) -> Result<Region> {
        if let Some(ref_id) = header.reference_id(s) {
            let len = header.reference_len(ref_id as usize).unwrap_or(0);
            return Ok(Region::new(ref_id, 0, len));
        }
        let (name, range) = s.rsplit_once(':').ok_or_else(||
            Error::InvalidRegion(format!("unknown reference name {:?}", s)))?;
        let ref_id = header.reference_id(name).ok_or_else(||
            Error::InvalidRegion(format!("unknown reference name {:?}", name)))?;
        let len = header.reference_len(ref_id as usize).unwrap_or(0);

        let parse_coord = |text: &str| -> Result<u32> {
            text.replace(',', "").parse().map_err(|_|
                Error::InvalidRegion(format!("cannot parse coordinate {:?} in {:?}", text, s)))
        };
        let (start, end) = match range.split_once('-') {
            Some((start_text, end_text)) => (parse_coord(start_text)?, parse_coord(end_text)?),
            None => (parse_coord(range)?, len),
        };
        if start == 0 {
            return Err(Error::InvalidRegion(
                format!("coordinates in {:?} are 1-based, cannot start at 0", s)));
        }
        if end < start {
            return Err(Error::InvalidRegion(format!("empty interval in {:?}", s)));
        }
        // 1-based inclusive to 0-based half-open.
        Ok(Region::new(ref_id, start - 1, end))
    }

    /// 0-based reference id.
    pub fn ref_id(&self) -> u32 {
        self.ref_id
    }

    /// 0-based inclusive start.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// 0-based exclusive end.
    pub fn end(&self) -> u32 {
        self.end
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}:{}-{}", self.ref_id, self.start + 1, self.end)
    }
}

/// Iterator over records overlapping a specific region.
/// Implements the [RecordReader](../trait.RecordReader.html) trait.
///
/// The viewer owns its own cursor over the shared compressed stream, so several viewers on
/// the same container stay independent: dropping one, or reading them in any interleaving,
/// does not change what the others return.
///
/// If possible, create a single [Record](../record/struct.Record.html) and use
/// [read_into](../trait.RecordReader.html#tymethod.read_into) instead of iterating, as it
/// saves time on allocation. The record is overwritten in place on every call.
pub struct RegionViewer<R: Read + Seek> {
    reader: ChunksReader<R>,
    ref_id: u32,
    start: i32,
    end: i32,
    predicate: Box<dyn Fn(&Record) -> bool>,
    state: ViewerState,
    closed: Arc<AtomicBool>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ViewerState {
    Iterating,
    Exhausted,
    Failed,
}

impl<R: Read + Seek> RegionViewer<R> {
    fn check_live(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match self.state {
            ViewerState::Iterating => Ok(()),
            // A failed viewer already reported its error, afterwards it only signals the end.
            ViewerState::Exhausted | ViewerState::Failed => Err(Error::NoMoreRecords),
        }
    }

    fn exhaust(&mut self, record: &mut Record) -> Error {
        record.clear();
        self.state = ViewerState::Exhausted;
        Error::NoMoreRecords
    }

    fn fail(&mut self, record: &mut Record, e: Error) -> Error {
        record.clear();
        self.state = ViewerState::Failed;
        e
    }
}

impl<R: Read + Seek> RecordReader for RegionViewer<R> {
    fn read_into(&mut self, record: &mut Record) -> Result<()> {
        self.check_live().map_err(|e| { record.clear(); e })?;
        loop {
            if let Err(e) = record.fill_from(&mut self.reader) {
                return Err(match e {
                    Error::NoMoreRecords => self.exhaust(record),
                    e => self.fail(record, e),
                });
            }
            // Chunks are coarse: records of a neighboring reference can share the boundary
            // blocks, and records of the queried reference may miss the interval entirely.
            if record.ref_id() < 0 || (record.ref_id() as u32) < self.ref_id {
                continue;
            }
            if record.ref_id() as u32 > self.ref_id {
                return Err(self.exhaust(record));
            }
            // Records are sorted by start, nothing further can overlap.
            if record.start() >= self.end {
                return Err(self.exhaust(record));
            }
            if !(self.predicate)(&record) {
                continue;
            }
            if record.bin() as u32 > index::MAX_BIN {
                return Err(self.fail(record,
                    Error::Corrupted("record bin is bigger than the max possible value")));
            }
            // A record whose whole bin lies inside the query overlaps it for sure, without
            // looking at the CIGAR.
            let (min_start, max_end) = index::bin_to_region(record.bin());
            if min_start >= self.start && max_end <= self.end {
                return Ok(());
            }

            let record_end = record.calculate_end();
            if record_end < record.start() {
                return Err(self.fail(record, Error::Corrupted("record end < record start")));
            }
            if record_end > self.start {
                return Ok(());
            }
        }
    }
}

/// Iterator over records.
///
/// After the viewer is exhausted or has failed, every `next` call returns `None`.
impl<R: Read + Seek> Iterator for RegionViewer<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = Record::new();
        match self.read_into(&mut record) {
            Ok(()) => Some(Ok(record)),
            Err(Error::NoMoreRecords) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Iterator over the unplaced unmapped records stored at the end of the container.
/// Implements the [RecordReader](../trait.RecordReader.html) trait.
pub struct UnmappedViewer<R: Read + Seek> {
    reader: ChunksReader<R>,
    state: ViewerState,
    closed: Arc<AtomicBool>,
}

impl<R: Read + Seek> RecordReader for UnmappedViewer<R> {
    fn read_into(&mut self, record: &mut Record) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            record.clear();
            return Err(Error::Closed);
        }
        if self.state != ViewerState::Iterating {
            record.clear();
            return Err(Error::NoMoreRecords);
        }
        loop {
            if let Err(e) = record.fill_from(&mut self.reader) {
                record.clear();
                self.state = match e {
                    Error::NoMoreRecords => ViewerState::Exhausted,
                    _ => ViewerState::Failed,
                };
                return Err(e);
            }
            // Placed records may trail into the scanned range, skip them.
            if record.ref_id() < 0 {
                return Ok(());
            }
        }
    }
}

impl<R: Read + Seek> Iterator for UnmappedViewer<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = Record::new();
        match self.read_into(&mut record) {
            Ok(()) => Some(Ok(record)),
            Err(Error::NoMoreRecords) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Defines how to react to the index being older than the data file.
///
/// # Variants
/// * `Error` - [IndexedReader](struct.IndexedReader.html) will not be constructed, an
/// [Index](../enum.Error.html#variant.Index) error is returned.
/// * `Ignore` - does nothing.
/// * `Warn` - calls a function `Fn(&str)` and continues construction.
pub enum ModificationTime {
    Error,
    Ignore,
    Warn(Box<dyn Fn(&str)>),
}

impl ModificationTime {
    fn check<T: AsRef<Path>, U: AsRef<Path>>(&self, bam_path: T, bai_path: U) -> Result<()> {
        let bam_modified = bam_path.as_ref().metadata().and_then(|metadata| metadata.modified());
        let bai_modified = bai_path.as_ref().metadata().and_then(|metadata| metadata.modified());
        let bam_younger = match (bam_modified, bai_modified) {
            (Ok(bam_time), Ok(bai_time)) => bai_time < bam_time,
            _ => false, // Modification time not available.
        };
        if !bam_younger {
            return Ok(());
        }

        match &self {
            ModificationTime::Ignore => {},
            ModificationTime::Error => return Err(Error::Index(
                "the index is older than the data file".to_string())),
            ModificationTime::Warn(box_fun) =>
                box_fun("the index is older than the data file"),
        }
        Ok(())
    }

    /// Creates a warning strategy `ModificationTime::Warn`.
    pub fn warn<F: Fn(&str) + 'static>(warning: F) -> Self {
        ModificationTime::Warn(Box::new(warning))
    }
}

/// [IndexedReader](struct.IndexedReader.html) builder. Allows to specify the index path and
/// the index modification time policy.
pub struct IndexedReaderBuilder {
    bai_path: Option<PathBuf>,
    modification_time: ModificationTime,
}

impl IndexedReaderBuilder {
    pub fn new() -> Self {
        Self {
            bai_path: None,
            modification_time: ModificationTime::Error,
        }
    }

    /// Sets the path to the index. By default, it is `{bam_path}.bai`.
    pub fn bai_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.bai_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// By default, construction fails with an [Index](../enum.Error.html#variant.Index)
    /// error if the index was modified earlier than the data file.
    /// [ModificationTime](enum.ModificationTime.html) allows to skip the check or to turn
    /// it into a warning.
    pub fn modification_time(&mut self, modification_time: ModificationTime) -> &mut Self {
        self.modification_time = modification_time;
        self
    }

    /// Creates a new [IndexedReader](struct.IndexedReader.html) from `bam_path`.
    /// If the index path was not specified, opens `{bam_path}.bai`.
    pub fn from_path<P: AsRef<Path>>(&self, bam_path: P) -> Result<IndexedReader<File>> {
        let bam_path = bam_path.as_ref();
        let bai_path = self.bai_path.clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.bai", bam_path.display())));
        self.modification_time.check(&bam_path, &bai_path)?;

        let stream = SharedStream::from_path(bam_path)
            .map_err(|e| Error::Open(format!("failed to open data file: {}", e)))?;
        let index = Index::from_path(bai_path)?;
        IndexedReader::new(stream, index)
    }

    /// Creates a new [IndexedReader](struct.IndexedReader.html) from two streams.
    /// The data stream must support random access, the index stream does not need to.
    /// `bai_path` and `modification_time` are ignored.
    pub fn from_streams<R: Read + Seek, T: Read>(&self, bam_stream: R, bai_stream: T)
            -> Result<IndexedReader<R>> {
        let index = Index::from_stream(bai_stream)?;
        IndexedReader::new(SharedStream::new(bam_stream), index)
    }
}

/// Indexed reader over an alignment container: the container handle.
///
/// Opens the container and its index, and hands out iterators over regions
/// ([fetch](#method.fetch), [fetch_by](#method.fetch_by)) and over the unplaced unmapped tail
/// ([fetch_unmapped](#method.fetch_unmapped)). Iterators are independent of each other and of
/// the reader; they only share the underlying stream, access to which is serialized
/// internally per block.
///
/// The following code opens `in.bam` together with `in.bam.bai` and counts the records
/// overlapping `chr1:600001-700000`:
///
/// ```rust,no_run
/// let mut reader = bamfetch::IndexedReader::from_path("in.bam").unwrap();
/// let region = bamfetch::Region::parse("chr1:600001-700000", reader.header()).unwrap();
/// let count = reader.fetch(&region).unwrap()
///     .map(|record| record.unwrap())
///     .count();
/// println!("{} records in {}", count, region);
/// ```
///
/// `read_into` saves the allocation of one record per iteration:
///
/// ```rust,no_run
/// use bamfetch::RecordReader;
///
/// let mut reader = bamfetch::IndexedReader::from_path("in.bam").unwrap();
/// let mut viewer = reader.fetch(&bamfetch::Region::new(0, 100_000, 200_000)).unwrap();
/// let mut record = bamfetch::Record::new();
/// loop {
///     match viewer.read_into(&mut record) {
///         Ok(()) => {},
///         Err(bamfetch::Error::NoMoreRecords) => break,
///         Err(e) => panic!("{}", e),
///     }
///     // Do something with the record.
/// }
/// ```
///
/// [IndexedReaderBuilder](struct.IndexedReaderBuilder.html) gives more control, for example
/// a different index path or a laxer index staleness policy:
///
/// ```rust,no_run
/// use bamfetch::bam_reader::ModificationTime;
/// let mut reader = bamfetch::IndexedReader::build()
///     .bai_path("other_dir/test.bai")
///     .modification_time(ModificationTime::warn(|e| eprintln!("{}", e)))
///     .from_path("in.bam").unwrap();
/// ```
pub struct IndexedReader<R: Read + Seek> {
    stream: SharedStream<R>,
    header: Header,
    index: Arc<Index>,
    closed: Arc<AtomicBool>,
    sequential: ChunksReader<R>,
    sequential_valid: bool,
    first_record: VirtualOffset,
}

impl IndexedReader<File> {
    /// Creates an [IndexedReaderBuilder](struct.IndexedReaderBuilder.html).
    pub fn build() -> IndexedReaderBuilder {
        IndexedReaderBuilder::new()
    }

    /// Opens the container at `path` with the index at `{path}.bai`.
    /// Same as `Self::build().from_path(path)`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::build().from_path(path)
    }
}

impl<R: Read + Seek> IndexedReader<R> {
    fn new(stream: SharedStream<R>, index: Index) -> Result<Self> {
        let mut sequential = ChunksReader::new(stream.clone(), Vec::new());
        sequential.make_consecutive(VirtualOffset::MIN);
        let header = Header::from_bam(&mut sequential)?;
        let first_record = sequential.virtual_position();
        Ok(Self {
            stream,
            header,
            index: Arc::new(index),
            closed: Arc::new(AtomicBool::new(false)),
            sequential,
            sequential_valid: true,
            first_record,
        })
    }

    /// Returns an iterator over records overlapping the `region`.
    ///
    /// The query is validated here: an unknown reference id or `start > end` fail with
    /// [InvalidRegion](../enum.Error.html#variant.InvalidRegion) immediately, they are never
    /// reported as an empty iteration. An end past the reference length is clamped. An
    /// empty interval is a valid query that yields no records.
    pub fn fetch(&mut self, region: &Region) -> Result<RegionViewer<R>> {
        self.fetch_by(region, |_| true)
    }

    /// Same as [fetch](#method.fetch), but records are additionally filtered by `predicate`.
    /// The predicate runs before the overlap check computes the record end, which saves the
    /// CIGAR scan for records it rejects.
    pub fn fetch_by<F>(&mut self, region: &Region, predicate: F) -> Result<RegionViewer<R>>
    where F: 'static + Fn(&Record) -> bool,
    {
        let len = match self.header.reference_len(region.ref_id() as usize) {
            Some(len) => len,
            None => return Err(Error::InvalidRegion(format!(
                "reference id {} out of range ({} references)",
                region.ref_id(), self.header.n_references()))),
        };
        if region.start() > region.end() {
            return Err(Error::InvalidRegion(format!(
                "start > end ({} > {})", region.start(), region.end())));
        }
        let start = region.start().min(len);
        let end = region.end().min(len);

        let chunks = if start == end {
            Vec::new()
        } else {
            self.index.fetch_chunks(region.ref_id(), start as i32, end as i32)?
        };
        self.sequential_valid = false;
        Ok(RegionViewer {
            reader: ChunksReader::new(self.stream.clone(), chunks),
            ref_id: region.ref_id(),
            start: start as i32,
            end: end as i32,
            predicate: Box::new(predicate),
            state: ViewerState::Iterating,
            closed: Arc::clone(&self.closed),
        })
    }

    /// Returns an iterator over the unplaced unmapped records, stored after the last indexed
    /// position of the container.
    pub fn fetch_unmapped(&mut self) -> Result<UnmappedViewer<R>> {
        let from = std::cmp::max(self.index.largest_offset(), self.first_record);
        let mut reader = ChunksReader::new(self.stream.clone(), Vec::new());
        reader.make_consecutive(from);
        self.sequential_valid = false;
        Ok(UnmappedViewer {
            reader,
            state: ViewerState::Iterating,
            closed: Arc::clone(&self.closed),
        })
    }

    /// Reads the next record of the plain sequential record stream, starting right after
    /// the header.
    ///
    /// Creating any iterator ([fetch](#method.fetch), [fetch_by](#method.fetch_by),
    /// [fetch_unmapped](#method.fetch_unmapped)) leaves the sequential position undefined:
    /// this function then fails with
    /// [InvalidPosition](../enum.Error.html#variant.InvalidPosition) until
    /// [rewind](#method.rewind) explicitly resets the stream, instead of continuing from
    /// wherever iteration left the container.
    pub fn read_sequential_into(&mut self, record: &mut Record) -> Result<()> {
        if !self.sequential_valid {
            record.clear();
            return Err(Error::InvalidPosition);
        }
        record.fill_from(&mut self.sequential)
    }

    /// Repositions the sequential record stream to the first record and makes
    /// [read_sequential_into](#method.read_sequential_into) valid again.
    pub fn rewind(&mut self) {
        self.sequential.make_consecutive(self.first_record);
        self.sequential_valid = true;
    }

    /// Returns the [header](../header/struct.Header.html).
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the loaded [index](../index/struct.Index.html).
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Closes the container handle.
    ///
    /// All iterators created from this reader are invalidated: their next call fails with
    /// [Closed](../enum.Error.html#variant.Closed). Dropping the reader has the same effect.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

impl<R: Read + Seek> Drop for IndexedReader<R> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Consecutive reader over an alignment container, without an index. In contrast to
/// [IndexedReader](struct.IndexedReader.html) it cannot fetch regions, but reads all records
/// in file order and works on non-seekable streams.
///
/// ```rust,no_run
/// let reader = bamfetch::BamReader::from_path("in.bam").unwrap();
/// for record in reader {
///     let record = record.unwrap();
///     // Do something.
/// }
/// ```
pub struct BamReader<R: Read> {
    reader: ConsecutiveReader<R>,
    header: Header,
}

impl BamReader<File> {
    /// Creates a consecutive reader from `path`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = File::open(path)
            .map_err(|e| Error::Open(format!("failed to open data file: {}", e)))?;
        Self::from_stream(stream)
    }
}

impl<R: Read> BamReader<R> {
    /// Creates a consecutive reader from `stream`, which does not need to support random
    /// access.
    pub fn from_stream(stream: R) -> Result<Self> {
        let mut reader = ConsecutiveReader::from_stream(stream);
        let header = Header::from_bam(&mut reader)?;
        Ok(Self { reader, header })
    }

    /// Returns the [header](../header/struct.Header.html).
    pub fn header(&self) -> &Header {
        &self.header
    }
}

impl<R: Read> RecordReader for BamReader<R> {
    fn read_into(&mut self, record: &mut Record) -> Result<()> {
        record.fill_from(&mut self.reader)
    }
}

impl<R: Read> Iterator for BamReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = Record::new();
        match self.read_into(&mut record) {
            Ok(()) => Some(Ok(record)),
            Err(Error::NoMoreRecords) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use byteorder::{LittleEndian, WriteBytesExt};

    use super::*;

    fn sample_header() -> Header {
        let text = b"@HD\tVN:1.6\tSO:coordinate\n";
        let mut raw = Vec::new();
        raw.extend_from_slice(b"BAM\x01");
        raw.write_i32::<LittleEndian>(text.len() as i32).unwrap();
        raw.extend_from_slice(text);
        raw.write_i32::<LittleEndian>(2).unwrap();
        for &(name, len) in &[("chr1", 2_000_000_u32), ("HLA-DRB1*15:01:01", 11_080)] {
            raw.write_i32::<LittleEndian>(name.len() as i32 + 1).unwrap();
            raw.extend_from_slice(name.as_bytes());
            raw.push(0);
            raw.write_i32::<LittleEndian>(len as i32).unwrap();
        }
        Header::from_bam(&mut Cursor::new(raw)).unwrap()
    }

    #[test]
    fn region_string_forms() {
        let header = sample_header();
        assert_eq!(Region::parse("chr1", &header).unwrap(),
            Region::new(0, 0, 2_000_000));
        assert_eq!(Region::parse("chr1:1001", &header).unwrap(),
            Region::new(0, 1_000, 2_000_000));
        assert_eq!(Region::parse("chr1:1,000,001-2,000,000", &header).unwrap(),
            Region::new(0, 1_000_000, 2_000_000));
        // A single base.
        assert_eq!(Region::parse("chr1:500-500", &header).unwrap(),
            Region::new(0, 499, 500));
    }

    #[test]
    fn region_name_containing_colon() {
        let header = sample_header();
        assert_eq!(Region::parse("HLA-DRB1*15:01:01", &header).unwrap(),
            Region::new(1, 0, 11_080));
        assert_eq!(Region::parse("HLA-DRB1*15:01:01:200-300", &header).unwrap(),
            Region::new(1, 199, 300));
    }

    #[test]
    fn region_string_rejections() {
        let header = sample_header();
        for s in &["chrMT", "chr1:x-y", "chr1:0-10", "chr1:200-100", "chr3:1-10"] {
            match Region::parse(s, &header) {
                Err(Error::InvalidRegion(_)) => {},
                other => panic!("{:?}: expected InvalidRegion, got {:?}", s, other),
            }
        }
    }
}
