//! BAI index and the hierarchical coordinate binning scheme.
//!
//! The index maps genomic coordinate ranges to [chunks](struct.Chunk.html) of the compressed
//! file, so that a region query touches only the blocks that may contain overlapping records.
//! The index is read-only after [loading](struct.Index.html#method.from_path) and can be shared
//! between any number of iterators without locking.

use std::cmp::{max, min};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::io::ErrorKind::InvalidData;
use std::path::Path;
use std::result;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Maximal possible bin id in the five-level binning scheme.
pub const MAX_BIN: u32 = 37448;

/// Bin id that stores per-reference metadata instead of coordinate chunks.
pub(crate) const PSEUDO_BIN: u32 = 37450;

/// Each entry of the linear index covers this many basepairs.
const WINDOW_SIZE: i32 = 1 << 14;

/// A compound address into a bgzip file: the file offset of a compressed block in the upper
/// 48 bits, and the offset into the uncompressed contents of that block in the lower 16 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    /// Smallest possible offset, points at the start of the stream.
    pub const MIN: VirtualOffset = VirtualOffset(0);
    /// Largest possible offset.
    pub const MAX: VirtualOffset = VirtualOffset(std::u64::MAX);

    /// Creates a virtual offset from a compressed block offset and an offset within
    /// the uncompressed contents of the block.
    pub fn new(block_offset: u64, contents_offset: u16) -> Self {
        VirtualOffset(block_offset << 16 | contents_offset as u64)
    }

    /// Creates a virtual offset from its raw representation.
    pub fn from_raw(raw: u64) -> Self {
        VirtualOffset(raw)
    }

    /// Returns the raw 64-bit representation.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Returns the file offset of the compressed block.
    pub fn block_offset(self) -> u64 {
        self.0 >> 16
    }

    /// Returns the offset within the uncompressed contents of the block.
    pub fn contents_offset(self) -> u16 {
        self.0 as u16
    }
}

impl Display for VirtualOffset {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "c{}u{}", self.block_offset(), self.contents_offset())
    }
}

impl fmt::Debug for VirtualOffset {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), fmt::Error> {
        Display::fmt(self, f)
    }
}

/// A contiguous half-open range `[start, end)` of virtual offsets, known to contain the records
/// of one coordinate bin.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Chunk {
    start: VirtualOffset,
    end: VirtualOffset,
}

impl Chunk {
    pub fn new(start: VirtualOffset, end: VirtualOffset) -> Self {
        Chunk { start, end }
    }

    pub fn start(&self) -> VirtualOffset {
        self.start
    }

    pub fn end(&self) -> VirtualOffset {
        self.end
    }

    /// Returns `true` if the two chunks overlap.
    pub fn intersect(&self, other: &Chunk) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{{{}..{}}}", self.start, self.end)
    }
}

/// Number of records placed on a reference, taken from the index metadata bin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceStats {
    /// Records mapped to the reference.
    pub mapped: u64,
    /// Unmapped records placed on the reference (mate-placed).
    pub unmapped: u64,
}

/// Index entry for a single reference sequence: coordinate bins with their chunk lists and the
/// linear index of 16 kbp windows.
struct Reference {
    bins: HashMap<u32, Vec<Chunk>>,
    intervals: Vec<VirtualOffset>,
    stats: Option<ReferenceStats>,
    // Semantic damage confined to this reference. Queries against it fail,
    // other references stay valid.
    damage: Option<String>,
}

impl Reference {
    fn from_stream<R: Read>(stream: &mut R, largest: &mut VirtualOffset) -> io::Result<Self> {
        let n_bins = stream.read_i32::<LittleEndian>()?;
        if n_bins < 0 {
            return Err(io::Error::new(InvalidData, "negative bin count"));
        }

        let mut bins = HashMap::new();
        let mut stats = None;
        let mut damage = None;
        for _ in 0..n_bins {
            let bin_id = stream.read_u32::<LittleEndian>()?;
            let n_chunks = stream.read_i32::<LittleEndian>()?;
            if n_chunks < 0 {
                return Err(io::Error::new(InvalidData, "negative chunk count"));
            }
            let chunks = (0..n_chunks).map(|_| -> io::Result<Chunk> {
                    let start = VirtualOffset::from_raw(stream.read_u64::<LittleEndian>()?);
                    let end = VirtualOffset::from_raw(stream.read_u64::<LittleEndian>()?);
                    Ok(Chunk::new(start, end))
                }).collect::<io::Result<Vec<_>>>()?;

            if bin_id == PSEUDO_BIN {
                // Two pseudo-chunks: the placement range and the mapped/unmapped counts.
                if chunks.len() != 2 {
                    damage = Some(format!(
                        "metadata bin declares {} chunks instead of 2", chunks.len()));
                    continue;
                }
                *largest = max(*largest, chunks[0].end);
                stats = Some(ReferenceStats {
                    mapped: chunks[1].start.raw(),
                    unmapped: chunks[1].end.raw(),
                });
                continue;
            }
            if bin_id > MAX_BIN {
                damage = Some(format!("bin id {} outside of the binning scheme", bin_id));
                continue;
            }
            for chunk in &chunks {
                *largest = max(*largest, chunk.end);
            }
            bins.insert(bin_id, chunks);
        }

        let n_intervals = stream.read_i32::<LittleEndian>()?;
        if n_intervals < 0 {
            return Err(io::Error::new(InvalidData, "negative interval count"));
        }
        let intervals = (0..n_intervals)
            .map(|_| Ok(VirtualOffset::from_raw(stream.read_u64::<LittleEndian>()?)))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Reference { bins, intervals, stats, damage })
    }

    /// Smallest virtual offset that may contain records overlapping positions `>= start`,
    /// according to the linear index.
    fn min_offset(&self, start: i32) -> VirtualOffset {
        if self.intervals.is_empty() {
            return VirtualOffset::MIN;
        }
        let window = min((start / WINDOW_SIZE) as usize, self.intervals.len() - 1);
        self.intervals[window]
    }
}

/// In-memory BAI index.
///
/// Loaded once with [from_path](#method.from_path) or [from_stream](#method.from_stream),
/// immutable afterwards. [fetch_chunks](#method.fetch_chunks) resolves a coordinate range into
/// an ordered, disjoint chunk list ready for a single linear scan.
pub struct Index {
    references: Vec<Reference>,
    n_no_coor: Option<u64>,
    largest_offset: VirtualOffset,
}

impl Index {
    /// Loads the index from `path`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Index> {
        let f = File::open(&path)
            .map_err(|e| Error::Index(format!("failed to open index file: {}", e)))?;
        Index::from_stream(BufReader::new(f))
    }

    /// Loads the index from a stream. The stream does not need to support random access.
    pub fn from_stream<R: Read>(mut stream: R) -> Result<Index> {
        Index::parse(&mut stream)
            .map_err(|e| Error::Index(format!("failed to read index: {}", e)))
    }

    fn parse<R: Read>(stream: &mut R) -> io::Result<Index> {
        let mut magic = [0_u8; 4];
        stream.read_exact(&mut magic)?;
        if magic != [b'B', b'A', b'I', 1] {
            return Err(io::Error::new(InvalidData, "input is not in BAI format"));
        }

        let n_ref = stream.read_i32::<LittleEndian>()?;
        if n_ref < 0 {
            return Err(io::Error::new(InvalidData, "negative reference count"));
        }
        let mut largest_offset = VirtualOffset::MIN;
        let references = (0..n_ref)
            .map(|_| Reference::from_stream(stream, &mut largest_offset))
            .collect::<io::Result<Vec<_>>>()?;
        let n_no_coor = stream.read_u64::<LittleEndian>().ok();
        Ok(Index { references, n_no_coor, largest_offset })
    }

    /// Number of reference sequences covered by the index.
    pub fn n_references(&self) -> usize {
        self.references.len()
    }

    /// Mapped/unmapped record counts for a reference, if the index stores them.
    pub fn reference_stats(&self, ref_id: u32) -> Option<ReferenceStats> {
        self.references.get(ref_id as usize).and_then(|reference| reference.stats)
    }

    /// Number of unmapped records without any placement, stored at the end of the container.
    pub fn unplaced_unmapped(&self) -> Option<u64> {
        self.n_no_coor
    }

    /// The largest virtual offset covered by any chunk. Records stored past this offset are
    /// the unplaced unmapped tail.
    pub fn largest_offset(&self) -> VirtualOffset {
        self.largest_offset
    }

    /// Resolves the query `(ref_id, [start, end))` into an ordered list of disjoint chunks.
    ///
    /// Bins of all levels overlapping the range are collected, chunks ending before the linear
    /// index offset of the first 16 kbp window are pruned, and the rest are sorted and coalesced.
    /// An empty range resolves to an empty list. An out-of-range `ref_id` is an
    /// [InvalidRegion](../enum.Error.html#variant.InvalidRegion) error, a damaged index entry
    /// an [Index](../enum.Error.html#variant.Index) error.
    pub fn fetch_chunks(&self, ref_id: u32, start: i32, end: i32) -> Result<Vec<Chunk>> {
        let reference = self.references.get(ref_id as usize)
            .ok_or_else(|| Error::InvalidRegion(
                format!("reference id {} is not covered by the index", ref_id)))?;
        if let Some(reason) = &reference.damage {
            return Err(Error::Index(format!("reference {}: {}", ref_id, reason)));
        }
        if start >= end {
            return Ok(Vec::new());
        }

        let min_offset = reference.min_offset(start);
        let mut chunks = Vec::new();
        for bin_id in region_to_bins(start, end) {
            if let Some(bin_chunks) = reference.bins.get(&bin_id) {
                chunks.extend(bin_chunks.iter().filter(|chunk| chunk.end > min_offset));
            }
        }
        Ok(merge_chunks(chunks))
    }
}

/// Sorts chunks by start offset and coalesces overlapping and adjacent chunks, so that the
/// result can be scanned linearly without decompressing any block twice.
fn merge_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks.sort();
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if let Some(last) = merged.last_mut() {
            if chunk.start <= last.end {
                last.end = max(last.end, chunk.end);
                continue;
            }
        }
        merged.push(chunk);
    }
    merged
}

/// Returns the smallest bin fully containing the half-open interval `[beg, end)`.
pub fn region_to_bin(beg: i32, end: i32) -> u32 {
    let end = end - 1;
    for i in (14..27).step_by(3) {
        if beg >> i == end >> i {
            return (((1 << (29 - i)) - 1) / 7 + (beg >> i)) as u32;
        }
    }
    0
}

/// Returns all bins, on all levels, that overlap the half-open interval `[beg, end)`.
pub fn region_to_bins(beg: i32, end: i32) -> Vec<u32> {
    let end = end - 1;
    let mut res = vec![0];
    let mut t = 0;
    for i in 0..5 {
        t += 1 << (i * 3);
        res.extend((t + (beg >> (26 - 3 * i))) as u32..=(t + (end >> (26 - 3 * i))) as u32);
    }
    res
}

/// Returns the coordinate range `[beg, end)` covered by `bin`.
pub fn bin_to_region(bin: u16) -> (i32, i32) {
    debug_assert!(bin as u32 <= MAX_BIN);
    let bin = bin as i32;
    let mut first = 0;
    for level in 0..6 {
        let count = 1 << (3 * level);
        if bin < first + count {
            let shift = 29 - 3 * level;
            return ((bin - first) << shift, (bin - first + 1) << shift);
        }
        first += count;
    }
    (0, 1 << 29)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: u64, end: u64) -> Chunk {
        Chunk::new(VirtualOffset::from_raw(start), VirtualOffset::from_raw(end))
    }

    #[test]
    fn virtual_offset_parts() {
        let offset = VirtualOffset::new(123456, 789);
        assert_eq!(offset.block_offset(), 123456);
        assert_eq!(offset.contents_offset(), 789);
        assert!(VirtualOffset::new(100, 65535) < VirtualOffset::new(101, 0));
        assert_eq!(VirtualOffset::from_raw(offset.raw()), offset);
    }

    #[test]
    fn binning_smallest_level() {
        assert_eq!(region_to_bin(0, 1), 4681);
        assert_eq!(region_to_bin(0, 1 << 14), 4681);
        assert_eq!(region_to_bin(1 << 14, (1 << 14) + 1), 4682);
        // Crossing a 16 kbp boundary climbs one level.
        assert_eq!(region_to_bin(0, (1 << 14) + 1), 585);
        // A region spanning half of the coordinate space lands in the root bin.
        assert_eq!(region_to_bin(0, 1 << 28), 0);
    }

    #[test]
    fn bin_region_roundtrip() {
        for &bin in &[0_u16, 1, 8, 9, 72, 73, 584, 585, 4680, 4681, 37448] {
            let (beg, end) = bin_to_region(bin);
            assert!(beg < end);
            assert_eq!(region_to_bin(beg, end), bin as u32, "bin {}", bin);
        }
    }

    #[test]
    fn bins_cover_region() {
        let (beg, end) = (1_000_000, 2_000_000);
        let bins = region_to_bins(beg, end);
        assert!(bins.contains(&0));
        assert!(bins.contains(&region_to_bin(beg, end)));
        // Every 16 kbp window of the region has its smallest bin in the list.
        let mut pos = beg;
        while pos < end {
            assert!(bins.contains(&region_to_bin(pos, pos + 1)));
            pos += 1 << 14;
        }
    }

    #[test]
    fn merge_coalesces_overlapping_and_adjacent() {
        let merged = merge_chunks(vec![
            chunk(500, 700),
            chunk(100, 200),
            chunk(150, 300),
            chunk(300, 400),
        ]);
        assert_eq!(merged, vec![chunk(100, 400), chunk(500, 700)]);
    }

    #[test]
    fn fetch_chunks_prunes_by_linear_index() {
        let mut bins = HashMap::new();
        bins.insert(4681, vec![chunk(100, 200)]);
        bins.insert(4682, vec![chunk(300, 400)]);
        bins.insert(0, vec![chunk(50, 120)]);
        let index = Index {
            references: vec![Reference {
                bins,
                // Second window starts past the first two chunks.
                intervals: vec![VirtualOffset::from_raw(50), VirtualOffset::from_raw(250)],
                stats: None,
                damage: None,
            }],
            n_no_coor: None,
            largest_offset: VirtualOffset::from_raw(400),
        };

        let all = index.fetch_chunks(0, 0, 1 << 15).unwrap();
        assert_eq!(all, vec![chunk(50, 200), chunk(300, 400)]);

        // Querying only the second window drops chunks that end before its offset.
        let tail = index.fetch_chunks(0, 1 << 14, 1 << 15).unwrap();
        assert_eq!(tail, vec![chunk(300, 400)]);

        // Empty interval resolves to nothing without an error.
        assert!(index.fetch_chunks(0, 500, 500).unwrap().is_empty());

        match index.fetch_chunks(1, 0, 100) {
            Err(Error::InvalidRegion(_)) => {},
            other => panic!("expected InvalidRegion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn damaged_reference_does_not_poison_siblings() {
        let healthy = Reference {
            bins: {
                let mut bins = HashMap::new();
                bins.insert(4681, vec![chunk(100, 200)]);
                bins
            },
            intervals: vec![VirtualOffset::MIN],
            stats: None,
            damage: None,
        };
        let damaged = Reference {
            bins: HashMap::new(),
            intervals: Vec::new(),
            stats: None,
            damage: Some("metadata bin declares 3 chunks instead of 2".to_string()),
        };
        let index = Index {
            references: vec![damaged, healthy],
            n_no_coor: Some(0),
            largest_offset: VirtualOffset::from_raw(200),
        };

        match index.fetch_chunks(0, 0, 100) {
            Err(Error::Index(_)) => {},
            other => panic!("expected Index error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(index.fetch_chunks(1, 0, 1 << 14).unwrap(), vec![chunk(100, 200)]);
    }
}
