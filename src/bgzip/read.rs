//! Bgzip (BGZF) readers.
//!
//! [SharedStream](struct.SharedStream.html) wraps the raw compressed stream so that several
//! readers can address it independently, [ChunksReader](struct.ChunksReader.html) exposes the
//! uncompressed contents of a chunk list as `io::Read`, and
//! [ConsecutiveReader](struct.ConsecutiveReader.html) reads a whole bgzip stream without
//! random access.

use std::cmp::min;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::index::{Chunk, VirtualOffset};
use super::{Block, BlockError};

/// A raw compressed stream shared between several readers.
///
/// Fetching a block locks the stream and performs the seek and the read of the compressed
/// bytes as one atomic unit, so concurrent readers can never observe each other's position.
/// Inflation happens outside the lock. Cloning the handle produces another cursor over the
/// same underlying stream.
pub struct SharedStream<R: Read + Seek> {
    inner: Arc<Mutex<R>>,
}

impl<R: Read + Seek> Clone for SharedStream<R> {
    fn clone(&self) -> Self {
        SharedStream { inner: Arc::clone(&self.inner) }
    }
}

impl SharedStream<File> {
    /// Opens a shared stream over a file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(SharedStream::new(File::open(path)?))
    }
}

impl<R: Read + Seek> SharedStream<R> {
    pub fn new(stream: R) -> Self {
        SharedStream { inner: Arc::new(Mutex::new(stream)) }
    }

    /// Seeks to `offset` and loads one compressed block, holding the lock for the whole
    /// seek+read pair.
    pub(crate) fn fetch_block(&self, offset: u64, block: &mut Block) -> Result<(), BlockError> {
        let mut guard = self.inner.lock().map_err(|_| BlockError::Io(io::Error::new(
            io::ErrorKind::Other, "another reader panicked while holding the stream")))?;
        guard.seek(SeekFrom::Start(offset))?;
        block.load(Some(offset), &mut *guard)
    }
}

/// Reads the uncompressed contents of an ordered list of
/// [chunks](../../index/struct.Chunk.html) as one continuous `io::Read` stream.
///
/// Chunks must be sorted and pairwise disjoint, which
/// [Index::fetch_chunks](../../index/struct.Index.html#method.fetch_chunks) guarantees.
/// When two consecutive chunks land in the same compressed block, the block is
/// decompressed only once.
pub struct ChunksReader<R: Read + Seek> {
    stream: SharedStream<R>,
    chunks: Vec<Chunk>,
    chunk_ix: usize,
    block: Block,
    block_loaded: bool,
    // Valid while block_loaded.
    block_offset: u64,
    next_block_offset: u64,
    // True once at least one block of the current chunk was consumed: the next block then
    // continues at next_block_offset instead of the chunk start.
    in_chunk: bool,
    contents_offset: usize,
}

impl<R: Read + Seek> ChunksReader<R> {
    pub fn new(stream: SharedStream<R>, chunks: Vec<Chunk>) -> Self {
        let mut reader = ChunksReader {
            stream,
            chunks: Vec::new(),
            chunk_ix: 0,
            block: Block::new(),
            block_loaded: false,
            block_offset: 0,
            next_block_offset: 0,
            in_chunk: false,
            contents_offset: 0,
        };
        reader.set_chunks(chunks);
        reader
    }

    /// Restarts the reader over a new chunk list.
    pub fn set_chunks(&mut self, chunks: Vec<Chunk>) {
        for i in 1..chunks.len() {
            debug_assert!(!chunks[i - 1].intersect(&chunks[i]),
                "chunk {} intersects chunk {}", chunks[i - 1], chunks[i]);
            debug_assert!(chunks[i - 1] < chunks[i],
                "chunks are unordered: {} >= {}", chunks[i - 1], chunks[i]);
        }
        self.chunks = chunks;
        self.chunk_ix = 0;
        self.block_loaded = false;
        self.in_chunk = false;
        self.contents_offset = 0;
    }

    /// Restarts the reader at `from` and continues until the end of the stream.
    pub fn make_consecutive(&mut self, from: VirtualOffset) {
        self.set_chunks(vec![Chunk::new(from, VirtualOffset::MAX)]);
    }

    /// Virtual offset of the next byte this reader would return.
    pub fn virtual_position(&self) -> VirtualOffset {
        if self.block_loaded {
            VirtualOffset::new(self.block_offset, self.contents_offset as u16)
        } else if self.chunk_ix < self.chunks.len() {
            self.chunks[self.chunk_ix].start()
        } else {
            VirtualOffset::MAX
        }
    }

    fn load_block(&mut self) -> io::Result<bool> {
        let chunk = self.chunks[self.chunk_ix];
        let (load_offset, init_contents) = if self.in_chunk {
            (self.next_block_offset, 0)
        } else {
            (chunk.start().block_offset(), chunk.start().contents_offset() as usize)
        };
        match self.stream.fetch_block(load_offset, &mut self.block) {
            Ok(()) => {}
            Err(BlockError::EndOfStream) => {
                // The stream may end before an unbounded chunk does.
                self.chunk_ix = self.chunks.len();
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        self.block.decompress().map_err(io::Error::from)?;
        self.block_offset = load_offset;
        self.next_block_offset = load_offset
            + self.block.block_size().unwrap_or(self.block.uncompressed_size() + 26) as u64;
        self.contents_offset = init_contents;
        self.block_loaded = true;
        self.in_chunk = true;
        Ok(true)
    }

    fn advance_chunk(&mut self) {
        self.chunk_ix += 1;
        self.in_chunk = false;
        if self.block_loaded && self.chunk_ix < self.chunks.len() {
            let next = self.chunks[self.chunk_ix];
            if next.start().block_offset() == self.block_offset {
                // The next chunk starts in the block already decompressed.
                self.contents_offset = next.start().contents_offset() as usize;
                self.in_chunk = true;
                return;
            }
        }
        self.block_loaded = false;
    }
}

impl<R: Read + Seek> Read for ChunksReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.chunk_ix >= self.chunks.len() {
                return Ok(0);
            }
            if !self.block_loaded && !self.load_block()? {
                return Ok(0);
            }

            let chunk_end = self.chunks[self.chunk_ix].end();
            let contents_end = if self.block_offset < chunk_end.block_offset() {
                self.block.uncompressed_size()
            } else {
                min(chunk_end.contents_offset() as usize, self.block.uncompressed_size())
            };

            if self.contents_offset < contents_end {
                let read_bytes = min(contents_end - self.contents_offset, buf.len());
                buf[..read_bytes].copy_from_slice(&self.block.uncompressed_data()
                    [self.contents_offset..self.contents_offset + read_bytes]);
                self.contents_offset += read_bytes;
                return Ok(read_bytes);
            }

            if self.block_offset >= chunk_end.block_offset()
                    || VirtualOffset::new(self.next_block_offset, 0) >= chunk_end {
                self.advance_chunk();
            } else {
                self.block_loaded = false;
            }
        }
    }
}

/// Reads a bgzip stream block after block, without random access. The stream only needs to
/// implement `io::Read`.
pub struct ConsecutiveReader<R: Read> {
    stream: R,
    block: Block,
    block_loaded: bool,
    offset: u64,
    contents_offset: usize,
}

impl ConsecutiveReader<File> {
    /// Opens a consecutive reader over a file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(ConsecutiveReader::from_stream(File::open(path)?))
    }
}

impl<R: Read> ConsecutiveReader<R> {
    /// Opens a consecutive reader over a stream, starting at its current position.
    pub fn from_stream(stream: R) -> Self {
        ConsecutiveReader {
            stream,
            block: Block::new(),
            block_loaded: false,
            offset: 0,
            contents_offset: 0,
        }
    }
}

impl<R: Read> Read for ConsecutiveReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.block_loaded {
                match self.block.load(Some(self.offset), &mut self.stream) {
                    Ok(()) => {}
                    Err(BlockError::EndOfStream) => return Ok(0),
                    Err(e) => return Err(e.into()),
                }
                self.block.decompress().map_err(io::Error::from)?;
                self.offset += self.block.block_size()
                    .unwrap_or(self.block.uncompressed_size() + 26) as u64;
                self.contents_offset = 0;
                self.block_loaded = true;
            }
            if self.contents_offset < self.block.uncompressed_size() {
                let read_bytes = min(self.block.uncompressed_size() - self.contents_offset,
                    buf.len());
                buf[..read_bytes].copy_from_slice(&self.block.uncompressed_data()
                    [self.contents_offset..self.contents_offset + read_bytes]);
                self.contents_offset += read_bytes;
                return Ok(read_bytes);
            }
            self.block_loaded = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use super::super::write::Writer;

    // Writes each slice as its own block and returns the stream with block start offsets.
    fn write_blocks(blocks: &[&[u8]]) -> (Vec<u8>, Vec<u64>) {
        let mut buffer = Vec::new();
        let mut offsets = Vec::new();
        for block in blocks {
            offsets.push(buffer.len() as u64);
            let mut writer = Writer::from_stream(&mut buffer, 6);
            writer.write(block).unwrap();
            writer.flush().unwrap();
        }
        let mut writer = Writer::from_stream(&mut buffer, 6);
        writer.write_empty().unwrap();
        writer.flush().unwrap();
        (buffer, offsets)
    }

    fn read_all<R: Read>(reader: &mut R) -> Vec<u8> {
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        contents
    }

    #[test]
    fn consecutive_roundtrip() {
        let (buffer, _) = write_blocks(&[&b"first block, "[..], &b"second block, "[..],
            &b"third"[..]]);
        let mut reader = ConsecutiveReader::from_stream(Cursor::new(buffer));
        assert_eq!(read_all(&mut reader), b"first block, second block, third");
    }

    #[test]
    fn chunks_select_parts_of_blocks() {
        let (buffer, offsets) = write_blocks(&[&b"0123456789"[..], &b"abcdefghij"[..]]);
        let stream = SharedStream::new(Cursor::new(buffer));

        // Within a single block.
        let chunks = vec![Chunk::new(VirtualOffset::new(offsets[0], 2),
            VirtualOffset::new(offsets[0], 7))];
        let mut reader = ChunksReader::new(stream.clone(), chunks);
        assert_eq!(read_all(&mut reader), b"23456");

        // Across a block boundary.
        reader.set_chunks(vec![Chunk::new(VirtualOffset::new(offsets[0], 8),
            VirtualOffset::new(offsets[1], 3))]);
        assert_eq!(read_all(&mut reader), b"89abc");

        // Two chunks inside the same block are decompressed once and concatenated.
        reader.set_chunks(vec![
            Chunk::new(VirtualOffset::new(offsets[1], 0), VirtualOffset::new(offsets[1], 2)),
            Chunk::new(VirtualOffset::new(offsets[1], 5), VirtualOffset::new(offsets[1], 8)),
        ]);
        assert_eq!(read_all(&mut reader), b"abfgh");
    }

    #[test]
    fn consecutive_mode_reads_to_end() {
        let (buffer, offsets) = write_blocks(&[&b"skip me "[..], &b"keep me"[..]]);
        let stream = SharedStream::new(Cursor::new(buffer));
        let mut reader = ChunksReader::new(stream, Vec::new());
        assert_eq!(read_all(&mut reader), b"");

        reader.make_consecutive(VirtualOffset::new(offsets[1], 0));
        assert_eq!(read_all(&mut reader), b"keep me");
    }

    #[test]
    fn clones_read_independently() {
        let (buffer, offsets) = write_blocks(&[&b"one shared "[..], &b"underlying stream"[..]]);
        let stream = SharedStream::new(Cursor::new(buffer));

        let mut first = ChunksReader::new(stream.clone(), Vec::new());
        first.make_consecutive(VirtualOffset::new(offsets[0], 0));
        let mut second = ChunksReader::new(stream, Vec::new());
        second.make_consecutive(VirtualOffset::new(offsets[0], 4));

        // Interleaved reads through the same underlying stream.
        let mut buf1 = [0_u8; 4];
        let mut buf2 = [0_u8; 4];
        first.read_exact(&mut buf1).unwrap();
        second.read_exact(&mut buf2).unwrap();
        assert_eq!(&buf1, b"one ");
        assert_eq!(&buf2, b"shar");
        first.read_exact(&mut buf1).unwrap();
        assert_eq!(&buf1, b"shar");
    }

    #[test]
    fn virtual_position_tracks_reads() {
        let (buffer, offsets) = write_blocks(&[&b"positioned"[..]]);
        let stream = SharedStream::new(Cursor::new(buffer));
        let mut reader = ChunksReader::new(stream, Vec::new());
        reader.make_consecutive(VirtualOffset::new(offsets[0], 0));
        assert_eq!(reader.virtual_position(), VirtualOffset::new(offsets[0], 0));

        let mut buf = [0_u8; 6];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.virtual_position(), VirtualOffset::new(offsets[0], 6));
    }
}
