//! Bgzip files (BGZF): block loading, inflation and writing.
//!
//! A bgzip file is a sequence of small gzip blocks, each at most 64 KiB of uncompressed
//! contents, so that a [virtual offset](../index/struct.VirtualOffset.html) can address any
//! byte of the uncompressed stream. [read](read/index.html) contains the block readers,
//! [write](write/index.html) the block writer used to produce such files.

pub mod read;
pub mod write;

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;
use thiserror::Error;

/// Biggest possible uncompressed contents of a single block.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Biggest possible compressed size of a single block (the 26 bytes are the fixed header
/// and footer).
pub const COMPRESSED_BLOCK_SIZE: usize = MAX_BLOCK_SIZE - 26;

/// Error produced while reading a bgzip block.
///
/// `EndOfStream` means the stream ended exactly on a block boundary and is the normal end
/// condition; anything mid-block is `Corrupted` or `Io`.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("no more blocks")]
    EndOfStream,
    #[error("corrupted bgzip block: {0}")]
    Corrupted(String),
    #[error("input/output error: {0}")]
    Io(#[from] io::Error),
}

impl From<BlockError> for io::Error {
    fn from(e: BlockError) -> io::Error {
        match e {
            BlockError::EndOfStream =>
                io::Error::new(io::ErrorKind::UnexpectedEof, "no more bgzip blocks"),
            BlockError::Corrupted(s) =>
                io::Error::new(io::ErrorKind::InvalidData, format!("corrupted bgzip block: {}", s)),
            BlockError::Io(e) => e,
        }
    }
}

fn as_u16(buffer: &[u8], start: usize) -> u16 {
    buffer[start] as u16 + ((buffer[start + 1] as u16) << 8)
}

/// A single bgzip block.
///
/// [load](#method.load) reads the compressed payload from a stream,
/// [decompress](#method.decompress) inflates it and verifies the CRC32 and the stored
/// uncompressed size. Blocks are reused between reads to avoid reallocation.
pub struct Block {
    offset: Option<u64>,
    block_size: Option<usize>,
    compressed: Vec<u8>,
    uncompressed: Vec<u8>,
    crc32: u32,
    uncompressed_len: u32,
}

impl Block {
    pub fn new() -> Self {
        Block {
            offset: None,
            block_size: None,
            compressed: Vec::with_capacity(COMPRESSED_BLOCK_SIZE),
            uncompressed: Vec::with_capacity(MAX_BLOCK_SIZE),
            crc32: 0,
            uncompressed_len: 0,
        }
    }

    /// Clears the block without freeing its buffers.
    pub fn reset(&mut self) {
        self.offset = None;
        self.block_size = None;
        self.compressed.clear();
        self.uncompressed.clear();
        self.crc32 = 0;
        self.uncompressed_len = 0;
    }

    /// Reads the compressed contents of the next block from `stream`. `offset` is the file
    /// offset the stream is positioned at, remembered for
    /// [virtual offset](../index/struct.VirtualOffset.html) bookkeeping.
    ///
    /// Does not inflate anything, so a caller may hold a stream lock only across this call.
    /// Returns [EndOfStream](enum.BlockError.html#variant.EndOfStream) if the stream ends
    /// before the block starts.
    pub fn load<R: Read>(&mut self, offset: Option<u64>, stream: &mut R)
            -> Result<(), BlockError> {
        self.reset();
        let mut header = [0_u8; 12];
        match stream.read(&mut header[..1])? {
            0 => return Err(BlockError::EndOfStream),
            _ => stream.read_exact(&mut header[1..])
                .map_err(|e| BlockError::Corrupted(format!("truncated header ({})", e)))?,
        }
        let extra_len = Block::analyze_header(&header)? as usize;
        let mut extra_fields = vec![0_u8; extra_len];
        stream.read_exact(&mut extra_fields)
            .map_err(|e| BlockError::Corrupted(format!("truncated header ({})", e)))?;
        let block_size = Block::analyze_extra_fields(&extra_fields)? as usize + 1;
        if block_size < 12 + extra_len + 8 {
            return Err(BlockError::Corrupted(format!("declared block size {} too small",
                block_size)));
        }

        let payload_len = block_size - 12 - extra_len - 8;
        self.compressed.resize(payload_len, 0);
        stream.read_exact(&mut self.compressed)
            .map_err(|e| BlockError::Corrupted(format!("truncated contents ({})", e)))?;
        self.crc32 = stream.read_u32::<LittleEndian>()
            .map_err(|e| BlockError::Corrupted(format!("truncated footer ({})", e)))?;
        self.uncompressed_len = stream.read_u32::<LittleEndian>()
            .map_err(|e| BlockError::Corrupted(format!("truncated footer ({})", e)))?;
        if self.uncompressed_len as usize > MAX_BLOCK_SIZE {
            return Err(BlockError::Corrupted(format!("declared contents size {} > {}",
                self.uncompressed_len, MAX_BLOCK_SIZE)));
        }
        self.offset = offset;
        self.block_size = Some(block_size);
        Ok(())
    }

    /// Inflates the loaded payload and verifies the checksum and the declared size.
    pub fn decompress(&mut self) -> Result<(), BlockError> {
        self.uncompressed.clear();
        let mut decoder = DeflateDecoder::new(&self.compressed[..]);
        decoder.read_to_end(&mut self.uncompressed)
            .map_err(|e| BlockError::Corrupted(format!("could not inflate ({})", e)))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.uncompressed);
        let obs_crc32 = hasher.finalize();
        if obs_crc32 != self.crc32 {
            return Err(BlockError::Corrupted(format!(
                "CRC mismatch: expected {:#x}, observed {:#x}", self.crc32, obs_crc32)));
        }
        if self.uncompressed.len() != self.uncompressed_len as usize {
            return Err(BlockError::Corrupted(format!(
                "uncompressed size mismatch: expected {}, observed {}",
                self.uncompressed_len, self.uncompressed.len())));
        }
        Ok(())
    }

    /// Analyzes the 12 header bytes of a block. Returns XLEN, the total length of the
    /// extra subfields.
    fn analyze_header(header: &[u8]) -> Result<u16, BlockError> {
        if header[0] != 31 || header[1] != 139 || header[2] != 8 || header[3] != 4 {
            return Err(BlockError::Corrupted("invalid gzip header".to_string()));
        }
        Ok(as_u16(header, 10))
    }

    /// Analyzes the extra subfields following the header. Returns BSIZE, the total block
    /// size minus one.
    fn analyze_extra_fields(extra_fields: &[u8]) -> Result<u16, BlockError> {
        let mut i = 0;
        while i + 3 < extra_fields.len() {
            let subfield_id1 = extra_fields[i];
            let subfield_id2 = extra_fields[i + 1];
            let subfield_len = as_u16(extra_fields, i + 2);
            if subfield_id1 == 66 && subfield_id2 == 67 && subfield_len == 2 {
                if i + 5 >= extra_fields.len() {
                    return Err(BlockError::Corrupted("truncated BC subfield".to_string()));
                }
                return Ok(as_u16(extra_fields, i + 4));
            }
            i += 4 + subfield_len as usize;
        }
        Err(BlockError::Corrupted("no BC subfield with the block size".to_string()))
    }

    /// File offset of the block, if known.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Full compressed size of the block, header and footer included.
    pub fn block_size(&self) -> Option<usize> {
        self.block_size
    }

    /// Uncompressed contents, empty before [decompress](#method.decompress).
    pub fn uncompressed_data(&self) -> &[u8] {
        &self.uncompressed
    }

    /// Size of the uncompressed contents.
    pub fn uncompressed_size(&self) -> usize {
        self.uncompressed.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use super::write::Writer;

    fn compress(contents: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut writer = Writer::from_stream(&mut buffer, 6);
        writer.write(contents).unwrap();
        writer.flush().unwrap();
        buffer
    }

    #[test]
    fn block_roundtrip() {
        let contents: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&contents);

        let mut block = Block::new();
        block.load(Some(0), &mut Cursor::new(&compressed)).unwrap();
        assert_eq!(block.block_size(), Some(compressed.len()));
        block.decompress().unwrap();
        assert_eq!(block.uncompressed_data(), &contents[..]);
    }

    #[test]
    fn empty_block_roundtrip() {
        let mut buffer = Vec::new();
        let mut writer = Writer::from_stream(&mut buffer, 6);
        writer.write_empty().unwrap();
        writer.flush().unwrap();

        let mut block = Block::new();
        block.load(Some(0), &mut Cursor::new(&buffer)).unwrap();
        block.decompress().unwrap();
        assert_eq!(block.uncompressed_size(), 0);
    }

    #[test]
    fn end_of_stream_on_empty_input() {
        let mut block = Block::new();
        match block.load(None, &mut Cursor::new(&[] as &[u8])) {
            Err(BlockError::EndOfStream) => {},
            other => panic!("expected EndOfStream, got {:?}", other),
        }
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let contents = b"indexed genomic interval iteration".to_vec();
        let mut compressed = compress(&contents);
        // Flip one bit inside the deflate payload.
        let middle = compressed.len() / 2;
        compressed[middle] ^= 0x40;

        let mut block = Block::new();
        block.load(Some(0), &mut Cursor::new(&compressed)).unwrap();
        match block.decompress() {
            Err(BlockError::Corrupted(_)) => {},
            other => panic!("expected Corrupted, got {:?}", other),
        }
    }

    #[test]
    fn truncated_block_is_corrupted() {
        let compressed = compress(b"truncate me");
        let mut block = Block::new();
        match block.load(Some(0), &mut Cursor::new(&compressed[..compressed.len() - 5])) {
            Err(BlockError::Corrupted(_)) => {},
            other => panic!("expected Corrupted, got {:?}", other),
        }
    }
}
