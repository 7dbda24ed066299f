//! Bgzip (BGZF) writer.
//!
//! Produces streams the [readers](../read/index.html) consume: a sequence of independent
//! compressed blocks followed by an empty end-of-file block.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::write::DeflateEncoder;

use super::{MAX_BLOCK_SIZE, COMPRESSED_BLOCK_SIZE};

/// Bgzip writer that compresses and writes blocks with uncompressed size at most
/// `MAX_BLOCK_SIZE = 65536`.
pub struct Writer<W: Write> {
    stream: W,
    compressed_buffer: Vec<u8>,
    compression: Compression,
}

impl Writer<File> {
    /// Creates a bgzip writer from a path and a compression level (at most 9).
    pub fn from_path<P: AsRef<Path>>(path: P, level: u8) -> io::Result<Self> {
        let stream = File::create(path)
            .map_err(|e| io::Error::new(e.kind(), format!("failed to create bgzip file: {}", e)))?;
        Ok(Writer::from_stream(stream, level))
    }
}

impl<W: Write> Writer<W> {
    /// Creates a bgzip writer from a stream and a compression level (at most 9).
    pub fn from_stream(stream: W, level: u8) -> Self {
        assert!(level <= 9, "compression level should be at most 9");
        Writer {
            stream,
            compressed_buffer: vec![0; COMPRESSED_BLOCK_SIZE],
            compression: Compression::new(level as u32),
        }
    }

    /// Writes an empty block. A bgzip file ends with one, marking the end of the stream.
    pub fn write_empty(&mut self) -> io::Result<()> {
        const EMPTY_BLOCK: &[u8; 28] = &[0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
            0xff, 0x06, 0x00, 0x42, 0x43, 0x02, 0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00];
        self.stream.write_all(EMPTY_BLOCK)
    }

    /// Compresses all slices in `contents` and writes them as a single block.
    ///
    /// The summed length of `contents` should be at most `MAX_BLOCK_SIZE = 65536`.
    /// If the compressed representation does not fit in one block, the function returns a
    /// `WriteZero` error.
    pub fn write_several(&mut self, contents: &[&[u8]]) -> io::Result<()> {
        let contents_size: usize = contents.iter().map(|slice| slice.len()).sum();
        if contents_size == 0 {
            return self.write_empty();
        }
        assert!(contents_size <= MAX_BLOCK_SIZE, "cannot write a block: uncompressed size {} > {}",
            contents_size, MAX_BLOCK_SIZE);

        let mut crc_hasher = crc32fast::Hasher::new();
        let bytes_written = {
            let mut encoder = DeflateEncoder::new(&mut self.compressed_buffer[..],
                self.compression);
            for subcontents in contents.iter() {
                encoder.write_all(subcontents)?;
                crc_hasher.update(subcontents);
            }
            let remaining_buf = encoder.finish()?;
            COMPRESSED_BLOCK_SIZE - remaining_buf.len()
        };

        const BLOCK_HEADER: &[u8; 16] = &[
             31, 139,   8,   4,  // ID1, ID2, compression method, flags
              0,   0,   0,   0,  // modification time
              0, 255,   6,   0,  // extra flags, OS (255 = unknown), extra length (2 bytes)
             66,  67,   2,   0]; // SI1, SI2, subfield length (2 bytes)
        self.stream.write_all(BLOCK_HEADER)?;
        let block_size = bytes_written + 26;
        self.stream.write_u16::<LittleEndian>((block_size - 1) as u16)?;

        self.stream.write_all(&self.compressed_buffer[..bytes_written])?;
        self.stream.write_u32::<LittleEndian>(crc_hasher.finalize())?;
        self.stream.write_u32::<LittleEndian>(contents_size as u32)
    }

    /// Compresses `contents` and writes them as a single block. Same as
    /// [write_several](#method.write_several) with a single slice.
    pub fn write(&mut self, contents: &[u8]) -> io::Result<()> {
        self.write_several(&[contents])
    }

    /// Flushes the inner stream.
    pub fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    /// Consumes the writer and returns the inner stream. Does not write the end-of-file
    /// block, use [write_empty](#method.write_empty) before if the stream is complete.
    pub fn take_stream(self) -> W {
        self.stream
    }
}
