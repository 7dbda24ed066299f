//! Container header: the SAM text and the reference sequence table.

use std::collections::HashMap;
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Metadata of an open container: the raw SAM header text and the reference name/length
/// table used to validate queries and to resolve symbolic region strings.
///
/// The header is parsed once when the container is opened and never changes afterwards.
#[derive(Clone)]
pub struct Header {
    text: Vec<u8>,
    ref_names: Vec<String>,
    ref_lengths: Vec<u32>,
    ref_ids: HashMap<String, u32>,
}

impl Header {
    /// Reads the binary header from the uncompressed contents of a BAM stream.
    pub(crate) fn from_bam<R: Read>(stream: &mut R) -> Result<Header> {
        let mut magic = [0_u8; 4];
        stream.read_exact(&mut magic)
            .map_err(|e| Error::Open(format!("failed to read header: {}", e)))?;
        if magic != [b'B', b'A', b'M', 1] {
            return Err(Error::Open("input is not in BAM format".to_string()));
        }

        let l_text = stream.read_i32::<LittleEndian>()
            .map_err(|e| Error::Open(format!("failed to read header: {}", e)))?;
        if l_text < 0 {
            return Err(Error::Open("negative header text length".to_string()));
        }
        let mut text = vec![0_u8; l_text as usize];
        stream.read_exact(&mut text)
            .map_err(|e| Error::Open(format!("failed to read header: {}", e)))?;

        let n_ref = stream.read_i32::<LittleEndian>()
            .map_err(|e| Error::Open(format!("failed to read header: {}", e)))?;
        if n_ref < 0 {
            return Err(Error::Open("negative reference count".to_string()));
        }
        let mut ref_names = Vec::with_capacity(n_ref as usize);
        let mut ref_lengths = Vec::with_capacity(n_ref as usize);
        let mut ref_ids = HashMap::with_capacity(n_ref as usize);
        for i in 0..n_ref {
            let l_name = stream.read_i32::<LittleEndian>()
                .map_err(|e| Error::Open(format!("failed to read header: {}", e)))?;
            if l_name <= 0 {
                return Err(Error::Open("reference name length must be positive".to_string()));
            }
            let mut name = vec![0_u8; l_name as usize];
            stream.read_exact(&mut name)
                .map_err(|e| Error::Open(format!("failed to read header: {}", e)))?;
            name.pop();
            let name = String::from_utf8(name)
                .map_err(|_| Error::Open("reference name is not valid UTF-8".to_string()))?;

            let l_ref = stream.read_i32::<LittleEndian>()
                .map_err(|e| Error::Open(format!("failed to read header: {}", e)))?;
            if l_ref < 0 {
                return Err(Error::Open(
                    format!("reference {} has a negative length", name)));
            }
            ref_ids.insert(name.clone(), i as u32);
            ref_names.push(name);
            ref_lengths.push(l_ref as u32);
        }
        Ok(Header { text, ref_names, ref_lengths, ref_ids })
    }

    /// Number of reference sequences.
    pub fn n_references(&self) -> usize {
        self.ref_names.len()
    }

    /// Name of the reference with `ref_id` (0-based).
    pub fn reference_name(&self, ref_id: usize) -> Option<&str> {
        self.ref_names.get(ref_id).map(String::as_str)
    }

    /// Length of the reference with `ref_id` (0-based).
    pub fn reference_len(&self, ref_id: usize) -> Option<u32> {
        self.ref_lengths.get(ref_id).copied()
    }

    /// 0-based id of the reference called `name`.
    pub fn reference_id(&self, name: &str) -> Option<u32> {
        self.ref_ids.get(name).copied()
    }

    /// Raw SAM header text, as stored in the container.
    pub fn text(&self) -> &[u8] {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use byteorder::WriteBytesExt;

    use super::*;

    fn sample_header_bytes() -> Vec<u8> {
        let text = b"@HD\tVN:1.6\tSO:coordinate\n";
        let mut raw = Vec::new();
        raw.extend_from_slice(b"BAM\x01");
        raw.write_i32::<LittleEndian>(text.len() as i32).unwrap();
        raw.extend_from_slice(text);
        raw.write_i32::<LittleEndian>(2).unwrap();
        for &(name, len) in &[("chr1", 2_000_000_u32), ("chr2", 500_000)] {
            raw.write_i32::<LittleEndian>(name.len() as i32 + 1).unwrap();
            raw.extend_from_slice(name.as_bytes());
            raw.push(0);
            raw.write_i32::<LittleEndian>(len as i32).unwrap();
        }
        raw
    }

    #[test]
    fn parses_reference_table() {
        let header = Header::from_bam(&mut Cursor::new(sample_header_bytes())).unwrap();
        assert_eq!(header.n_references(), 2);
        assert_eq!(header.reference_name(0), Some("chr1"));
        assert_eq!(header.reference_len(0), Some(2_000_000));
        assert_eq!(header.reference_id("chr2"), Some(1));
        assert_eq!(header.reference_id("chrM"), None);
        assert_eq!(header.reference_name(2), None);
        assert!(header.text().starts_with(b"@HD"));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut raw = sample_header_bytes();
        raw[0] = b'C';
        match Header::from_bam(&mut Cursor::new(raw)) {
            Err(Error::Open(_)) => {},
            other => panic!("expected Open error, got {:?}", other.map(|_| ())),
        }
    }
}
