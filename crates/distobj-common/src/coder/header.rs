//! The fixed-size archive header.
//!
//! Four big-endian `u32`s: format version, then the number of classes,
//! objects and pointer-table entries the body introduces.

use bytes::BufMut;

use crate::protocol::error::{DistobjError, Result};

pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u32,
    pub classes: u32,
    pub objects: u32,
    pub pointers: u32,
}

impl WireHeader {
    /// Header with the current version and zero counts, written before the
    /// counts are known.
    pub fn placeholder() -> Self {
        Self {
            version: FORMAT_VERSION,
            classes: 0,
            objects: 0,
            pointers: 0,
        }
    }

    /// Writes the header at `pos`, overwriting bytes already there and
    /// growing `buf` as needed.
    pub fn write_at(&self, buf: &mut Vec<u8>, pos: usize) {
        let mut encoded = [0u8; HEADER_LEN];
        let mut cursor = &mut encoded[..];
        cursor.put_u32(self.version);
        cursor.put_u32(self.classes);
        cursor.put_u32(self.objects);
        cursor.put_u32(self.pointers);

        if buf.len() < pos + HEADER_LEN {
            buf.resize(pos + HEADER_LEN, 0);
        }
        buf[pos..pos + HEADER_LEN].copy_from_slice(&encoded);
    }

    pub fn read_at(buf: &[u8], pos: usize) -> Result<Self> {
        let available = buf.len().saturating_sub(pos);
        if available < HEADER_LEN {
            return Err(DistobjError::TruncatedStream {
                offset: pos,
                needed: HEADER_LEN,
                available,
            });
        }
        let word = |i: usize| {
            let start = pos + i * 4;
            u32::from_be_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]])
        };
        Ok(Self {
            version: word(0),
            classes: word(1),
            objects: word(2),
            pointers: word(3),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_overwrite_in_place() {
        let mut buf = vec![0xAA; 3];
        WireHeader::placeholder().write_at(&mut buf, 3);
        assert_eq!(buf.len(), 3 + HEADER_LEN);

        let real = WireHeader {
            version: FORMAT_VERSION,
            classes: 2,
            objects: 5,
            pointers: 1,
        };
        real.write_at(&mut buf, 3);
        assert_eq!(buf.len(), 3 + HEADER_LEN);
        assert_eq!(&buf[..3], &[0xAA; 3]);
        assert_eq!(WireHeader::read_at(&buf, 3).unwrap(), real);
    }

    #[test]
    fn test_short_header_is_truncated() {
        let err = WireHeader::read_at(&[0u8; 10], 0).unwrap_err();
        assert!(matches!(err, DistobjError::TruncatedStream { needed: 16, available: 10, .. }));
    }
}
