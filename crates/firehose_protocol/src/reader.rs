//! Bounds-checked binary reader.
//!
//! CAR archives are walked with [`ByteReader`]. Out-of-range reads return
//! [`ProtocolError::TruncatedInput`] instead of panicking.

use unsigned_varint::{decode, encode};

use crate::error::{ProtocolError, ProtocolResult};

/// A cursor over a byte slice with checked reads.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset from the start of the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> ProtocolResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::TruncatedInput {
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read an unsigned varint as used by multiformats and CAR.
    ///
    /// Truncated or non-minimal encodings are rejected, as are values that
    /// need more than 63 bits.
    pub fn read_varint(&mut self) -> ProtocolResult<u64> {
        let rest = &self.data[self.pos..];
        let (value, tail) =
            decode::u64(rest).map_err(|err| ProtocolError::InvalidVarint {
                message: err.to_string(),
            })?;
        self.pos += rest.len() - tail.len();
        Ok(value)
    }

    /// Read a varint length and convert it to `usize`.
    pub fn read_length(&mut self) -> ProtocolResult<usize> {
        let len = self.read_varint()?;
        usize::try_from(len).map_err(|_| ProtocolError::InvalidVarint {
            message: format!("length {len} does not fit in memory"),
        })
    }
}

/// Append `value` as an unsigned varint.
pub fn encode_varint(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(encode::u64(value, &mut encode::u64_buffer()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_varint(&mut buf, value);
        buf
    }

    #[test]
    fn varint_single_byte_values() {
        assert_eq!(varint(0), vec![0x00]);
        assert_eq!(varint(0x71), vec![0x71]);
        assert_eq!(varint(127), vec![0x7f]);
    }

    #[test]
    fn varint_multi_byte_values() {
        assert_eq!(varint(128), vec![0x80, 0x01]);
        assert_eq!(varint(300), vec![0xac, 0x02]);

        let mut reader = ByteReader::new(&[0xac, 0x02, 0xff]);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn varint_rejects_values_past_63_bits() {
        let bytes = varint(u64::MAX);
        assert_eq!(bytes.len(), 10);
        assert!(matches!(
            ByteReader::new(&bytes).read_varint(),
            Err(ProtocolError::InvalidVarint { .. })
        ));
        assert_eq!(
            ByteReader::new(&varint(i64::MAX as u64)).read_varint().unwrap(),
            i64::MAX as u64
        );
    }

    #[test]
    fn varint_rejects_truncated_and_overlong() {
        assert!(matches!(
            ByteReader::new(&[0x80]).read_varint(),
            Err(ProtocolError::InvalidVarint { .. })
        ));
        assert!(matches!(
            ByteReader::new(&[0x81, 0x00]).read_varint(),
            Err(ProtocolError::InvalidVarint { .. })
        ));
    }

    #[test]
    fn read_past_end_is_an_error() {
        let mut reader = ByteReader::new(&[1, 2, 3]);
        assert_eq!(reader.read_bytes(2).unwrap(), &[1, 2]);
        assert_eq!(
            reader.read_bytes(2),
            Err(ProtocolError::TruncatedInput {
                needed: 2,
                available: 1
            })
        );
        // A failed read does not move the cursor.
        assert_eq!(reader.read_bytes(1).unwrap(), &[3]);
        assert!(reader.is_empty());
        assert!(reader.read_bytes(1).is_err());
        assert!(matches!(
            reader.read_varint(),
            Err(ProtocolError::InvalidVarint { .. })
        ));
    }
}
