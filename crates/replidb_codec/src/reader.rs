//! Parcel reader.

use crate::error::{CodecError, CodecResult};
use crate::len;

/// Maximum allowed byte/string length.
/// Prevents allocation-based DoS from untrusted input.
pub const MAX_BYTES_LENGTH: usize = 256 * 1024 * 1024;

/// A little-endian parcel reader with a sticky error flag.
///
/// Reads never panic. The first failed read records an error, returns a
/// default value, and turns every later read into a no-op, so a decoder can
/// read a whole section and check [`ParcelReader::status`] once.
#[derive(Debug)]
pub struct ParcelReader<'a> {
    data: &'a [u8],
    pos: usize,
    error: Option<CodecError>,
}

impl<'a> ParcelReader<'a> {
    /// Create a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            error: None,
        }
    }

    /// Returns true once any read has failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns the first recorded error, if any.
    pub fn status(&self) -> CodecResult<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record an error raised by the caller. The first error wins.
    pub fn set_error(&mut self, error: CodecError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read a `u32`.
    pub fn read_u32(&mut self) -> u32 {
        self.take_array::<4>().map(u32::from_le_bytes).unwrap_or(0)
    }

    /// Read an `i32`.
    pub fn read_i32(&mut self) -> i32 {
        self.take_array::<4>().map(i32::from_le_bytes).unwrap_or(0)
    }

    /// Read a `u64`.
    pub fn read_u64(&mut self) -> u64 {
        self.take_array::<8>().map(u64::from_le_bytes).unwrap_or(0)
    }

    /// Read an `i64`.
    pub fn read_i64(&mut self) -> i64 {
        self.take_array::<8>().map(i64::from_le_bytes).unwrap_or(0)
    }

    /// Read an `f64` from its IEEE-754 bit pattern.
    pub fn read_f64(&mut self) -> f64 {
        f64::from_bits(self.read_u64())
    }

    /// Read a bool written as a `u32`.
    pub fn read_bool(&mut self) -> bool {
        self.read_u32() != 0
    }

    /// Read a length-prefixed byte vector of at most `max` bytes.
    pub fn read_bytes(&mut self, what: &'static str, max: usize) -> Vec<u8> {
        let count = self.read_u32() as usize;
        if self.is_error() {
            return Vec::new();
        }
        if count > max {
            self.set_error(CodecError::LengthExceeded {
                what,
                len: count,
                max,
            });
            return Vec::new();
        }
        let step = len::bytes(count) - len::U32;
        match self.take(step) {
            Some(slice) => slice[..count].to_vec(),
            None => Vec::new(),
        }
    }

    /// Read a length-prefixed UTF-8 string of at most `max` bytes.
    pub fn read_string(&mut self, what: &'static str, max: usize) -> String {
        let bytes = self.read_bytes(what, max);
        match String::from_utf8(bytes) {
            Ok(value) => value,
            Err(_) => {
                self.set_error(CodecError::InvalidUtf8);
                String::new()
            }
        }
    }

    /// Read a length-prefixed `u64` vector of at most `max` elements.
    pub fn read_u64_vec(&mut self, what: &'static str, max: usize) -> Vec<u64> {
        let count = self.read_u32() as usize;
        if self.is_error() {
            return Vec::new();
        }
        if count > max {
            self.set_error(CodecError::LengthExceeded {
                what,
                len: count,
                max,
            });
            return Vec::new();
        }
        let step = len::u64_vec(count) - len::U32;
        let Some(slice) = self.take(step) else {
            return Vec::new();
        };
        slice[..count * len::U64]
            .chunks_exact(len::U64)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect()
    }

    /// Skip padding up to the next absolute eight-byte boundary.
    pub fn align8(&mut self) {
        let padding = len::align8(self.pos) - self.pos;
        if padding > 0 {
            let _ = self.take(padding);
        }
    }

    /// Discard every unread byte.
    pub fn skip_to_end(&mut self) {
        self.pos = self.data.len();
    }

    fn take(&mut self, needed: usize) -> Option<&'a [u8]> {
        if self.error.is_some() {
            return None;
        }
        let remaining = self.remaining();
        if needed > remaining {
            self.error = Some(CodecError::Truncated { needed, remaining });
            return None;
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Some(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.take(N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(slice);
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ParcelWriter;

    #[test]
    fn reads_back_written_fields() {
        let total = len::U32 + len::U64 + len::string("peer") + len::u64_vec(2);
        let mut writer = ParcelWriter::with_length(total);
        writer.write_i32(-3);
        writer.write_u64(u64::MAX);
        writer.write_string("peer");
        writer.write_u64_vec(&[5, 6]);
        let bytes = writer.finish().unwrap();

        let mut reader = ParcelReader::new(&bytes);
        assert_eq!(reader.read_i32(), -3);
        assert_eq!(reader.read_u64(), u64::MAX);
        assert_eq!(reader.read_string("peer", 64), "peer");
        assert_eq!(reader.read_u64_vec("reserved", 8), vec![5, 6]);
        assert!(reader.status().is_ok());
        assert!(reader.is_empty());
    }

    #[test]
    fn truncated_input_is_sticky() {
        let mut reader = ParcelReader::new(&[1, 0]);
        assert_eq!(reader.read_u32(), 0);
        assert!(reader.is_error());
        assert_eq!(reader.read_u32(), 0);
        assert!(matches!(
            reader.status(),
            Err(CodecError::Truncated {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn oversized_collection_is_rejected_before_reading() {
        let mut writer = ParcelWriter::with_length(len::bytes(10));
        writer.write_bytes(&[7u8; 10]);
        let bytes = writer.finish().unwrap();

        let mut reader = ParcelReader::new(&bytes);
        assert!(reader.read_bytes("key", 4).is_empty());
        assert_eq!(
            reader.status(),
            Err(CodecError::LengthExceeded {
                what: "key",
                len: 10,
                max: 4
            })
        );
    }

    #[test]
    fn declared_length_longer_than_input_fails() {
        let bytes = 100u32.to_le_bytes();
        let mut reader = ParcelReader::new(&bytes);
        reader.read_bytes("value", MAX_BYTES_LENGTH);
        assert!(matches!(reader.status(), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn invalid_utf8_string() {
        let mut writer = ParcelWriter::with_length(len::bytes(2));
        writer.write_bytes(&[0xff, 0xfe]);
        let bytes = writer.finish().unwrap();
        let mut reader = ParcelReader::new(&bytes);
        reader.read_string("name", 16);
        assert_eq!(reader.status(), Err(CodecError::InvalidUtf8));
    }
}
