//! Parcel writer.

use crate::error::{CodecError, CodecResult};
use crate::len;

/// A fixed-length, little-endian parcel writer.
///
/// The writer is created with the exact length the caller computed for the
/// packet. Writes past that length do not panic: they record an
/// [`CodecError::Overflow`] in a sticky error slot and every later write is
/// ignored. Callers check [`ParcelWriter::is_error`] (or [`ParcelWriter::status`])
/// once per logical section instead of after every write.
#[derive(Debug)]
pub struct ParcelWriter {
    buffer: Vec<u8>,
    capacity: usize,
    error: Option<CodecError>,
}

impl ParcelWriter {
    /// Create a writer for a parcel of exactly `len` bytes.
    pub fn with_length(len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(len),
            capacity: len,
            error: None,
        }
    }

    /// Returns true once any write has failed.
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

    /// Record an error raised by the caller, for example a failed bound check.
    ///
    /// The first error wins; later ones are ignored.
    pub fn set_error(&mut self, error: CodecError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes still available before the declared length is reached.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    /// Get a reference to the bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Write a `u32`.
    pub fn write_u32(&mut self, value: u32) {
        if self.reserve(len::U32) {
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Write an `i32`.
    pub fn write_i32(&mut self, value: i32) {
        if self.reserve(len::U32) {
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Write a `u64`.
    pub fn write_u64(&mut self, value: u64) {
        if self.reserve(len::U64) {
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Write an `i64`.
    pub fn write_i64(&mut self, value: i64) {
        if self.reserve(len::U64) {
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Write an `f64` as its IEEE-754 bit pattern.
    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// Write a bool as a `u32`.
    pub fn write_bool(&mut self, value: bool) {
        self.write_u32(u32::from(value));
    }

    /// Write a length-prefixed byte vector padded to eight bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let Some(count) = self.checked_count(bytes.len()) else {
            return;
        };
        let step = len::bytes(bytes.len());
        if self.reserve(step) {
            self.buffer.extend_from_slice(&count.to_le_bytes());
            self.buffer.extend_from_slice(bytes);
            self.pad(step - len::U32 - bytes.len());
        }
    }

    /// Write a length-prefixed UTF-8 string padded to eight bytes.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write a length-prefixed `u64` vector padded to eight bytes.
    pub fn write_u64_vec(&mut self, values: &[u64]) {
        let Some(count) = self.checked_count(values.len()) else {
            return;
        };
        let step = len::u64_vec(values.len());
        if self.reserve(step) {
            self.buffer.extend_from_slice(&count.to_le_bytes());
            for value in values {
                self.buffer.extend_from_slice(&value.to_le_bytes());
            }
            self.pad(step - len::U32 - len::U64 * values.len());
        }
    }

    /// Pad with zeros up to the next absolute eight-byte boundary.
    pub fn align8(&mut self) {
        let padding = len::align8(self.buffer.len()) - self.buffer.len();
        if padding > 0 && self.reserve(padding) {
            self.pad(padding);
        }
    }

    /// Consume the writer and return the parcel bytes.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if any write failed, or
    /// [`CodecError::LengthMismatch`] if fewer bytes were written than declared.
    pub fn finish(self) -> CodecResult<Vec<u8>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.buffer.len() != self.capacity {
            return Err(CodecError::LengthMismatch {
                declared: self.capacity,
                written: self.buffer.len(),
            });
        }
        Ok(self.buffer)
    }

    fn reserve(&mut self, needed: usize) -> bool {
        if self.error.is_some() {
            return false;
        }
        let remaining = self.remaining();
        if needed > remaining {
            self.error = Some(CodecError::Overflow { needed, remaining });
            return false;
        }
        true
    }

    fn checked_count(&mut self, count: usize) -> Option<u32> {
        match u32::try_from(count) {
            Ok(count) => Some(count),
            Err(_) => {
                self.set_error(CodecError::LengthExceeded {
                    what: "collection",
                    len: count,
                    max: u32::MAX as usize,
                });
                None
            }
        }
    }

    fn pad(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_little_endian_integers() {
        let mut writer = ParcelWriter::with_length(12);
        writer.write_u32(0x0102_0304);
        writer.write_u64(1);
        let bytes = writer.finish().unwrap();
        assert_eq!(&bytes[..4], &[4, 3, 2, 1]);
        assert_eq!(&bytes[4..], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn pads_collections_to_eight() {
        let mut writer = ParcelWriter::with_length(len::string("hello"));
        writer.write_string("hello");
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &[5, 0, 0, 0]);
        assert_eq!(&bytes[4..9], b"hello");
        assert!(bytes[9..].iter().all(|b| *b == 0));
    }

    #[test]
    fn overflow_is_sticky() {
        let mut writer = ParcelWriter::with_length(4);
        writer.write_u64(7);
        assert!(writer.is_error());
        writer.write_u32(1);
        assert_eq!(writer.position(), 0);
        assert!(matches!(
            writer.finish(),
            Err(CodecError::Overflow {
                needed: 8,
                remaining: 4
            })
        ));
    }

    #[test]
    fn short_write_is_length_mismatch() {
        let mut writer = ParcelWriter::with_length(16);
        writer.write_u32(1);
        assert_eq!(
            writer.finish(),
            Err(CodecError::LengthMismatch {
                declared: 16,
                written: 4
            })
        );
    }

    #[test]
    fn align_pads_absolute_position() {
        let mut writer = ParcelWriter::with_length(8);
        writer.write_u32(9);
        writer.align8();
        writer.align8();
        assert_eq!(writer.finish().unwrap().len(), 8);
    }
}
