//! Item payload compression.

use crate::error::{ProtocolError, ProtocolResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Upper bound on the decompressed size of one item payload.
pub const MAX_DECOMPRESSED_LEN: usize = 30 * 1024 * 1024;

/// Compression algorithm tag carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CompressAlgorithm {
    /// zlib (RFC 1950).
    Zlib = 1,
}

impl CompressAlgorithm {
    /// Decode an algorithm from its wire tag.
    pub fn from_u32(value: u32) -> ProtocolResult<Self> {
        match value {
            1 => Ok(CompressAlgorithm::Zlib),
            other => Err(ProtocolError::not_supported(format!(
                "compression algorithm {other}"
            ))),
        }
    }

    /// Compress `data`.
    pub fn compress(self, data: &[u8]) -> ProtocolResult<Vec<u8>> {
        match self {
            CompressAlgorithm::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| ProtocolError::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| ProtocolError::Compression(e.to_string()))
            }
        }
    }

    /// Decompress `data`, which must expand to exactly `src_len` bytes.
    pub fn decompress(self, data: &[u8], src_len: usize) -> ProtocolResult<Vec<u8>> {
        if src_len > MAX_DECOMPRESSED_LEN {
            return Err(ProtocolError::LengthError(format!(
                "decompressed length {src_len} exceeds {MAX_DECOMPRESSED_LEN}"
            )));
        }
        match self {
            CompressAlgorithm::Zlib => {
                let mut out = Vec::with_capacity(src_len);
                // Read one byte past the declared length to detect overruns.
                ZlibDecoder::new(data)
                    .take(src_len as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| ProtocolError::Compression(e.to_string()))?;
                if out.len() != src_len {
                    return Err(ProtocolError::LengthError(format!(
                        "decompressed {} bytes, declared {src_len}",
                        out.len()
                    )));
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_roundtrip() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbb".repeat(10);
        let packed = CompressAlgorithm::Zlib.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(
            CompressAlgorithm::Zlib.decompress(&packed, data.len()).unwrap(),
            data
        );
    }

    #[test]
    fn declared_length_must_match() {
        let packed = CompressAlgorithm::Zlib.compress(b"hello").unwrap();
        assert!(matches!(
            CompressAlgorithm::Zlib.decompress(&packed, 3),
            Err(ProtocolError::LengthError(_))
        ));
        assert!(matches!(
            CompressAlgorithm::Zlib.decompress(&packed, 9),
            Err(ProtocolError::LengthError(_))
        ));
    }

    #[test]
    fn unknown_algorithm() {
        assert!(CompressAlgorithm::from_u32(0).is_err());
        assert_eq!(CompressAlgorithm::from_u32(1).unwrap(), CompressAlgorithm::Zlib);
    }
}
