//! # ReplIDB Codec
//!
//! Aligned binary parcel encoding for ReplIDB sync packets.
//!
//! A parcel is a flat little-endian byte buffer with a few layout rules:
//! - Integers are written at their natural width (`u32`/`i32`, `u64`/`i64`/`f64`)
//! - Strings and byte vectors are a `u32` length followed by the bytes,
//!   zero-padded so the whole field is a multiple of eight bytes
//! - `u64` vectors are a `u32` count followed by the elements, padded the same way
//! - Packets pad to an absolute eight-byte boundary at the end of each section
//!
//! Writers are created with the exact length a packet computed with the
//! helpers in [`len`], and both writers and readers keep a sticky error flag
//! so decoders can check for failure once per section.
//!
//! ## Usage
//!
//! ```
//! use replidb_codec::{len, ParcelReader, ParcelWriter};
//!
//! let mut writer = ParcelWriter::with_length(len::U32 + len::string("peer"));
//! writer.write_u32(106);
//! writer.write_string("peer");
//! let bytes = writer.finish().unwrap();
//!
//! let mut reader = ParcelReader::new(&bytes);
//! assert_eq!(reader.read_u32(), 106);
//! assert_eq!(reader.read_string("peer", 64), "peer");
//! assert!(reader.status().is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod len;
mod reader;
mod value;
mod writer;

pub use error::{CodecError, CodecResult};
pub use reader::{ParcelReader, MAX_BYTES_LENGTH};
pub use value::Value;
pub use writer::ParcelWriter;
