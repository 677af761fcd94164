//! Dynamic cell value type.

use crate::error::CodecError;
use crate::len;
use crate::reader::{ParcelReader, MAX_BYTES_LENGTH};
use crate::writer::ParcelWriter;

/// A dynamically typed value.
///
/// Used for predicate operands in query fingerprints and for cells of
/// remote query result rows. On the wire a value is a `u32` type tag
/// followed by its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Signed integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Boolean value.
    Bool(bool),
}

impl Value {
    const TAG_NULL: u32 = 0;
    const TAG_INTEGER: u32 = 1;
    const TAG_REAL: u32 = 2;
    const TAG_TEXT: u32 = 3;
    const TAG_BYTES: u32 = 4;
    const TAG_BOOL: u32 = 5;

    /// Wire type tag of this value.
    pub fn tag(&self) -> u32 {
        match self {
            Value::Null => Self::TAG_NULL,
            Value::Integer(_) => Self::TAG_INTEGER,
            Value::Real(_) => Self::TAG_REAL,
            Value::Text(_) => Self::TAG_TEXT,
            Value::Bytes(_) => Self::TAG_BYTES,
            Value::Bool(_) => Self::TAG_BOOL,
        }
    }

    /// Encoded length in bytes.
    pub fn parcel_len(&self) -> usize {
        len::U32
            + match self {
                Value::Null => 0,
                Value::Integer(_) | Value::Real(_) => len::U64,
                Value::Text(s) => len::string(s),
                Value::Bytes(b) => len::bytes(b.len()),
                Value::Bool(_) => len::U32,
            }
    }

    /// Write this value to a parcel.
    pub fn write_to(&self, writer: &mut ParcelWriter) {
        writer.write_u32(self.tag());
        match self {
            Value::Null => {}
            Value::Integer(n) => writer.write_i64(*n),
            Value::Real(f) => writer.write_f64(*f),
            Value::Text(s) => writer.write_string(s),
            Value::Bytes(b) => writer.write_bytes(b),
            Value::Bool(b) => writer.write_bool(*b),
        }
    }

    /// Read a value from a parcel. Returns `Value::Null` and flags the reader
    /// on failure.
    pub fn read_from(reader: &mut ParcelReader<'_>) -> Value {
        let tag = reader.read_u32();
        if reader.is_error() {
            return Value::Null;
        }
        match tag {
            Self::TAG_NULL => Value::Null,
            Self::TAG_INTEGER => Value::Integer(reader.read_i64()),
            Self::TAG_REAL => Value::Real(reader.read_f64()),
            Self::TAG_TEXT => Value::Text(reader.read_string("text value", MAX_BYTES_LENGTH)),
            Self::TAG_BYTES => Value::Bytes(reader.read_bytes("bytes value", MAX_BYTES_LENGTH)),
            Self::TAG_BOOL => Value::Bool(reader.read_bool()),
            other => {
                reader.set_error(CodecError::InvalidTag(other));
                Value::Null
            }
        }
    }

    /// Returns true if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the integer value if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text value if this is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
