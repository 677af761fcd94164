//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while writing or reading a parcel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A write would exceed the length the parcel was created with.
    #[error("parcel overflow: {needed} bytes needed, {remaining} remaining")]
    Overflow {
        /// Bytes the write needed.
        needed: usize,
        /// Bytes left in the parcel.
        remaining: usize,
    },

    /// A read ran past the end of the input.
    #[error("parcel truncated: {needed} bytes needed, {remaining} remaining")]
    Truncated {
        /// Bytes the read needed.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// A declared collection length violates its bound.
    #[error("{what} length {len} exceeds limit {max}")]
    LengthExceeded {
        /// What was being read.
        what: &'static str,
        /// Declared length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The bytes written differ from the declared parcel length.
    #[error("parcel length mismatch: declared {declared}, written {written}")]
    LengthMismatch {
        /// Length the parcel was created with.
        declared: usize,
        /// Bytes actually written.
        written: usize,
    },

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Unknown value type tag.
    #[error("invalid value tag: {0}")]
    InvalidTag(u32),

    /// A field held a value outside its valid range.
    #[error("invalid field: {message}")]
    InvalidField {
        /// Description of the invalid field.
        message: String,
    },
}

impl CodecError {
    /// Create an invalid field error.
    pub fn invalid_field(message: impl Into<String>) -> Self {
        Self::InvalidField {
            message: message.into(),
        }
    }

    /// Returns true if the error comes from a length or bound violation
    /// rather than malformed content.
    pub fn is_length_error(&self) -> bool {
        matches!(
            self,
            CodecError::Overflow { .. }
                | CodecError::Truncated { .. }
                | CodecError::LengthExceeded { .. }
                | CodecError::LengthMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_errors_are_classified() {
        assert!(CodecError::Truncated {
            needed: 8,
            remaining: 2
        }
        .is_length_error());
        assert!(!CodecError::InvalidUtf8.is_length_error());
        assert!(!CodecError::invalid_field("mode").is_length_error());
    }

    #[test]
    fn error_display() {
        let err = CodecError::LengthExceeded {
            what: "condition key",
            len: 300,
            max: 128,
        };
        assert_eq!(err.to_string(), "condition key length 300 exceeds limit 128");
    }
}
