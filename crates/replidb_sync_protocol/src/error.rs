//! Error types for the sync protocol.

use replidb_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Signed status codes carried in acknowledgement packets.
///
/// A receiver reports the outcome of a request with one of these in the
/// `recv_code` field of its ack. Zero means success.
pub mod status {
    /// Success.
    pub const OK: i32 = 0;
    /// Malformed or empty input.
    pub const INVALID_ARGS: i32 = -1001;
    /// Backpressure or shutdown in progress.
    pub const BUSY: i32 = -1002;
    /// Target object torn down.
    pub const OBJECT_KILLED: i32 = -1003;
    /// Peer speaks a newer protocol version.
    pub const VERSION_NOT_SUPPORTED: i32 = -1004;
    /// Wire data violates a length invariant.
    pub const LENGTH_ERROR: i32 = -1005;
    /// Wire data could not be parsed.
    pub const PARSE_FAIL: i32 = -1006;
    /// Subscription admission control rejected the request.
    pub const MAX_LIMITS_EXCEEDED: i32 = -1007;
    /// Protocol sequencing violation.
    pub const INTERNAL_ERROR: i32 = -1008;
    /// Message or feature not supported.
    pub const NOT_SUPPORTED: i32 = -1009;
    /// Timed out waiting for the peer.
    pub const TIMEOUT: i32 = -1010;
    /// Storage collaborator failed.
    pub const STORAGE_ERROR: i32 = -1011;
    /// Transport collaborator failed.
    pub const TRANSPORT_ERROR: i32 = -1012;
}

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet contents violate a bound or are inconsistent.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Peer speaks a newer protocol version than this build decodes.
    #[error("version {version} not supported (current {current})")]
    VersionNotSupported {
        /// Version found on the wire.
        version: u32,
        /// Highest version this build understands.
        current: u32,
    },

    /// Wire data violates a length invariant.
    #[error("length error: {0}")]
    LengthError(String),

    /// Wire data could not be parsed.
    #[error("parse failed: {0}")]
    ParseFail(String),

    /// Message id or type has no codec.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Compressing or decompressing item data failed.
    #[error("compression error: {0}")]
    Compression(String),
}

impl ProtocolError {
    /// Create an invalid arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    /// Create a parse failure error.
    pub fn parse_fail(message: impl Into<String>) -> Self {
        Self::ParseFail(message.into())
    }

    /// Create a not supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    /// Wire status code for this error.
    pub fn status_code(&self) -> i32 {
        match self {
            ProtocolError::InvalidArgs(_) => status::INVALID_ARGS,
            ProtocolError::VersionNotSupported { .. } => status::VERSION_NOT_SUPPORTED,
            ProtocolError::LengthError(_) => status::LENGTH_ERROR,
            ProtocolError::ParseFail(_) | ProtocolError::Compression(_) => status::PARSE_FAIL,
            ProtocolError::NotSupported(_) => status::NOT_SUPPORTED,
        }
    }
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        if err.is_length_error() {
            ProtocolError::LengthError(err.to_string())
        } else {
            ProtocolError::ParseFail(err.to_string())
        }
    }
}
