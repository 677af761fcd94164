//! Error types for the sync engine.

use replidb_sync_protocol::{status, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Malformed or empty input at the API boundary.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Backpressure or shutdown in progress. Retry later.
    #[error("busy: {0}")]
    Busy(String),

    /// The coordinator or the peer context has been torn down.
    #[error("object killed")]
    ObjectKilled,

    /// Peer speaks a newer protocol version.
    #[error("protocol version not supported")]
    VersionNotSupported,

    /// Wire data violates a length invariant.
    #[error("length error: {0}")]
    LengthError(String),

    /// Wire data could not be parsed.
    #[error("parse failed: {0}")]
    ParseFail(String),

    /// Subscription admission control rejected the request.
    #[error("subscription limit exceeded: {0}")]
    MaxLimitsExceeded(String),

    /// Protocol sequencing violation.
    #[error("internal error: {0}")]
    InternalError(String),

    /// Message or feature not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Communicator failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Storage collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Timed out waiting for the peer.
    #[error("operation timed out")]
    Timeout,

    /// Lookup found nothing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Creates an invalid arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Busy(_) | SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Wire status code reported in ack packets.
    pub fn code(&self) -> i32 {
        match self {
            SyncError::InvalidArgs(_) => status::INVALID_ARGS,
            SyncError::Busy(_) => status::BUSY,
            SyncError::ObjectKilled => status::OBJECT_KILLED,
            SyncError::VersionNotSupported => status::VERSION_NOT_SUPPORTED,
            SyncError::LengthError(_) => status::LENGTH_ERROR,
            SyncError::ParseFail(_) => status::PARSE_FAIL,
            SyncError::MaxLimitsExceeded(_) => status::MAX_LIMITS_EXCEEDED,
            SyncError::InternalError(_) | SyncError::NotFound(_) => status::INTERNAL_ERROR,
            SyncError::NotSupported(_) => status::NOT_SUPPORTED,
            SyncError::Timeout => status::TIMEOUT,
            SyncError::Storage(_) => status::STORAGE_ERROR,
            SyncError::Transport { .. } => status::TRANSPORT_ERROR,
        }
    }

    /// Error for a status code received from a peer. `None` for success.
    pub fn from_code(code: i32) -> Option<Self> {
        let remote = || format!("peer reported {code}");
        Some(match code {
            status::OK => return None,
            status::INVALID_ARGS => SyncError::InvalidArgs(remote()),
            status::BUSY => SyncError::Busy(remote()),
            status::OBJECT_KILLED => SyncError::ObjectKilled,
            status::VERSION_NOT_SUPPORTED => SyncError::VersionNotSupported,
            status::LENGTH_ERROR => SyncError::LengthError(remote()),
            status::PARSE_FAIL => SyncError::ParseFail(remote()),
            status::MAX_LIMITS_EXCEEDED => SyncError::MaxLimitsExceeded(remote()),
            status::NOT_SUPPORTED => SyncError::NotSupported(remote()),
            status::TIMEOUT => SyncError::Timeout,
            status::STORAGE_ERROR => SyncError::Storage(remote()),
            status::TRANSPORT_ERROR => SyncError::transport_retryable(remote()),
            _ => SyncError::InternalError(remote()),
        })
    }

    /// Converts a received status code into a result.
    pub fn check_code(code: i32) -> SyncResult<()> {
        match Self::from_code(code) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidArgs(m) => SyncError::InvalidArgs(m),
            ProtocolError::VersionNotSupported { .. } => SyncError::VersionNotSupported,
            ProtocolError::LengthError(m) => SyncError::LengthError(m),
            ProtocolError::ParseFail(m) | ProtocolError::Compression(m) => SyncError::ParseFail(m),
            ProtocolError::NotSupported(m) => SyncError::NotSupported(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("link lost").is_retryable());
        assert!(!SyncError::transport_fatal("peer rejected").is_retryable());
        assert!(SyncError::busy("queue full").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::ObjectKilled.is_retryable());
        assert!(!SyncError::MaxLimitsExceeded("per peer".into()).is_retryable());
    }

    #[test]
    fn codes_roundtrip() {
        let errors = [
            SyncError::invalid_args("x"),
            SyncError::busy("x"),
            SyncError::ObjectKilled,
            SyncError::VersionNotSupported,
            SyncError::LengthError("x".into()),
            SyncError::ParseFail("x".into()),
            SyncError::MaxLimitsExceeded("x".into()),
            SyncError::internal("x"),
            SyncError::NotSupported("x".into()),
            SyncError::Timeout,
            SyncError::storage("x"),
            SyncError::transport_retryable("x"),
        ];
        for err in errors {
            let back = SyncError::from_code(err.code()).unwrap();
            assert_eq!(back.code(), err.code());
            assert!(err.code() < 0);
        }
        assert_eq!(SyncError::from_code(status::OK), None);
        assert!(SyncError::check_code(status::OK).is_ok());
        assert!(matches!(
            SyncError::check_code(-42),
            Err(SyncError::InternalError(_))
        ));
    }

    #[test]
    fn protocol_errors_map_to_taxonomy() {
        let err: SyncError = ProtocolError::VersionNotSupported {
            version: 107,
            current: 106,
        }
        .into();
        assert_eq!(err, SyncError::VersionNotSupported);

        let err: SyncError = ProtocolError::Compression("bad stream".into()).into();
        assert_eq!(err.code(), status::PARSE_FAIL);
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::ObjectKilled.to_string(), "object killed");
        let err = SyncError::MaxLimitsExceeded("per peer".into());
        assert!(err.to_string().contains("per peer"));
    }
}
