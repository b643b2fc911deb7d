//! Error types shared by all WalB components.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` type for WalB operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error classification.
///
/// This is what crosses the protocol boundary in a rejection reply;
/// the receiving side uses it to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Checksum mismatch, bad magic, or misaligned fields.
    InvalidFormat,
    /// Requested action is illegal in the current state-machine state.
    BadState,
    /// Missing volume, diff, or server record.
    NotFound,
    /// Underlying read or write failed.
    Io,
    /// Socket or operation exceeded its deadline.
    Timeout,
    /// The wdev reported log-ring overflow.
    Overflow,
    /// Greeting mismatch or stream-control misuse.
    ProtocolMismatch,
    /// Force-quit or per-volume cancellation observed.
    Cancelled,
    /// Invariant violation; a bug.
    Internal,
}

impl ErrorKind {
    /// Whether a client should retry after backoff on this kind of failure.
    ///
    /// `BadState` is retriable because most bad states are transient
    /// (a volume mid-transition); the handler that must not be retried
    /// replies with an explicit rejection instead.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Io | Self::Timeout | Self::BadState)
    }

    /// Short name used in log lines and wire replies.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "InvalidFormat",
            Self::BadState => "BadState",
            Self::NotFound => "NotFound",
            Self::Io => "IoError",
            Self::Timeout => "Timeout",
            Self::Overflow => "Overflow",
            Self::ProtocolMismatch => "ProtocolMismatch",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during WalB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Checksum mismatch, bad magic, or misaligned fields.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Requested action is illegal in the current state.
    #[error("bad state: {0}")]
    BadState(String),

    /// Missing volume, diff, or server record.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket or operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The wdev reported log-ring overflow. Irrecoverable without reset.
    #[error("log overflow: {0}")]
    Overflow(String),

    /// Greeting mismatch or stream-control misuse.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Force-quit or per-volume cancellation observed.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation; a bug.
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify this error for the wire.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::BadState(_) => ErrorKind::BadState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Io,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) | Self::Config(_) => ErrorKind::Internal,
        }
    }

    /// Whether a client should retry after backoff.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Shorthand for an `InvalidFormat` error.
    #[must_use]
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Shorthand for a `BadState` error.
    #[must_use]
    pub fn bad_state(msg: impl Into<String>) -> Self {
        Self::BadState(msg.into())
    }

    /// Shorthand for a `NotFound` error.
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Shorthand for an `Internal` error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::invalid_format("x").kind(), ErrorKind::InvalidFormat);
        assert_eq!(Error::bad_state("x").kind(), ErrorKind::BadState);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_retriable() {
        assert!(Error::Timeout("t".into()).is_retriable());
        assert!(Error::bad_state("transient").is_retriable());
        assert!(!Error::invalid_format("broken").is_retriable());
        assert!(!Error::Overflow("ring".into()).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
    }

    #[test]
    fn test_kind_roundtrip_serde() {
        let kind = ErrorKind::ProtocolMismatch;
        let encoded = bincode::serialize(&kind).unwrap();
        let decoded: ErrorKind = bincode::deserialize(&encoded).unwrap();
        assert_eq!(kind, decoded);
    }
}
