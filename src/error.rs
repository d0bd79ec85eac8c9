//! Error types for sealvault.
//!
//! Every variant is a distinct failure mode of the seal, the barrier, or the
//! storage underneath it. Messages are intentionally minimal: they say *what*
//! failed without revealing key material or plaintext.

use std::fmt;
use std::io;

use thiserror::Error;

/// The single error type for all sealvault operations.
#[derive(Debug, Error)]
pub enum SealvaultError {
    /// Caller-supplied parameters are out of range or malformed.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A seal configuration already exists on the backend.
    #[error("already initialized")]
    AlreadyInitialized,

    /// The backend carries no seal configuration yet.
    #[error("not initialized")]
    NotInitialized,

    /// Fewer distinct shares than the threshold were supplied.
    #[error("insufficient shares: {provided} provided, {required} required")]
    InsufficientShares { provided: usize, required: usize },

    /// Shares disagree with each other or are structurally invalid.
    #[error("corrupt share: {0}")]
    CorruptShare(String),

    /// Ciphertext failed its integrity check. Covers tampering, a wrong
    /// key, and an unknown keyring term.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The operation needs key material and the barrier is sealed.
    #[error("barrier is sealed")]
    Sealed,

    /// No entry exists at the given path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The storage backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The committed cluster configuration differs from the expected one.
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    /// A key had the wrong length for the cipher.
    #[error("invalid key")]
    InvalidKey,

    /// The AEAD seal operation failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// HKDF expansion failed.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The system random number generator failed.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// A persisted document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SealvaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SealvaultError>;

// ---------------------------------------------------------------------------
// Backend errors
// ---------------------------------------------------------------------------

/// Whether a backend failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Timeouts, dropped connections, a missing leader.
    Transient,
    /// Disk full, malformed on-disk structure, rejected request.
    Permanent,
}

/// A storage failure, classified for the retry policy.
#[derive(Debug, Clone, Error)]
#[error("backend error ({kind}): {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::transient(err.to_string()),
            _ => Self::permanent(err.to_string()),
        }
    }
}

impl From<io::Error> for SealvaultError {
    fn from(err: io::Error) -> Self {
        Self::Backend(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let timeout: BackendError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(timeout.is_transient());

        let denied: BackendError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert!(!denied.is_transient());
    }

    #[test]
    fn test_messages_do_not_echo_payloads() {
        assert_eq!(SealvaultError::AuthenticationFailed.to_string(), "authentication failed");
        assert_eq!(SealvaultError::Sealed.to_string(), "barrier is sealed");
    }
}
