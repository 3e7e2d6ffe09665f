// src/utils/errors.rs
//! Error types for session recording
//!
//! Every fallible operation in the crate returns [`AuditError`]. Variants
//! carry plain strings so that a stream can keep the first terminal error
//! and hand a copy back from both `emit` and `complete`.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors raised by streams, readers and storage backends
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    /// Bad stream parameters, rejected before any I/O
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session identifier is not printable or not safe as a storage key
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// Stream was already completed or aborted
    #[error("stream is closed")]
    StreamClosed,

    /// Stream hit a terminal failure earlier
    #[error("stream failed: {0}")]
    StreamFailed(String),

    /// Retryable backend failure (network hiccup, interrupted I/O)
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Part upload kept failing after the retry budget was spent
    #[error("upload of part {part_number} failed after {attempts} attempts: {reason}")]
    TransientUploadFailure {
        part_number: u32,
        attempts: u32,
        reason: String,
    },

    /// Storage medium cannot be reached
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An upload for this session is already in progress
    #[error("upload already exists: {0}")]
    AlreadyExists(String),

    /// Upload was already finalized
    #[error("upload already completed: {0}")]
    AlreadyCompleted(String),

    /// Manifest references a part the backend does not hold
    #[error("incomplete upload: {0}")]
    IncompleteUpload(String),

    /// No completed artifact (or upload) with this key
    #[error("not found: {0}")]
    NotFound(String),

    /// Part or frame failed structural validation
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl AuditError {
    /// Whether a retry at the backend-adapter boundary may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditError::Transient(_))
    }

    /// Whether this error ends the recording for good
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                AuditError::Transient(err.to_string())
            }
            ErrorKind::NotFound => AuditError::NotFound(err.to_string()),
            ErrorKind::UnexpectedEof => AuditError::CorruptFrame(err.to_string()),
            _ => AuditError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::Serialization(err.to_string())
    }
}
