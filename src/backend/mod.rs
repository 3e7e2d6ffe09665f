// src/backend/mod.rs
//! Storage backends for session recordings
//!
//! A backend stores one artifact per session and accepts it as a
//! multipart upload, so a recording can be pushed while the session is
//! still running:
//!
//! - **Memory**: process-local maps, used by tests and single-node setups
//! - **Filesystem**: parts and artifacts as files under a base directory
//! - **Retry**: wrapper retrying transient part upload failures
//!
//! # Lifecycle
//!
//! ```text
//! create_upload → upload_part* (any order, concurrent) → complete_upload → download
//!       │
//!       └──────→ abort_upload (discards parts, never touches completed artifacts)
//! ```

pub mod filesystem;
pub mod memory;
pub mod retry;

use crate::recording::event::SessionId;
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

// Re-export commonly used types
pub use filesystem::FileBackend;
pub use memory::MemoryBackend;
pub use retry::{RetryPolicy, RetryingBackend};

/// Handle to an in-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHandle {
    /// Session the artifact will be stored under
    pub session_id: SessionId,

    /// Backend-unique upload identifier
    pub upload_id: String,

    /// When the upload was created
    pub initiated: DateTime<Utc>,
}

impl UploadHandle {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            upload_id: ulid::Ulid::new().to_string(),
            initiated: Utc::now(),
        }
    }
}

/// Receipt for one stored part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRef {
    /// Part number, starting at 1
    pub part_number: u32,

    /// Stored size in bytes
    pub size: u64,

    /// Content tag of the stored bytes
    pub etag: String,
}

impl PartRef {
    pub fn for_payload(part_number: u32, payload: &[u8]) -> Self {
        Self {
            part_number,
            size: payload.len() as u64,
            etag: format!("{:08x}", crc32fast::hash(payload)),
        }
    }
}

/// Receipt for a finalized recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub session_id: SessionId,
    pub size: u64,
    pub parts: usize,
}

/// Storage capability every recording medium implements
///
/// Implementations are shared by all concurrent streams and must be safe
/// for concurrent use. `upload_part` in particular is called in parallel
/// for the same upload with distinct part numbers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start a multipart upload for a session
    async fn create_upload(&self, session_id: &SessionId) -> Result<UploadHandle>;

    /// Store one part of an in-progress upload
    async fn upload_part(
        &self,
        upload: &UploadHandle,
        part_number: u32,
        payload: Bytes,
    ) -> Result<PartRef>;

    /// Parts stored so far, ordered by part number
    async fn list_parts(&self, upload: &UploadHandle) -> Result<Vec<PartRef>>;

    /// Assemble the given parts, in the given order, into the session artifact
    async fn complete_upload(&self, upload: &UploadHandle, parts: &[PartRef])
        -> Result<ArtifactRef>;

    /// Discard an upload and its parts. Idempotent.
    async fn abort_upload(&self, upload: &UploadHandle) -> Result<()>;

    /// Store a whole recording in one shot
    async fn upload_artifact(&self, session_id: &SessionId, payload: Bytes) -> Result<ArtifactRef>;

    /// Copy the session artifact into `dest`, returning the bytes written
    async fn download(
        &self,
        session_id: &SessionId,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;

    /// Smallest size accepted for every part except the last
    fn min_part_size(&self) -> usize {
        0
    }
}

/// Check a completion manifest against the parts a backend holds
///
/// Part numbers must be strictly increasing, every entry must match a
/// stored part and every part but the last must reach `min_part_size`.
pub(crate) fn verify_manifest<'a>(
    manifest: &[PartRef],
    min_part_size: usize,
    stored: impl Fn(u32) -> Option<&'a PartRef>,
) -> Result<()> {
    use crate::utils::errors::AuditError;

    let mut previous = 0u32;
    for (position, part) in manifest.iter().enumerate() {
        let last = position + 1 == manifest.len();
        if !last && part.size < min_part_size as u64 {
            return Err(AuditError::IncompleteUpload(format!(
                "part {} is {} bytes, below the minimum of {}",
                part.part_number, part.size, min_part_size
            )));
        }

        if part.part_number <= previous {
            return Err(AuditError::IncompleteUpload(format!(
                "part {} listed out of order after part {}",
                part.part_number, previous
            )));
        }
        previous = part.part_number;

        match stored(part.part_number) {
            Some(held) if held.etag == part.etag && held.size == part.size => {}
            Some(_) => {
                return Err(AuditError::IncompleteUpload(format!(
                    "part {} does not match stored content",
                    part.part_number
                )))
            }
            None => {
                return Err(AuditError::IncompleteUpload(format!(
                    "part {} is missing",
                    part.part_number
                )))
            }
        }
    }

    Ok(())
}
