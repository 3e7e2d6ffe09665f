// src/recording/observer.rs
//! Caller-supplied hooks for upload progress
//!
//! Streams report part and completion outcomes to an [`UploadObserver`].
//! Callbacks run on the task driving the stream (inside `emit` or
//! `complete`), so they must be cheap and must not block.

use crate::backend::{ArtifactRef, PartRef};
use crate::recording::event::SessionId;
use crate::utils::errors::AuditError;

/// Receives upload progress for every stream it is attached to
pub trait UploadObserver: Send + Sync {
    /// A part was durably stored by the backend
    fn on_part_uploaded(&self, _session_id: &SessionId, _part: &PartRef) {}

    /// A part upload failed for good; the stream is now failed
    fn on_part_failed(&self, _session_id: &SessionId, _part_number: u32, _error: &AuditError) {}

    /// The recording was finalized
    fn on_stream_completed(&self, _session_id: &SessionId, _artifact: &ArtifactRef) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}
