// src/backend/memory.rs
//! In-memory backend
//!
//! Keeps parts and artifacts in process memory. Session transitions
//! (create, complete, abort) go through one lock so they are atomic with
//! respect to each other; part uploads only touch their own upload entry.

use crate::backend::{verify_manifest, ArtifactRef, Backend, PartRef, UploadHandle};
use crate::recording::event::SessionId;
use crate::utils::errors::{AuditError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

struct MemoryUpload {
    parts: BTreeMap<u32, (PartRef, Bytes)>,
}

#[derive(Default)]
struct SessionIndex {
    /// session -> upload id of the in-progress upload
    active: HashMap<SessionId, String>,
}

struct StoredArtifact {
    /// Upload that produced the artifact, `None` for whole-artifact writes
    upload_id: Option<String>,
    payload: Bytes,
}

/// Backend holding everything in memory
#[derive(Default)]
pub struct MemoryBackend {
    uploads: DashMap<String, MemoryUpload>,
    sessions: Mutex<SessionIndex>,
    artifacts: DashMap<SessionId, StoredArtifact>,
    min_part_size: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every non-final part to be at least `size` bytes,
    /// mimicking object store limits
    pub fn with_min_part_size(mut self, size: usize) -> Self {
        self.min_part_size = size;
        self
    }

    /// Number of uploads currently in progress
    pub fn active_uploads(&self) -> usize {
        self.sessions.lock().active.len()
    }

    /// Whether a completed artifact exists for the session
    pub fn has_artifact(&self, session_id: &SessionId) -> bool {
        self.artifacts.contains_key(session_id)
    }

    fn is_completed(&self, upload: &UploadHandle) -> bool {
        self.artifacts
            .get(&upload.session_id)
            .is_some_and(|a| a.upload_id.as_deref() == Some(upload.upload_id.as_str()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_upload(&self, session_id: &SessionId) -> Result<UploadHandle> {
        let mut sessions = self.sessions.lock();

        if sessions.active.contains_key(session_id) {
            return Err(AuditError::AlreadyExists(format!(
                "upload for session {} is in progress",
                session_id
            )));
        }
        if self.artifacts.contains_key(session_id) {
            return Err(AuditError::AlreadyExists(format!(
                "recording for session {} already exists",
                session_id
            )));
        }

        let handle = UploadHandle::new(session_id.clone());
        self.uploads.insert(
            handle.upload_id.clone(),
            MemoryUpload {
                parts: BTreeMap::new(),
            },
        );
        sessions
            .active
            .insert(session_id.clone(), handle.upload_id.clone());

        debug!("Created memory upload {} for session {}", handle.upload_id, session_id);
        Ok(handle)
    }

    async fn upload_part(
        &self,
        upload: &UploadHandle,
        part_number: u32,
        payload: Bytes,
    ) -> Result<PartRef> {
        if part_number == 0 {
            return Err(AuditError::InvalidConfig("part numbers start at 1".to_string()));
        }

        let mut entry = self
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| AuditError::NotFound(format!("upload {}", upload.upload_id)))?;

        let part = PartRef::for_payload(part_number, &payload);
        entry.parts.insert(part_number, (part.clone(), payload));

        Ok(part)
    }

    async fn list_parts(&self, upload: &UploadHandle) -> Result<Vec<PartRef>> {
        let entry = self
            .uploads
            .get(&upload.upload_id)
            .ok_or_else(|| AuditError::NotFound(format!("upload {}", upload.upload_id)))?;

        Ok(entry.parts.values().map(|(part, _)| part.clone()).collect())
    }

    async fn complete_upload(
        &self,
        upload: &UploadHandle,
        parts: &[PartRef],
    ) -> Result<ArtifactRef> {
        let mut sessions = self.sessions.lock();

        if self.is_completed(upload) {
            return Err(AuditError::AlreadyCompleted(format!("upload {}", upload.upload_id)));
        }
        if sessions.active.get(&upload.session_id) != Some(&upload.upload_id) {
            return Err(AuditError::NotFound(format!("upload {}", upload.upload_id)));
        }

        let artifact = {
            let entry = self
                .uploads
                .get(&upload.upload_id)
                .ok_or_else(|| AuditError::NotFound(format!("upload {}", upload.upload_id)))?;

            verify_manifest(parts, self.min_part_size, |n| {
                entry.parts.get(&n).map(|(part, _)| part)
            })?;

            let size: u64 = parts.iter().map(|p| p.size).sum();
            let mut artifact = BytesMut::with_capacity(size as usize);
            for part in parts {
                if let Some((_, payload)) = entry.parts.get(&part.part_number) {
                    artifact.extend_from_slice(payload);
                }
            }
            artifact.freeze()
        };

        let size = artifact.len() as u64;
        self.artifacts.insert(
            upload.session_id.clone(),
            StoredArtifact {
                upload_id: Some(upload.upload_id.clone()),
                payload: artifact,
            },
        );
        self.uploads.remove(&upload.upload_id);
        sessions.active.remove(&upload.session_id);

        debug!(
            "Completed memory upload {} ({} parts, {} bytes)",
            upload.upload_id,
            parts.len(),
            size
        );

        Ok(ArtifactRef {
            session_id: upload.session_id.clone(),
            size,
            parts: parts.len(),
        })
    }

    async fn abort_upload(&self, upload: &UploadHandle) -> Result<()> {
        let mut sessions = self.sessions.lock();

        if self.is_completed(upload) {
            return Ok(());
        }
        if sessions.active.get(&upload.session_id) == Some(&upload.upload_id) {
            sessions.active.remove(&upload.session_id);
        }
        if self.uploads.remove(&upload.upload_id).is_some() {
            debug!("Aborted memory upload {}", upload.upload_id);
        }

        Ok(())
    }

    async fn upload_artifact(&self, session_id: &SessionId, payload: Bytes) -> Result<ArtifactRef> {
        let sessions = self.sessions.lock();

        if sessions.active.contains_key(session_id) || self.artifacts.contains_key(session_id) {
            return Err(AuditError::AlreadyExists(format!("session {}", session_id)));
        }

        let size = payload.len() as u64;
        self.artifacts.insert(
            session_id.clone(),
            StoredArtifact {
                upload_id: None,
                payload,
            },
        );

        Ok(ArtifactRef {
            session_id: session_id.clone(),
            size,
            parts: 1,
        })
    }

    async fn download(
        &self,
        session_id: &SessionId,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let artifact = self
            .artifacts
            .get(session_id)
            .map(|entry| entry.value().payload.clone())
            .ok_or_else(|| AuditError::NotFound(format!("recording for session {}", session_id)))?;

        dest.write_all(&artifact).await?;
        dest.flush().await?;

        Ok(artifact.len() as u64)
    }

    fn min_part_size(&self) -> usize {
        self.min_part_size
    }
}
