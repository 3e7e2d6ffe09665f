// src/backend/filesystem.rs
//! Local filesystem backend
//!
//! Layout under the base directory:
//!
//! ```text
//! base_dir/
//!   uploads/{session_id}/{upload_id}/00000001.part   # in-progress parts
//!   recordings/{session_id}.rec                      # completed artifacts
//!   recordings/{session_id}.upload                   # id of the finalizing upload
//! ```
//!
//! Creating `uploads/{session_id}` is the in-progress lock for a session.
//! Parts and artifacts are written to a temporary name and renamed into
//! place, so readers never observe a partially written file.
//!
//! Finalization writes the `.upload` marker before publishing, and the
//! rename of the artifact is its last step. An upload is completed only
//! when the marker names it and the artifact exists. A marker without an
//! artifact is left by an interrupted finalization and `abort_upload`
//! removes it.

use crate::backend::{verify_manifest, ArtifactRef, Backend, PartRef, UploadHandle};
use crate::recording::event::SessionId;
use crate::utils::errors::{AuditError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const PART_EXTENSION: &str = "part";
const RECORDING_EXTENSION: &str = "rec";
const MARKER_EXTENSION: &str = "upload";

/// Backend storing recordings as files
#[derive(Debug, Clone)]
pub struct FileBackend {
    base_dir: PathBuf,
    min_part_size: usize,
}

impl FileBackend {
    /// Open (creating if needed) a backend rooted at `base_dir`
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();

        for dir in ["uploads", "recordings"] {
            fs::create_dir_all(base_dir.join(dir)).await.map_err(|e| {
                AuditError::BackendUnavailable(format!(
                    "failed to create {}: {}",
                    base_dir.join(dir).display(),
                    e
                ))
            })?;
        }

        info!("Filesystem backend initialized at {:?}", base_dir);

        Ok(Self {
            base_dir,
            min_part_size: 0,
        })
    }

    pub fn with_min_part_size(mut self, size: usize) -> Self {
        self.min_part_size = size;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.base_dir.join("uploads").join(session_id.as_str())
    }

    fn upload_dir(&self, upload: &UploadHandle) -> PathBuf {
        self.session_dir(&upload.session_id).join(&upload.upload_id)
    }

    fn part_path(&self, upload: &UploadHandle, part_number: u32) -> PathBuf {
        self.upload_dir(upload)
            .join(format!("{:08}.{}", part_number, PART_EXTENSION))
    }

    fn recording_path(&self, session_id: &SessionId) -> PathBuf {
        self.base_dir
            .join("recordings")
            .join(format!("{}.{}", session_id, RECORDING_EXTENSION))
    }

    fn marker_path(&self, session_id: &SessionId) -> PathBuf {
        self.recording_path(session_id).with_extension(MARKER_EXTENSION)
    }

    fn staging_path(&self, upload: &UploadHandle) -> PathBuf {
        self.recording_path(&upload.session_id)
            .with_extension(format!("tmp-{}", upload.upload_id))
    }

    /// Whether the session marker names this upload
    async fn owns_marker(&self, upload: &UploadHandle) -> Result<bool> {
        match fs::read_to_string(self.marker_path(&upload.session_id)).await {
            Ok(id) => Ok(id == upload.upload_id),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_completed(&self, upload: &UploadHandle) -> Result<bool> {
        Ok(self.owns_marker(upload).await?
            && exists(&self.recording_path(&upload.session_id)).await?)
    }

    async fn ensure_upload_dir(&self, upload: &UploadHandle) -> Result<PathBuf> {
        let dir = self.upload_dir(upload);
        if !exists(&dir).await? {
            return Err(AuditError::NotFound(format!("upload {}", upload.upload_id)));
        }
        Ok(dir)
    }

    async fn stored_parts(&self, upload: &UploadHandle) -> Result<Vec<(PartRef, PathBuf)>> {
        let dir = self.ensure_upload_dir(upload).await?;
        let mut parts = Vec::new();

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PART_EXTENSION) {
                continue;
            }
            let Some(part_number) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };

            let payload = fs::read(&path).await?;
            parts.push((PartRef::for_payload(part_number, &payload), path));
        }

        parts.sort_by_key(|(part, _)| part.part_number);
        Ok(parts)
    }

    async fn remove_upload_dirs(&self, upload: &UploadHandle) -> Result<()> {
        match fs::remove_dir_all(self.upload_dir(upload)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Fails while another upload of the same session still holds files
        if let Err(e) = fs::remove_dir(self.session_dir(&upload.session_id)).await {
            if e.kind() != ErrorKind::NotFound {
                debug!("Session upload dir not removed: {}", e);
            }
        }
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn exists(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Write `payload` next to `path` and rename it into place
async fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", ulid::Ulid::new()));

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl Backend for FileBackend {
    async fn create_upload(&self, session_id: &SessionId) -> Result<UploadHandle> {
        if exists(&self.recording_path(session_id)).await? {
            return Err(AuditError::AlreadyExists(format!(
                "recording for session {} already exists",
                session_id
            )));
        }

        match fs::create_dir(self.session_dir(session_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(AuditError::AlreadyExists(format!(
                    "upload for session {} is in progress",
                    session_id
                )))
            }
            Err(e) => return Err(AuditError::BackendUnavailable(e.to_string())),
        }

        let handle = UploadHandle::new(session_id.clone());
        fs::create_dir(self.upload_dir(&handle)).await?;

        debug!("Created file upload {} for session {}", handle.upload_id, session_id);
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
        self.ensure_upload_dir(upload).await?;

        write_atomic(&self.part_path(upload, part_number), &payload).await?;

        Ok(PartRef::for_payload(part_number, &payload))
    }

    async fn list_parts(&self, upload: &UploadHandle) -> Result<Vec<PartRef>> {
        Ok(self
            .stored_parts(upload)
            .await?
            .into_iter()
            .map(|(part, _)| part)
            .collect())
    }

    async fn complete_upload(
        &self,
        upload: &UploadHandle,
        parts: &[PartRef],
    ) -> Result<ArtifactRef> {
        if self.is_completed(upload).await? {
            return Err(AuditError::AlreadyCompleted(format!("upload {}", upload.upload_id)));
        }

        let stored = self.stored_parts(upload).await?;
        let by_number: HashMap<u32, &(PartRef, PathBuf)> =
            stored.iter().map(|entry| (entry.0.part_number, entry)).collect();
        verify_manifest(parts, self.min_part_size, |n| {
            by_number.get(&n).map(|(part, _)| part)
        })?;

        let destination = self.recording_path(&upload.session_id);
        let marker = self.marker_path(&upload.session_id);
        let tmp = self.staging_path(upload);
        let mut file = fs::File::create(&tmp).await?;
        let mut size = 0u64;

        for part in parts {
            let Some((_, path)) = by_number.get(&part.part_number) else {
                continue;
            };
            let mut source = fs::File::open(path).await?;
            size += tokio::io::copy(&mut source, &mut file).await?;
        }
        file.sync_all().await?;
        drop(file);

        if let Err(e) = write_atomic(&marker, upload.upload_id.as_bytes()).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp, &destination).await {
            warn!("Failed to publish recording {:?}: {}", destination, e);
            let _ = fs::remove_file(&tmp).await;
            let _ = fs::remove_file(&marker).await;
            return Err(e.into());
        }

        // The artifact is published; leftover part files are only garbage
        if let Err(e) = self.remove_upload_dirs(upload).await {
            warn!("Failed to clean up upload {}: {}", upload.upload_id, e);
        }

        debug!(
            "Completed file upload {} ({} parts, {} bytes)",
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
        if self.is_completed(upload).await? {
            return Ok(());
        }
        if self.owns_marker(upload).await? {
            debug!("Removing stale marker of upload {}", upload.upload_id);
            remove_if_present(&self.marker_path(&upload.session_id)).await?;
        }
        remove_if_present(&self.staging_path(upload)).await?;
        self.remove_upload_dirs(upload).await?;
        debug!("Aborted file upload {}", upload.upload_id);
        Ok(())
    }

    async fn upload_artifact(&self, session_id: &SessionId, payload: Bytes) -> Result<ArtifactRef> {
        let destination = self.recording_path(session_id);
        if exists(&destination).await? || exists(&self.session_dir(session_id)).await? {
            return Err(AuditError::AlreadyExists(format!("session {}", session_id)));
        }

        write_atomic(&destination, &payload).await?;

        Ok(ArtifactRef {
            session_id: session_id.clone(),
            size: payload.len() as u64,
            parts: 1,
        })
    }

    async fn download(
        &self,
        session_id: &SessionId,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let mut file = match fs::File::open(self.recording_path(session_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AuditError::NotFound(format!(
                    "recording for session {}",
                    session_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let copied = tokio::io::copy(&mut file, &mut *dest).await?;
        dest.flush().await?;

        Ok(copied)
    }

    fn min_part_size(&self) -> usize {
        self.min_part_size
    }
}
