// src/recording/stream.rs
//! Audit stream: buffered, concurrent upload of one recording
//!
//! Events are framed into an in-memory buffer as they are emitted. When the
//! buffer reaches the size threshold it is sealed into a part and handed to
//! a per-stream pool of upload tasks.
//!
//! # Ordering
//!
//! ```text
//! emit → [buffer] → seal part N → spawn upload(N) ─┐
//!                                                  ├─ finish in any order
//! emit → [buffer] → seal part N+1 → spawn upload ──┘
//!                                                  ↓
//! complete → join all → manifest sorted by part number → complete_upload
//! ```
//!
//! Part numbers are assigned when a part is sealed. Upload tasks only report
//! their own outcome; the manifest is built from part numbers, so the order
//! in which uploads finish never affects the artifact.
//!
//! # Backpressure
//!
//! At most `concurrent_uploads` parts are in flight. Sealing another part
//! waits for a free slot, which bounds memory to roughly
//! `concurrent_uploads × part size` plus the open buffer.

use crate::backend::{ArtifactRef, Backend, PartRef, UploadHandle};
use crate::observability;
use crate::recording::codec::{encode_event, PartCodec};
use crate::recording::event::{AuditEvent, SessionId};
use crate::recording::observer::UploadObserver;
use crate::utils::errors::{AuditError, Result};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Accepting events
    Open,

    /// A part upload or the stream itself hit a terminal error
    Failed,

    /// Recording is durably stored
    Completed,

    /// Upload was discarded
    Aborted,
}

/// Counters describing a stream's progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub events_emitted: u64,
    pub parts_created: u32,
    pub parts_uploaded: u32,
    pub bytes_uploaded: u64,
    pub in_flight: usize,
}

/// Settings a stream inherits from its streamer
#[derive(Clone)]
pub(crate) struct StreamSettings {
    pub min_upload_bytes: usize,
    pub concurrent_uploads: usize,
    pub codec: PartCodec,
    pub observer: Arc<dyn UploadObserver>,
}

/// Result of one part upload task
struct PartOutcome {
    part_number: u32,
    result: Result<PartRef>,
}

/// Writer for one session recording
///
/// A stream has a single writer: `emit`, `complete` and `abort` take
/// `&mut self`. Dropping a stream stops its upload tasks but leaves the
/// backend upload in place; call [`AuditStream::abort`] to release it.
pub struct AuditStream {
    session_id: SessionId,
    upload: UploadHandle,
    backend: Arc<dyn Backend>,
    settings: StreamSettings,
    cancel: CancellationToken,

    buffer: BytesMut,
    next_index: i64,
    next_part_number: u32,
    permits: Arc<Semaphore>,
    uploads: JoinSet<PartOutcome>,
    parts: BTreeMap<u32, PartRef>,
    failure: Option<AuditError>,
    state: StreamState,
    status: StreamStatus,
}

impl AuditStream {
    pub(crate) fn new(
        upload: UploadHandle,
        backend: Arc<dyn Backend>,
        settings: StreamSettings,
        cancel: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrent_uploads));

        Self {
            session_id: upload.session_id.clone(),
            upload,
            backend,
            buffer: BytesMut::with_capacity(settings.min_upload_bytes),
            settings,
            cancel,
            next_index: 0,
            next_part_number: 1,
            permits,
            uploads: JoinSet::new(),
            parts: BTreeMap::new(),
            failure: None,
            state: StreamState::Open,
            status: StreamStatus::default(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Backend upload this stream writes to
    pub fn upload(&self) -> &UploadHandle {
        &self.upload
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            in_flight: self.uploads.len(),
            ..self.status.clone()
        }
    }

    /// Token cancelling this stream's pending work
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Append an event to the recording
    ///
    /// The event's `index` is overwritten with the next sequence number.
    /// Waits only when every upload slot is busy and a part has to be sealed.
    /// An event too large for a single part is rejected without consuming an
    /// index; the stream stays open.
    pub async fn emit(&mut self, mut event: AuditEvent) -> Result<()> {
        self.ensure_open()?;
        self.reap_finished();
        self.ensure_open()?;

        if self.cancel.is_cancelled() {
            return Err(self.fail(AuditError::Cancelled));
        }

        event.index = self.next_index;
        let max_body_len = self.settings.codec.max_body_len();
        let buffered = self.buffer.len();
        let written = encode_event(&mut self.buffer, &event)?;

        if written > max_body_len {
            self.buffer.truncate(buffered);
            return Err(AuditError::Serialization(format!(
                "event {} of {} bytes exceeds the part limit of {}",
                event.index, written, max_body_len
            )));
        }
        if self.buffer.len() > max_body_len {
            // Seal the earlier events on their own; this one opens the next part
            let frame = self.buffer.split_off(buffered);
            self.flush_part(false).await?;
            self.buffer.unsplit(frame);
        }

        self.next_index += 1;
        self.status.events_emitted += 1;
        observability::record_event_emitted();
        trace!(index = event.index, bytes = written, "buffered event");

        if self.buffer.len() >= self.settings.min_upload_bytes {
            self.flush_part(false).await?;
        }

        Ok(())
    }

    /// Upload remaining events and finalize the recording
    ///
    /// Returns only after every part upload resolved. On any failure the
    /// backend upload is aborted and the first error is returned, so a
    /// partial recording never becomes visible.
    pub async fn complete(&mut self) -> Result<ArtifactRef> {
        match self.state {
            StreamState::Completed | StreamState::Aborted => return Err(AuditError::StreamClosed),
            StreamState::Open => {
                if !self.buffer.is_empty() || self.next_part_number == 1 {
                    // A failed flush is already recorded; fall through to cleanup
                    let _ = self.flush_part(true).await;
                }
                self.wait_for_uploads().await;
            }
            StreamState::Failed => {}
        }

        if let Some(err) = self.failure.clone() {
            self.discard_upload().await;
            return Err(err);
        }

        let parts: Vec<PartRef> = self.parts.values().cloned().collect();
        if parts.len() as u32 != self.next_part_number - 1 {
            let err = AuditError::IncompleteUpload(format!(
                "{} of {} parts uploaded",
                parts.len(),
                self.next_part_number - 1
            ));
            self.fail(err.clone());
            self.discard_upload().await;
            return Err(err);
        }

        if self.cancel.is_cancelled() {
            self.fail(AuditError::Cancelled);
            self.discard_upload().await;
            return Err(AuditError::Cancelled);
        }

        // Not raced against cancellation, so the result always matches what
        // the backend stored
        match self.backend.complete_upload(&self.upload, &parts).await {
            Ok(artifact) => {
                self.state = StreamState::Completed;
                self.settings
                    .observer
                    .on_stream_completed(&self.session_id, &artifact);
                observability::record_stream_completed();
                info!(
                    "Completed recording {} ({} events, {} parts, {} bytes)",
                    self.session_id, self.status.events_emitted, artifact.parts, artifact.size
                );
                Ok(artifact)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Cancel pending uploads and discard the backend upload
    ///
    /// A no-op once the stream completed; safe to call more than once.
    pub async fn abort(&mut self) -> Result<()> {
        match self.state {
            StreamState::Completed | StreamState::Aborted => return Ok(()),
            StreamState::Open | StreamState::Failed => {}
        }

        self.cancel.cancel();
        self.uploads.abort_all();
        while self.uploads.join_next().await.is_some() {}
        self.buffer.clear();

        self.backend.abort_upload(&self.upload).await?;
        self.state = StreamState::Aborted;
        observability::record_stream_aborted();
        info!("Aborted recording {}", self.session_id);

        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            StreamState::Open => Ok(()),
            StreamState::Completed | StreamState::Aborted => Err(AuditError::StreamClosed),
            StreamState::Failed => Err(AuditError::StreamFailed(
                self.failure
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
        }
    }

    /// Seal the buffer into the next part and start its upload
    async fn flush_part(&mut self, last: bool) -> Result<()> {
        let frames = self.buffer.split();
        let sealed = if last {
            self.settings.codec.seal_final(frames)
        } else {
            self.settings.codec.seal(frames)
        };
        let payload = match sealed {
            Ok(payload) => payload,
            Err(err) => return Err(self.fail(err)),
        };

        let part_number = self.next_part_number;
        self.next_part_number += 1;
        self.status.parts_created += 1;

        let permit = self.acquire_slot().await?;
        self.spawn_upload(part_number, payload, permit);

        Ok(())
    }

    async fn acquire_slot(&mut self) -> Result<OwnedSemaphorePermit> {
        let cancel = self.cancel.clone();
        let permits = Arc::clone(&self.permits);

        // Reap while waiting so that failures surface during backpressure
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.fail(AuditError::Cancelled)),
                permit = Arc::clone(&permits).acquire_owned() => {
                    return permit.map_err(|_| self.fail(AuditError::StreamClosed));
                }
                Some(joined) = self.uploads.join_next() => {
                    self.handle_joined(joined);
                    if let Some(err) = &self.failure {
                        return Err(AuditError::StreamFailed(err.to_string()));
                    }
                }
            }
        }
    }

    fn spawn_upload(&mut self, part_number: u32, payload: Bytes, permit: OwnedSemaphorePermit) {
        let backend = Arc::clone(&self.backend);
        let upload = self.upload.clone();
        let cancel = self.cancel.clone();
        let size = payload.len();

        debug!(
            "Uploading part {} of {} ({} bytes)",
            part_number, self.session_id, size
        );

        self.uploads.spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AuditError::Cancelled),
                result = backend.upload_part(&upload, part_number, payload) => result,
            };
            PartOutcome {
                part_number,
                result,
            }
        });
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.uploads.try_join_next() {
            self.handle_joined(joined);
        }
    }

    async fn wait_for_uploads(&mut self) {
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.uploads.abort_all();
                    self.fail(AuditError::Cancelled);
                    return;
                }
                joined = self.uploads.join_next() => match joined {
                    Some(joined) => self.handle_joined(joined),
                    None => return,
                },
            }
        }
    }

    fn handle_joined(&mut self, joined: std::result::Result<PartOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                self.fail(AuditError::StreamFailed(format!("upload task panicked: {}", err)));
                return;
            }
        };

        match outcome.result {
            Ok(part) => {
                debug!("Uploaded part {} of {}", part.part_number, self.session_id);
                self.status.parts_uploaded += 1;
                self.status.bytes_uploaded += part.size;
                observability::record_part_uploaded(part.size);
                self.settings
                    .observer
                    .on_part_uploaded(&self.session_id, &part);
                self.parts.insert(outcome.part_number, part);
            }
            Err(err) => {
                observability::record_part_failed();
                self.settings
                    .observer
                    .on_part_failed(&self.session_id, outcome.part_number, &err);
                self.fail(err);
            }
        }
    }

    /// Move to the failed state, keeping the first error seen
    fn fail(&mut self, err: AuditError) -> AuditError {
        if self.failure.is_none() {
            warn!("Recording {} failed: {}", self.session_id, err);
            self.failure = Some(err.clone());
        }
        if self.state == StreamState::Open {
            self.state = StreamState::Failed;
        }
        err
    }

    /// Stop pending work and drop the backend upload after a failure
    async fn discard_upload(&mut self) {
        self.uploads.abort_all();
        while self.uploads.join_next().await.is_some() {}

        match self.backend.abort_upload(&self.upload).await {
            Ok(()) => debug!("Discarded upload {} of {}", self.upload.upload_id, self.session_id),
            Err(err) => warn!(
                "Failed to discard upload {} of {}: {}",
                self.upload.upload_id, self.session_id, err
            ),
        }
    }
}
