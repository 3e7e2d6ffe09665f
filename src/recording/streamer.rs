// src/recording/streamer.rs
//! Factory for audit streams
//!
//! A [`Streamer`] binds a backend to an upload policy. Every stream it
//! creates gets its own buffer, worker pool and upload session; only the
//! backend is shared.

use crate::backend::Backend;
use crate::recording::codec::{
    CompressionLevel, PartCodec, EVENT_FRAME_OVERHEAD, MAX_PART_BODY_LEN,
};
use crate::recording::event::SessionId;
use crate::recording::observer::{NoopObserver, UploadObserver};
use crate::recording::stream::{AuditStream, StreamSettings};
use crate::utils::errors::{AuditError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default part size threshold (5 MiB, the S3 minimum part size)
pub const DEFAULT_MIN_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Default number of concurrent part uploads per stream
pub const DEFAULT_CONCURRENT_UPLOADS: usize = 8;

/// Largest part size threshold a part body can hold
pub const MAX_UPLOAD_BYTES: usize = MAX_PART_BODY_LEN - EVENT_FRAME_OVERHEAD;

/// Streamer configuration
#[derive(Clone)]
pub struct StreamerConfig {
    /// Storage the streams upload to
    pub backend: Arc<dyn Backend>,

    /// Buffered bytes that trigger sealing a part
    pub min_upload_bytes: usize,

    /// Upload worker pool size per stream
    pub concurrent_uploads: usize,

    /// Part body compression
    pub compression: CompressionLevel,

    /// Progress sink shared by all streams
    pub observer: Arc<dyn UploadObserver>,
}

impl StreamerConfig {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            min_upload_bytes: DEFAULT_MIN_UPLOAD_BYTES,
            concurrent_uploads: DEFAULT_CONCURRENT_UPLOADS,
            compression: CompressionLevel::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_min_upload_bytes(mut self, bytes: usize) -> Self {
        self.min_upload_bytes = bytes;
        self
    }

    pub fn with_concurrent_uploads(mut self, uploads: usize) -> Self {
        self.concurrent_uploads = uploads;
        self
    }

    pub fn with_compression(mut self, compression: CompressionLevel) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Reject parameters no stream could run with
    pub fn validate(&self) -> Result<()> {
        if self.min_upload_bytes == 0 {
            return Err(AuditError::InvalidConfig(
                "min_upload_bytes must be greater than 0".to_string(),
            ));
        }
        if self.min_upload_bytes > MAX_UPLOAD_BYTES {
            return Err(AuditError::InvalidConfig(format!(
                "min_upload_bytes {} exceeds the part limit of {}",
                self.min_upload_bytes, MAX_UPLOAD_BYTES
            )));
        }
        if self.concurrent_uploads == 0 {
            return Err(AuditError::InvalidConfig(
                "concurrent_uploads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamerConfig")
            .field("min_upload_bytes", &self.min_upload_bytes)
            .field("concurrent_uploads", &self.concurrent_uploads)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// Creates independent audit streams over one backend
pub struct Streamer {
    config: StreamerConfig,
}

impl Streamer {
    /// Create a streamer, validating its configuration
    pub fn new(config: StreamerConfig) -> Result<Self> {
        config.validate()?;

        info!(
            "Streamer ready (min_upload_bytes={}, concurrent_uploads={}, compression={:?})",
            config.min_upload_bytes, config.concurrent_uploads, config.compression
        );

        Ok(Self { config })
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Start recording a session
    ///
    /// `cancel` governs every blocking operation of the returned stream;
    /// cancelling it fails the stream. The stream works on a child token, so
    /// aborting one stream never cancels the caller's token.
    pub async fn create_stream(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<AuditStream> {
        let backend = Arc::clone(&self.config.backend);

        let min_part_size = backend.min_part_size();
        if min_part_size > MAX_UPLOAD_BYTES {
            return Err(AuditError::InvalidConfig(format!(
                "backend minimum part size {} exceeds the part limit of {}",
                min_part_size, MAX_UPLOAD_BYTES
            )));
        }

        let upload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuditError::Cancelled),
            upload = backend.create_upload(session_id) => upload?,
        };

        let settings = StreamSettings {
            // Parts smaller than the backend minimum would be padded anyway
            min_upload_bytes: self.config.min_upload_bytes.max(min_part_size),
            concurrent_uploads: self.config.concurrent_uploads,
            codec: PartCodec::new(self.config.compression, min_part_size),
            observer: Arc::clone(&self.config.observer),
        };

        info!(
            "Created stream for session {} (upload {})",
            session_id, upload.upload_id
        );

        Ok(AuditStream::new(upload, backend, settings, cancel.child_token()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::recording::event::{generate_session, AuditEvent, EventType};
    use crate::recording::stream::StreamState;

    fn memory() -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn test_invalid_config() {
        let err = Streamer::new(StreamerConfig::new(memory()).with_min_upload_bytes(0)).err();
        assert!(matches!(err, Some(AuditError::InvalidConfig(_))));

        let err = Streamer::new(StreamerConfig::new(memory()).with_concurrent_uploads(0)).err();
        assert!(matches!(err, Some(AuditError::InvalidConfig(_))));

        assert!(Streamer::new(StreamerConfig::new(memory())).is_ok());
    }

    #[test]
    fn test_threshold_above_part_limit_rejected() {
        let config = StreamerConfig::new(memory())
            .with_min_upload_bytes(65 * 1024 * 1024)
            .with_compression(CompressionLevel::None);
        let err = Streamer::new(config).err();
        assert!(matches!(err, Some(AuditError::InvalidConfig(msg)) if msg.contains("part limit")));

        let config = StreamerConfig::new(memory()).with_min_upload_bytes(MAX_UPLOAD_BYTES);
        assert!(Streamer::new(config).is_ok());
    }

    #[tokio::test]
    async fn test_backend_minimum_above_part_limit_rejected() {
        let backend = Arc::new(MemoryBackend::new().with_min_part_size(MAX_PART_BODY_LEN));
        let streamer = Streamer::new(StreamerConfig::new(backend.clone())).unwrap();

        let sid = SessionId::random();
        let err = streamer.create_stream(&sid, &CancellationToken::new()).await.err();
        assert!(matches!(err, Some(AuditError::InvalidConfig(_))));
        assert_eq!(backend.active_uploads(), 0);
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let streamer = Streamer::new(
            StreamerConfig::new(memory())
                .with_min_upload_bytes(256)
                .with_concurrent_uploads(2),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let a = SessionId::random();
        let b = SessionId::random();
        let mut stream_a = streamer.create_stream(&a, &cancel).await.unwrap();
        let mut stream_b = streamer.create_stream(&b, &cancel).await.unwrap();

        for event in generate_session(20) {
            stream_a.emit(event).await.unwrap();
        }
        let start = AuditEvent::new(&b, EventType::SessionStart, serde_json::json!({}));
        stream_b.emit(start).await.unwrap();

        stream_b.abort().await.unwrap();
        assert_eq!(stream_b.state(), StreamState::Aborted);
        assert!(!cancel.is_cancelled());

        stream_a.complete().await.unwrap();
        assert_eq!(stream_a.status().events_emitted, 22);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let streamer = Streamer::new(StreamerConfig::new(memory())).unwrap();
        let cancel = CancellationToken::new();
        let sid = SessionId::random();

        let _first = streamer.create_stream(&sid, &cancel).await.unwrap();
        let err = streamer.create_stream(&sid, &cancel).await.err();
        assert!(matches!(err, Some(AuditError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_create_cancelled() {
        let streamer = Streamer::new(StreamerConfig::new(memory())).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = streamer.create_stream(&SessionId::random(), &cancel).await.err();
        assert_eq!(err, Some(AuditError::Cancelled));
    }
}
