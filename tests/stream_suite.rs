// tests/stream_suite.rs
//! End-to-end scenarios shared by every backend: stream a session, read it
//! back and check integrity statistics.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use session_recording::backend::{
    ArtifactRef, Backend, FileBackend, MemoryBackend, PartRef, RetryPolicy, RetryingBackend,
    UploadHandle,
};
use session_recording::recording::{
    generate_session, read_session, AuditEvent, CompressionLevel, EventType, StreamState,
    Streamer, StreamerConfig, UploadObserver,
};
use session_recording::{AuditError, ReadStats, Result, SessionId};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// Stream `events` through a fresh stream and complete it
async fn record(
    config: StreamerConfig,
    session_id: &SessionId,
    events: &[AuditEvent],
) -> Result<ArtifactRef> {
    let streamer = Streamer::new(config)?;
    let cancel = CancellationToken::new();
    let mut stream = streamer.create_stream(session_id, &cancel).await?;

    for event in events {
        stream.emit(event.clone()).await?;
    }
    stream.complete().await
}

async fn read_back(
    backend: &dyn Backend,
    session_id: &SessionId,
) -> Result<(Vec<AuditEvent>, ReadStats)> {
    read_session(backend, session_id, &CancellationToken::new()).await
}

/// Record a generated session and verify it reads back unchanged
async fn assert_round_trip(
    backend: Arc<dyn Backend>,
    print_events: usize,
    min_upload_bytes: usize,
    concurrent_uploads: usize,
) -> ArtifactRef {
    let session_id = SessionId::random();
    let events = generate_session(print_events);

    let config = StreamerConfig::new(Arc::clone(&backend))
        .with_min_upload_bytes(min_upload_bytes)
        .with_concurrent_uploads(concurrent_uploads);
    let artifact = record(config, &session_id, &events).await.unwrap();

    let (read, stats) = read_back(&*backend, &session_id).await.unwrap();
    assert_eq!(read.len(), events.len());
    assert_eq!(read, events);
    assert_eq!(stats.total_events, events.len() as i64);
    assert_eq!(stats.skipped_events, 0);
    assert_eq!(stats.out_of_order_events, 0);

    artifact
}

#[tokio::test]
async fn test_stream_single_part() {
    let artifact = assert_round_trip(Arc::new(MemoryBackend::new()), 1024, 1024 * 1024, 2).await;
    assert_eq!(artifact.parts, 1);
}

#[tokio::test]
async fn test_stream_small_threshold() {
    let artifact = assert_round_trip(Arc::new(MemoryBackend::new()), 1024, 1024, 2).await;
    assert!(artifact.parts > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_many_parts() {
    let artifact = assert_round_trip(Arc::new(MemoryBackend::new()), 8192, 1024, 64).await;
    assert!(artifact.parts > 64);
}

#[tokio::test]
async fn test_upload_download_whole_artifact() {
    let backend = MemoryBackend::new();
    let session_id = SessionId::new("whole-artifact").unwrap();
    let payload = Bytes::from_static(b"opaque recording bytes");

    let artifact = backend
        .upload_artifact(&session_id, payload.clone())
        .await
        .unwrap();
    assert_eq!(artifact.size, payload.len() as u64);

    let mut out = Vec::new();
    let written = backend.download(&session_id, &mut out).await.unwrap();
    assert_eq!(written, payload.len() as u64);
    assert_eq!(out, payload);
}

#[tokio::test]
async fn test_download_not_found() {
    let backend = MemoryBackend::new();
    let err = read_back(&backend, &SessionId::random()).await.unwrap_err();
    assert!(matches!(err, AuditError::NotFound(_)));
}

/// Holds `complete_upload` until released
#[derive(Default)]
struct CompleteGate {
    started: Notify,
    release: Notify,
}

/// Memory backend with injectable part failures, delays and gates
#[derive(Default)]
struct ControlledBackend {
    inner: MemoryBackend,
    failing_part: Option<(u32, AuditError)>,
    slow_odd_parts: Option<Duration>,
    part_gate: Option<Arc<Semaphore>>,
    complete_gate: Option<Arc<CompleteGate>>,
    part_calls: AtomicU32,
    finished: Mutex<Vec<u32>>,
}

#[async_trait]
impl Backend for ControlledBackend {
    async fn create_upload(&self, session_id: &SessionId) -> Result<UploadHandle> {
        self.inner.create_upload(session_id).await
    }

    async fn upload_part(
        &self,
        upload: &UploadHandle,
        part_number: u32,
        payload: Bytes,
    ) -> Result<PartRef> {
        self.part_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.part_gate {
            gate.acquire()
                .await
                .map_err(|e| AuditError::BackendUnavailable(e.to_string()))?
                .forget();
        }
        if let Some((failing, error)) = &self.failing_part {
            if *failing == part_number {
                return Err(error.clone());
            }
        }
        if let Some(delay) = self.slow_odd_parts {
            if part_number % 2 == 1 {
                tokio::time::sleep(delay).await;
            }
        }

        let part = self.inner.upload_part(upload, part_number, payload).await?;
        self.finished.lock().push(part_number);
        Ok(part)
    }

    async fn list_parts(&self, upload: &UploadHandle) -> Result<Vec<PartRef>> {
        self.inner.list_parts(upload).await
    }

    async fn complete_upload(
        &self,
        upload: &UploadHandle,
        parts: &[PartRef],
    ) -> Result<ArtifactRef> {
        if let Some(gate) = &self.complete_gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }
        self.inner.complete_upload(upload, parts).await
    }

    async fn abort_upload(&self, upload: &UploadHandle) -> Result<()> {
        self.inner.abort_upload(upload).await
    }

    async fn upload_artifact(&self, session_id: &SessionId, payload: Bytes) -> Result<ArtifactRef> {
        self.inner.upload_artifact(session_id, payload).await
    }

    async fn download(
        &self,
        session_id: &SessionId,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        self.inner.download(session_id, dest).await
    }
}

#[tokio::test]
async fn test_failed_part_leaves_no_artifact() {
    let backend = Arc::new(ControlledBackend {
        failing_part: Some((3, AuditError::BackendUnavailable("disk full".to_string()))),
        ..Default::default()
    });
    let streamer = Streamer::new(
        StreamerConfig::new(backend.clone())
            .with_min_upload_bytes(512)
            .with_concurrent_uploads(2),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let session_id = SessionId::random();
    let mut stream = streamer.create_stream(&session_id, &cancel).await.unwrap();

    for event in generate_session(200) {
        if stream.emit(event).await.is_err() {
            break;
        }
    }

    let err = stream.complete().await.unwrap_err();
    assert_eq!(err, AuditError::BackendUnavailable("disk full".to_string()));
    assert_eq!(stream.state(), StreamState::Failed);

    let err = read_back(&*backend, &session_id).await.unwrap_err();
    assert!(matches!(err, AuditError::NotFound(_)));
    assert_eq!(backend.inner.active_uploads(), 0);

    // The stream stays failed
    let err = stream
        .emit(AuditEvent::new(&session_id, EventType::SessionEnd, serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::StreamFailed(_)));
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let backend = Arc::new(MemoryBackend::new());
    let streamer = Streamer::new(
        StreamerConfig::new(backend.clone()).with_min_upload_bytes(256),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let session_id = SessionId::random();
    let mut stream = streamer.create_stream(&session_id, &cancel).await.unwrap();

    for event in generate_session(50) {
        stream.emit(event).await.unwrap();
    }

    stream.abort().await.unwrap();
    stream.abort().await.unwrap();
    assert_eq!(stream.state(), StreamState::Aborted);
    assert_eq!(backend.active_uploads(), 0);
    assert!(!cancel.is_cancelled());

    let err = stream.complete().await.unwrap_err();
    assert_eq!(err, AuditError::StreamClosed);

    let err = read_back(&*backend, &session_id).await.unwrap_err();
    assert!(matches!(err, AuditError::NotFound(_)));

    // The session id is free again
    streamer.create_stream(&session_id, &cancel).await.unwrap();
}

#[tokio::test]
async fn test_abort_after_complete_keeps_recording() {
    let backend = Arc::new(MemoryBackend::new());
    let streamer = Streamer::new(StreamerConfig::new(backend.clone())).unwrap();
    let cancel = CancellationToken::new();
    let session_id = SessionId::random();
    let mut stream = streamer.create_stream(&session_id, &cancel).await.unwrap();

    let events = generate_session(10);
    for event in &events {
        stream.emit(event.clone()).await.unwrap();
    }
    stream.complete().await.unwrap();
    stream.abort().await.unwrap();
    assert_eq!(stream.state(), StreamState::Completed);

    let err = stream.emit(events[0].clone()).await.unwrap_err();
    assert_eq!(err, AuditError::StreamClosed);

    let (read, _) = read_back(&*backend, &session_id).await.unwrap();
    assert_eq!(read, events);
}

#[tokio::test]
async fn test_empty_recording() {
    let backend = Arc::new(MemoryBackend::new());
    let session_id = SessionId::random();

    let artifact = record(StreamerConfig::new(backend.clone()), &session_id, &[])
        .await
        .unwrap();
    assert_eq!(artifact.parts, 1);

    let (read, stats) = read_back(&*backend, &session_id).await.unwrap();
    assert!(read.is_empty());
    assert_eq!(stats, ReadStats::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_does_not_change_output() {
    let events = generate_session(2000);
    let mut artifacts = Vec::new();

    for concurrent_uploads in [1, 64] {
        let backend = Arc::new(MemoryBackend::new());
        let session_id = SessionId::random();
        let config = StreamerConfig::new(backend.clone())
            .with_min_upload_bytes(1024)
            .with_concurrent_uploads(concurrent_uploads);
        record(config, &session_id, &events).await.unwrap();

        let (read, stats) = read_back(&*backend, &session_id).await.unwrap();
        assert!(stats.is_clean());
        assert_eq!(read, events);

        let mut raw = Vec::new();
        backend.download(&session_id, &mut raw).await.unwrap();
        artifacts.push(raw);
    }

    assert_eq!(artifacts[0], artifacts[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_order_part_completion() {
    let events = generate_session(300);
    let slow = Arc::new(ControlledBackend {
        slow_odd_parts: Some(Duration::from_millis(20)),
        ..Default::default()
    });
    let session_id = SessionId::random();
    let config = StreamerConfig::new(slow.clone())
        .with_min_upload_bytes(512)
        .with_concurrent_uploads(8);
    let artifact = record(config, &session_id, &events).await.unwrap();
    assert!(artifact.parts > 8);

    let finished = slow.finished.lock().clone();
    let mut sorted = finished.clone();
    sorted.sort_unstable();
    assert_ne!(finished, sorted, "parts should finish out of order");

    let (read, stats) = read_back(&*slow, &session_id).await.unwrap();
    assert_eq!(read, events);
    assert!(stats.is_clean());

    // Same bytes as a backend that finishes parts in order
    let plain = Arc::new(MemoryBackend::new());
    let plain_id = SessionId::random();
    let config = StreamerConfig::new(plain.clone())
        .with_min_upload_bytes(512)
        .with_concurrent_uploads(8);
    record(config, &plain_id, &events).await.unwrap();

    let mut slow_raw = Vec::new();
    slow.download(&session_id, &mut slow_raw).await.unwrap();
    let mut plain_raw = Vec::new();
    plain.download(&plain_id, &mut plain_raw).await.unwrap();
    assert_eq!(slow_raw, plain_raw);
}

#[tokio::test]
async fn test_emit_waits_for_a_free_upload_slot() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ControlledBackend {
        part_gate: Some(gate.clone()),
        ..Default::default()
    });
    let streamer = Streamer::new(
        StreamerConfig::new(backend.clone())
            .with_min_upload_bytes(512)
            .with_concurrent_uploads(1),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let session_id = SessionId::random();
    let mut stream = streamer.create_stream(&session_id, &cancel).await.unwrap();

    let events = generate_session(100);
    let to_emit = events.clone();
    let handle = tokio::spawn(async move {
        for event in to_emit {
            stream.emit(event).await?;
        }
        stream.complete().await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.part_calls.load(Ordering::SeqCst), 1);
    assert!(!handle.is_finished());

    gate.add_permits(Semaphore::MAX_PERMITS / 2);
    let artifact = handle.await.unwrap().unwrap();
    assert!(artifact.parts > 1);

    let (read, stats) = read_back(&*backend, &session_id).await.unwrap();
    assert_eq!(read, events);
    assert!(stats.is_clean());
}

#[tokio::test]
async fn test_retry_budget_exhausted_under_stream() {
    let controlled = Arc::new(ControlledBackend {
        failing_part: Some((3, AuditError::Transient("connection reset".to_string()))),
        ..Default::default()
    });
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 2.0,
    };
    let backend = Arc::new(RetryingBackend::new(controlled.clone(), policy));
    let streamer = Streamer::new(
        StreamerConfig::new(backend.clone())
            .with_min_upload_bytes(512)
            .with_concurrent_uploads(2),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let session_id = SessionId::random();
    let mut stream = streamer.create_stream(&session_id, &cancel).await.unwrap();

    for event in generate_session(200) {
        if stream.emit(event).await.is_err() {
            break;
        }
    }

    let err = stream.complete().await.unwrap_err();
    assert!(matches!(
        err,
        AuditError::TransientUploadFailure {
            part_number: 3,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(stream.state(), StreamState::Failed);
    assert!(controlled.part_calls.load(Ordering::SeqCst) >= 3);

    let err = read_back(&*backend, &session_id).await.unwrap_err();
    assert!(matches!(err, AuditError::NotFound(_)));
    assert_eq!(controlled.inner.active_uploads(), 0);
}

#[tokio::test]
async fn test_cancel_during_finalization_reports_the_stored_outcome() {
    let gate = Arc::new(CompleteGate::default());
    let backend = Arc::new(ControlledBackend {
        complete_gate: Some(gate.clone()),
        ..Default::default()
    });
    let streamer = Streamer::new(StreamerConfig::new(backend.clone())).unwrap();
    let cancel = CancellationToken::new();
    let session_id = SessionId::random();
    let mut stream = streamer.create_stream(&session_id, &cancel).await.unwrap();

    let events = generate_session(20);
    for event in &events {
        stream.emit(event.clone()).await.unwrap();
    }

    let handle = tokio::spawn(async move {
        let result = stream.complete().await;
        (stream, result)
    });

    gate.started.notified().await;
    cancel.cancel();
    gate.release.notify_one();

    let (stream, result) = handle.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(stream.state(), StreamState::Completed);
    assert!(backend.inner.has_artifact(&session_id));

    let (read, _) = read_back(&*backend, &session_id).await.unwrap();
    assert_eq!(read, events);
}

/// Counts parts and remembers their sizes
#[derive(Default)]
struct PartCounter {
    uploaded: AtomicU32,
    sizes: Mutex<Vec<(u32, u64)>>,
    completed: AtomicU32,
}

impl UploadObserver for PartCounter {
    fn on_part_uploaded(&self, _session_id: &SessionId, part: &PartRef) {
        self.uploaded.fetch_add(1, Ordering::SeqCst);
        self.sizes.lock().push((part.part_number, part.size));
    }

    fn on_stream_completed(&self, _session_id: &SessionId, _artifact: &ArtifactRef) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_threshold_controls_part_count() {
    let events = generate_session(500);
    let mut counts = Vec::new();

    for threshold in [512, 4096, 64 * 1024] {
        let backend = Arc::new(MemoryBackend::new());
        let observer = Arc::new(PartCounter::default());
        let session_id = SessionId::random();
        let config = StreamerConfig::new(backend.clone())
            .with_min_upload_bytes(threshold)
            .with_compression(CompressionLevel::None)
            .with_observer(observer.clone());

        let artifact = record(config, &session_id, &events).await.unwrap();
        assert_eq!(observer.uploaded.load(Ordering::SeqCst) as usize, artifact.parts);
        assert_eq!(observer.completed.load(Ordering::SeqCst), 1);

        let (read, stats) = read_back(&*backend, &session_id).await.unwrap();
        assert_eq!(read, events);
        assert!(stats.is_clean());

        counts.push(artifact.parts);
    }

    assert!(counts[0] > counts[1]);
    assert!(counts[1] > counts[2]);
}

#[tokio::test]
async fn test_backend_minimum_part_size_is_met() {
    let min_part_size = 4096;
    let backend = Arc::new(MemoryBackend::new().with_min_part_size(min_part_size));
    let observer = Arc::new(PartCounter::default());
    let session_id = SessionId::random();
    let events = generate_session(300);

    // Compression shrinks sealed parts below the threshold, forcing padding
    let config = StreamerConfig::new(backend.clone())
        .with_min_upload_bytes(256)
        .with_compression(CompressionLevel::Best)
        .with_observer(observer.clone());
    let artifact = record(config, &session_id, &events).await.unwrap();
    assert!(artifact.parts > 1);

    let mut sizes = observer.sizes.lock().clone();
    sizes.sort();
    let (_, non_final) = sizes.split_last().unwrap();
    for (part_number, size) in non_final {
        assert!(
            *size >= min_part_size as u64,
            "part {} is only {} bytes",
            part_number,
            size
        );
    }

    let (read, stats) = read_back(&*backend, &session_id).await.unwrap();
    assert_eq!(read, events);
    assert!(stats.is_clean());
}

#[tokio::test]
async fn test_cancellation_fails_stream() {
    let backend = Arc::new(MemoryBackend::new());
    let streamer = Streamer::new(
        StreamerConfig::new(backend.clone()).with_min_upload_bytes(256),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let session_id = SessionId::random();
    let mut stream = streamer.create_stream(&session_id, &cancel).await.unwrap();

    let events = generate_session(20);
    for event in &events[..10] {
        stream.emit(event.clone()).await.unwrap();
    }

    cancel.cancel();
    let err = stream.emit(events[10].clone()).await.unwrap_err();
    assert_eq!(err, AuditError::Cancelled);
    assert_eq!(stream.state(), StreamState::Failed);

    assert_eq!(stream.complete().await.unwrap_err(), AuditError::Cancelled);
    assert!(!backend.has_artifact(&session_id));
    assert_eq!(backend.active_uploads(), 0);
}

#[tokio::test]
async fn test_corrupted_artifact() {
    let backend = MemoryBackend::new();
    let session_id = SessionId::random();

    backend
        .upload_artifact(&session_id, Bytes::from_static(b"ASRP\x01 not a real part at all"))
        .await
        .unwrap();

    let err = read_back(&backend, &session_id).await.unwrap_err();
    assert!(matches!(err, AuditError::CorruptFrame(_)));
}

#[tokio::test]
async fn test_independent_concurrent_streams() {
    let backend = Arc::new(MemoryBackend::new());
    let streamer = Arc::new(
        Streamer::new(
            StreamerConfig::new(backend.clone())
                .with_min_upload_bytes(1024)
                .with_concurrent_uploads(4),
        )
        .unwrap(),
    );

    let sessions: Vec<(SessionId, Vec<AuditEvent>)> = (0..8)
        .map(|i| (SessionId::random(), generate_session(100 + i * 25)))
        .collect();

    let tasks = sessions.iter().cloned().map(|(session_id, events)| {
        let streamer = Arc::clone(&streamer);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut stream = streamer.create_stream(&session_id, &cancel).await?;
            for event in events {
                stream.emit(event).await?;
            }
            stream.complete().await
        })
    });

    for joined in futures::future::join_all(tasks).await {
        joined.unwrap().unwrap();
    }

    for (session_id, events) in &sessions {
        let (read, stats) = read_back(&*backend, session_id).await.unwrap();
        assert_eq!(&read, events);
        assert!(stats.is_clean());
    }
}

#[tokio::test]
async fn test_filesystem_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileBackend::new(dir.path()).await.unwrap());

    let artifact = assert_round_trip(backend.clone(), 1024, 1024, 8).await;
    assert!(artifact.parts > 1);

    let err = read_back(&*backend, &SessionId::random()).await.unwrap_err();
    assert!(matches!(err, AuditError::NotFound(_)));
}
