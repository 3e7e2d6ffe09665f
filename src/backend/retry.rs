// src/backend/retry.rs
//! Retry wrapper for backends
//!
//! Part uploads that fail with a transient error are retried with
//! exponential backoff and jitter. Once the attempt budget is spent the
//! failure surfaces as [`AuditError::TransientUploadFailure`]; errors that
//! are not transient are returned on the first attempt.

use crate::backend::{ArtifactRef, Backend, PartRef, UploadHandle};
use crate::recording::event::SessionId;
use crate::utils::errors::{AuditError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::warn;

/// Backoff policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_backoff.as_secs_f64() * exp;
        let capped = base.min(self.max_backoff.as_secs_f64());

        // Equal jitter: half fixed, half random
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AuditError::InvalidConfig(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(AuditError::InvalidConfig(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Backend wrapper retrying transient part upload failures
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    policy: RetryPolicy,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    async fn create_upload(&self, session_id: &SessionId) -> Result<UploadHandle> {
        self.inner.create_upload(session_id).await
    }

    async fn upload_part(
        &self,
        upload: &UploadHandle,
        part_number: u32,
        payload: Bytes,
    ) -> Result<PartRef> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self
                .inner
                .upload_part(upload, part_number, payload.clone())
                .await
            {
                Ok(part) => return Ok(part),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            if attempt >= self.policy.max_attempts {
                warn!(
                    "Part {} of upload {} failed after {} attempts: {}",
                    part_number, upload.upload_id, attempt, err
                );
                return Err(AuditError::TransientUploadFailure {
                    part_number,
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                "Retrying part {} of upload {} in {:?} (attempt {}): {}",
                part_number, upload.upload_id, delay, attempt, err
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn list_parts(&self, upload: &UploadHandle) -> Result<Vec<PartRef>> {
        self.inner.list_parts(upload).await
    }

    async fn complete_upload(
        &self,
        upload: &UploadHandle,
        parts: &[PartRef],
    ) -> Result<ArtifactRef> {
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

    fn min_part_size(&self) -> usize {
        self.inner.min_part_size()
    }
}
