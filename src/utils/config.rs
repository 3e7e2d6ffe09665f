// src/utils/config.rs
//! Recording configuration
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. Optional file named by `SESSION_RECORDING_CONFIG` (TOML, YAML or JSON)
//! 3. Environment, e.g. `SESSION_RECORDING__STREAMER__CONCURRENT_UPLOADS=16`

use crate::backend::{Backend, FileBackend, MemoryBackend, RetryPolicy, RetryingBackend};
use crate::recording::codec::CompressionLevel;
use crate::recording::streamer::{
    StreamerConfig, DEFAULT_CONCURRENT_UPLOADS, DEFAULT_MIN_UPLOAD_BYTES, MAX_UPLOAD_BYTES,
};
use crate::utils::errors::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "SESSION_RECORDING_CONFIG";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "SESSION_RECORDING";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub streamer: StreamerSettings,
    pub backend: BackendSettings,
    pub retry: RetrySettings,
    pub logging: LoggingSettings,
}

/// Upload policy of every stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerSettings {
    /// Buffered bytes that trigger a part upload
    pub min_upload_bytes: usize,

    /// Concurrent part uploads per stream
    pub concurrent_uploads: usize,

    /// Part body compression
    pub compression: CompressionLevel,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            min_upload_bytes: DEFAULT_MIN_UPLOAD_BYTES,
            concurrent_uploads: DEFAULT_CONCURRENT_UPLOADS,
            compression: CompressionLevel::default(),
        }
    }
}

/// Supported storage media
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Filesystem,
}

/// Storage selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,

    /// Base directory (filesystem backend only)
    pub path: Option<PathBuf>,

    /// Minimum size of non-final parts
    pub min_part_size: usize,
}

/// Retry policy for transient part upload failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Emit logs as JSON lines
    pub json: bool,
}

impl RecordingConfig {
    /// Load from the file named by `SESSION_RECORDING_CONFIG` (if set) and
    /// the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(
            path.as_deref(),
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
    }

    /// Load from an optional file plus the given environment source
    pub fn load_from(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading recording configuration from {:?}", path);
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: RecordingConfig = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AuditError::InvalidConfig(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.streamer.min_upload_bytes == 0 {
            return Err(AuditError::InvalidConfig(
                "streamer.min_upload_bytes must be greater than 0".to_string(),
            ));
        }
        if self.streamer.min_upload_bytes > MAX_UPLOAD_BYTES {
            return Err(AuditError::InvalidConfig(format!(
                "streamer.min_upload_bytes {} exceeds the part limit of {}",
                self.streamer.min_upload_bytes, MAX_UPLOAD_BYTES
            )));
        }
        if self.backend.min_part_size > MAX_UPLOAD_BYTES {
            return Err(AuditError::InvalidConfig(format!(
                "backend.min_part_size {} exceeds the part limit of {}",
                self.backend.min_part_size, MAX_UPLOAD_BYTES
            )));
        }
        if self.streamer.concurrent_uploads == 0 {
            return Err(AuditError::InvalidConfig(
                "streamer.concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Filesystem && self.backend.path.is_none() {
            return Err(AuditError::InvalidConfig(
                "backend.path is required for the filesystem backend".to_string(),
            ));
        }
        self.retry_policy().validate()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            multiplier: self.retry.multiplier,
        }
    }

    /// Construct the configured backend, wrapped in the retry policy
    pub async fn build_backend(&self) -> Result<Arc<dyn Backend>> {
        let inner: Arc<dyn Backend> = match self.backend.kind {
            BackendKind::Memory => {
                Arc::new(MemoryBackend::new().with_min_part_size(self.backend.min_part_size))
            }
            BackendKind::Filesystem => {
                let path = self.backend.path.clone().ok_or_else(|| {
                    AuditError::InvalidConfig("backend.path is not set".to_string())
                })?;
                Arc::new(
                    FileBackend::new(path)
                        .await?
                        .with_min_part_size(self.backend.min_part_size),
                )
            }
        };

        info!("Using {:?} backend", self.backend.kind);
        Ok(Arc::new(RetryingBackend::new(inner, self.retry_policy())))
    }

    /// Streamer configuration bound to `backend`
    pub fn streamer_config(&self, backend: Arc<dyn Backend>) -> StreamerConfig {
        StreamerConfig::new(backend)
            .with_min_upload_bytes(self.streamer.min_upload_bytes)
            .with_concurrent_uploads(self.streamer.concurrent_uploads)
            .with_compression(self.streamer.compression)
    }
}
