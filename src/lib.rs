// src/lib.rs
//! Session Recording Library
//!
//! Chunked, streaming upload and download of session recordings over
//! pluggable storage backends.
//!
//! # Architecture
//!
//! The library is structured into several key modules:
//!
//! - **backend**: Multipart upload capability with memory, filesystem and retry implementations
//! - **recording**: Audit streams, part codec and replay reader
//! - **observability**: Tracing setup and upload metrics
//! - **utils**: Configuration and errors

// Public module exports
pub mod backend;
pub mod observability;
pub mod recording;
pub mod utils;

// Re-export commonly used types
pub use backend::{ArtifactRef, Backend, PartRef, UploadHandle};
pub use recording::{
    read_session, AuditEvent, AuditStream, EventType, ReadStats, SessionId, StreamReader,
    Streamer, StreamerConfig,
};
pub use utils::config::RecordingConfig;
pub use utils::errors::{AuditError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
