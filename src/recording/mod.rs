// src/recording/mod.rs
//! Session recording: capture, chunked upload and replay
//!
//! - **Event**: audit events and session identifiers
//! - **Codec**: part framing, padding and compression
//! - **Stream**: buffered writer with a concurrent upload pool
//! - **Streamer**: factory binding streams to a backend
//! - **Reader**: decoding with gap and reorder detection
//! - **Observer**: upload progress callbacks
//!
//! # Architecture
//!
//! ```text
//! emit() → Buffer → seal part (codec) → upload pool (N workers)
//!                                             ↓
//!                                   Backend.upload_part()
//!                                             ↓
//! complete() → join uploads → sorted manifest → Backend.complete_upload()
//!                                             ↓
//!                                  artifact (parts in order)
//!                                             ↓
//! read_session() → Backend.download() → StreamReader → events + stats
//! ```

pub mod codec;
pub mod event;
pub mod observer;
pub mod reader;
pub mod stream;
pub mod streamer;

// Re-export commonly used types
pub use codec::{CompressionLevel, DecodedPart, PartCodec};
pub use event::{generate_session, AuditEvent, EventType, SessionId};
pub use observer::{NoopObserver, UploadObserver};
pub use reader::{read_session, ReadStats, StreamReader};
pub use stream::{AuditStream, StreamState, StreamStatus};
pub use streamer::{Streamer, StreamerConfig};
