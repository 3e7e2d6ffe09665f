// src/recording/event.rs
//! Session events and session identifiers
//!
//! An [`AuditEvent`] is one entry in a recording. The writer assigns its
//! `index`; everything else is supplied by the session that produced it.

use crate::utils::errors::{AuditError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a session identifier in bytes
pub const MAX_SESSION_ID_LEN: usize = 255;

/// Identifier of one recording, safe to use as a storage key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a session identifier
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(AuditError::InvalidSessionId("empty".to_string()));
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(AuditError::InvalidSessionId(format!(
                "{} bytes exceeds limit of {}",
                id.len(),
                MAX_SESSION_ID_LEN
            )));
        }
        if id == "." || id == ".." {
            return Err(AuditError::InvalidSessionId(id));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(AuditError::InvalidSessionId(format!(
                "{:?} contains forbidden character {:?}",
                id, c
            )));
        }

        Ok(Self(id))
    }

    /// Generate a fresh identifier (used by tests and tooling)
    pub fn random() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = AuditError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Kinds of events captured from a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionPrint,
    Resize,
    SessionCommand,
    SessionData,
    SessionJoin,
    SessionLeave,
    SessionEnd,
}

/// One recorded session event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the recording, assigned by the writer.
    /// Carried in the frame header, not in the encoded payload.
    #[serde(skip)]
    pub index: i64,

    /// Session this event belongs to
    pub session_id: String,

    /// Event type
    pub event_type: EventType,

    /// Logical timestamp
    pub time: DateTime<Utc>,

    /// Event payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AuditEvent {
    /// Create an event; `index` is filled in on emit
    pub fn new(session_id: &SessionId, event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            index: 0,
            session_id: session_id.to_string(),
            event_type,
            time: Utc::now(),
            data,
        }
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }
}

/// Build a synthetic session: a start event followed by `print_events`
/// terminal output events and a closing end event.
///
/// Indices and timestamps are pre-assigned so the output can be compared
/// against a read-back recording.
pub fn generate_session(print_events: usize) -> Vec<AuditEvent> {
    let session_id = SessionId::random();
    let start = DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap_or_default();
    let mut events = Vec::with_capacity(print_events + 2);

    events.push(
        AuditEvent::new(
            &session_id,
            EventType::SessionStart,
            serde_json::json!({
                "login": "bob",
                "server_id": "node-1",
                "terminal_size": "80:25",
            }),
        )
        .with_time(start),
    );

    let mut offset: u64 = 0;
    for i in 0..print_events {
        let text = format!("hello world {}\r\n", i);
        let delay_ms = i as i64 * 10;
        events.push(
            AuditEvent::new(
                &session_id,
                EventType::SessionPrint,
                serde_json::json!({
                    "chunk_index": i,
                    "bytes": text.len(),
                    "offset": offset,
                    "delay_ms": delay_ms,
                    "data": text,
                }),
            )
            .with_time(start + chrono::Duration::milliseconds(delay_ms)),
        );
        offset += text.len() as u64;
    }

    let end = start + chrono::Duration::milliseconds(print_events as i64 * 10);
    events.push(
        AuditEvent::new(
            &session_id,
            EventType::SessionEnd,
            serde_json::json!({ "participants": ["bob"] }),
        )
        .with_time(end),
    );

    for (i, event) in events.iter_mut().enumerate() {
        event.index = i as i64;
    }

    events
}
