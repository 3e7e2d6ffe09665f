// src/recording/reader.rs
//! Replay of completed recordings
//!
//! The reader decodes parts in artifact order and checks that event indices
//! form a contiguous, increasing sequence. Anomalies are counted, not
//! repaired: events are returned exactly in decoded position.

use crate::backend::Backend;
use crate::recording::codec::PartCodec;
use crate::recording::event::{AuditEvent, SessionId};
use crate::utils::errors::{AuditError, Result};
use futures::StreamExt;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Integrity counters for one read pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadStats {
    /// Events decoded
    pub total_events: i64,

    /// Indices missing from the sequence
    pub skipped_events: i64,

    /// Events whose index did not exceed the highest index seen so far
    pub out_of_order_events: i64,
}

impl ReadStats {
    /// No gaps and no reordering
    pub fn is_clean(&self) -> bool {
        self.skipped_events == 0 && self.out_of_order_events == 0
    }
}

/// Decodes a recording artifact into events
pub struct StreamReader<R> {
    parts: FramedRead<R, PartCodec>,
    pending: VecDeque<AuditEvent>,
    last_index: Option<i64>,
    parts_read: u64,
    stats: ReadStats,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            parts: FramedRead::new(source, PartCodec::reader()),
            pending: VecDeque::new(),
            last_index: None,
            parts_read: 0,
            stats: ReadStats::default(),
        }
    }

    /// Decode the next event, or `None` at the end of the artifact
    pub async fn next_event(&mut self, cancel: &CancellationToken) -> Result<Option<AuditEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.account(event.index);
                return Ok(Some(event));
            }

            let part = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuditError::Cancelled),
                part = self.parts.next() => part,
            };

            match part {
                Some(Ok(part)) => {
                    self.parts_read += 1;
                    if part.padded {
                        debug!("Part {} carries padding", self.parts_read);
                    }
                    self.pending.extend(part.events);
                }
                Some(Err(err)) => {
                    warn!("Failed to decode part {}: {}", self.parts_read + 1, err);
                    return Err(err);
                }
                None => return Ok(None),
            }
        }
    }

    /// Decode every remaining event
    ///
    /// Statistics are reset at the start of the pass.
    pub async fn read_all(&mut self, cancel: &CancellationToken) -> Result<Vec<AuditEvent>> {
        self.stats = ReadStats::default();
        self.last_index = None;

        let mut events = Vec::new();
        while let Some(event) = self.next_event(cancel).await? {
            events.push(event);
        }

        debug!(
            "Read {} events from {} parts ({} skipped, {} out of order)",
            self.stats.total_events,
            self.parts_read,
            self.stats.skipped_events,
            self.stats.out_of_order_events
        );

        Ok(events)
    }

    /// Counters of the most recent pass
    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    pub fn into_inner(self) -> R {
        self.parts.into_inner()
    }

    fn account(&mut self, index: i64) {
        self.stats.total_events += 1;

        let previous = self.last_index.unwrap_or(-1);
        if index <= previous {
            self.stats.out_of_order_events += 1;
            return;
        }

        let gap = index.saturating_sub(previous).saturating_sub(1);
        if gap > 0 {
            self.stats.skipped_events = self.stats.skipped_events.saturating_add(gap);
        }
        self.last_index = Some(index);
    }
}

/// Download a session recording and decode it
pub async fn read_session(
    backend: &dyn Backend,
    session_id: &SessionId,
    cancel: &CancellationToken,
) -> Result<(Vec<AuditEvent>, ReadStats)> {
    let mut artifact = Vec::new();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AuditError::Cancelled),
        downloaded = backend.download(session_id, &mut artifact) => { downloaded?; }
    }

    let mut reader = StreamReader::new(&artifact[..]);
    let events = reader.read_all(cancel).await?;
    Ok((events, reader.stats()))
}
