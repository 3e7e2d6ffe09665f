// src/observability.rs
//! Logging and metrics setup
//!
//! Library code only emits `tracing` events and `metrics` counters; it
//! never installs a subscriber or recorder. Binaries call
//! [`init_tracing`] once at startup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Counter names emitted by streams
pub mod metric_names {
    pub const EVENTS_EMITTED: &str = "recording_events_emitted_total";
    pub const PARTS_UPLOADED: &str = "recording_parts_uploaded_total";
    pub const PART_UPLOAD_FAILURES: &str = "recording_part_upload_failures_total";
    pub const BYTES_UPLOADED: &str = "recording_bytes_uploaded_total";
    pub const STREAMS_COMPLETED: &str = "recording_streams_completed_total";
    pub const STREAMS_ABORTED: &str = "recording_streams_aborted_total";
}

/// Install the global tracing subscriber
///
/// Filtering follows `RUST_LOG` (default `info`). With `json` set, events
/// are written as one JSON object per line.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
    }

    Ok(())
}

pub(crate) fn record_event_emitted() {
    metrics::counter!(metric_names::EVENTS_EMITTED).increment(1);
}

pub(crate) fn record_part_uploaded(bytes: u64) {
    metrics::counter!(metric_names::PARTS_UPLOADED).increment(1);
    metrics::counter!(metric_names::BYTES_UPLOADED).increment(bytes);
}

pub(crate) fn record_part_failed() {
    metrics::counter!(metric_names::PART_UPLOAD_FAILURES).increment(1);
}

pub(crate) fn record_stream_completed() {
    metrics::counter!(metric_names::STREAMS_COMPLETED).increment(1);
}

pub(crate) fn record_stream_aborted() {
    metrics::counter!(metric_names::STREAMS_ABORTED).increment(1);
}
