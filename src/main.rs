// src/main.rs
//! Session Recording Inspector
//!
//! Downloads a recording from the configured backend, prints its events as
//! JSON lines and reports integrity statistics.
//!
//! ```text
//! session-recording <session-id>
//! ```

use anyhow::{bail, Context, Result};
use session_recording::observability::init_tracing;
use session_recording::{read_session, RecordingConfig, SessionId};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = RecordingConfig::load().context("failed to load configuration")?;

    init_tracing(config.logging.json)?;
    info!("Session recording inspector v{}", session_recording::VERSION);

    let raw_id = match std::env::args().nth(1) {
        Some(id) => id,
        None => bail!("usage: session-recording <session-id>"),
    };
    let session_id = SessionId::new(raw_id)?;

    let backend = config.build_backend().await?;

    // Stop reading on CTRL+C
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, cancelling read...");
            shutdown.cancel();
        }
    });

    let (events, stats) = read_session(backend.as_ref(), &session_id, &cancel)
        .await
        .with_context(|| format!("failed to read recording {}", session_id))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in &events {
        let mut line = serde_json::to_value(event)?;
        line["index"] = event.index.into();
        writeln!(out, "{}", line)?;
    }
    out.flush()?;

    info!(
        "Read {} events ({} skipped, {} out of order)",
        stats.total_events, stats.skipped_events, stats.out_of_order_events
    );

    if !stats.is_clean() {
        warn!("Recording {} has integrity anomalies", session_id);
        std::process::exit(2);
    }

    Ok(())
}
