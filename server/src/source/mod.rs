//! Frame producers feeding the [`FrameAssembler`].
//!
//! Exactly one source runs per process. It restarts with exponential backoff
//! whenever the encoder exits or the upstream connection drops, and resets
//! the assembler first so a truncated frame is never published.

pub mod command;
pub mod mjpeg;
pub mod splitter;

use std::sync::Arc;
use std::time::Duration;

use camstream_common::assembler::FrameAssembler;
use camstream_common::config::{CameraConfig, SourceMode};
use tracing::{info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to spawn encoder {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("encoder stdout not captured")]
    NoStdout,
    #[error("failed to read encoder output: {0}")]
    Read(std::io::Error),
    #[error("encoder exited with {0}")]
    Exited(String),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

/// Run the configured source forever.
pub async fn run_source(camera: CameraConfig, assembler: Arc<FrameAssembler>) {
    match camera.source {
        SourceMode::Command => command::run_command_source(&camera, assembler).await,
        SourceMode::Mjpeg => mjpeg::run_mjpeg_source(&camera, assembler).await,
    }
}

/// Drop the partial frame before the source restarts, reporting how stale the
/// last published frame is.
fn reset_for_restart(assembler: &FrameAssembler) {
    match assembler.current() {
        Some(frame) => info!(
            seq = frame.seq,
            published_at = %frame.captured_at(),
            age_ms = frame.age().num_milliseconds(),
            "source stopped, clients keep waiting on the last frame"
        ),
        None => warn!("source stopped before publishing any frame"),
    }
    assembler.reset();
}

/// Find the position of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
