use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use camstream_common::assembler::FrameAssembler;
use camstream_common::config::CameraConfig;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use super::{find_subsequence, reset_for_restart, SourceError, INITIAL_BACKOFF, MAX_BACKOFF};

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Largest part accepted from upstream. Bigger parts are skipped.
pub const MAX_PART_SIZE: usize = 16 * 1024 * 1024;

/// Parse state for a multipart MJPEG stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes. With a known length the part ends after that
    /// many bytes, otherwise at the next boundary.
    CollectingJpeg { content_length: Option<usize> },
}

/// Incremental parser extracting JPEG bodies from a
/// `multipart/x-mixed-replace` byte stream.
pub struct MultipartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the next boundary.
    jpeg_start: usize,
    max_part_size: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self::with_max_part_size(boundary, MAX_PART_SIZE)
    }

    pub fn with_max_part_size(boundary: &str, max_part_size: usize) -> Self {
        Self {
            boundary: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
            max_part_size,
        }
    }

    /// Abandon the current part and look for the next boundary. Only a tail
    /// that could hold the start of a boundary is kept.
    fn skip_part(&mut self, reason: &str) {
        warn!(
            buffered = self.buffer.len(),
            max = self.max_part_size,
            reason,
            "skipping oversized upstream part"
        );
        let keep = self.buffer.len().min(self.boundary.len());
        let _ = self.buffer.split_to(self.buffer.len() - keep);
        self.jpeg_start = 0;
        self.state = ParseState::SeekingBoundary;
    }

    /// Feed bytes from the wire, returning every JPEG completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut jpegs = Vec::new();
        let boundary_len = self.boundary.len();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        // Discard everything up to and including the boundary
                        let _ = self.buffer.split_to(pos + boundary_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > boundary_len {
                            let _ = self.buffer.split_to(self.buffer.len() - boundary_len);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let headers = self.buffer.split_to(pos + HEADER_END.len());
                        let length = content_length(&headers);
                        if let Some(len) = length.filter(|&len| len > self.max_part_size) {
                            warn!(
                                content_length = len,
                                max = self.max_part_size,
                                "skipping oversized upstream part"
                            );
                            self.state = ParseState::SeekingBoundary;
                            continue;
                        }
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg {
                            content_length: length,
                        };
                    } else if self.buffer.len() > self.max_part_size {
                        self.skip_part("part headers never ended");
                        break;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg {
                    content_length: Some(len),
                } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let jpeg = self.buffer.split_to(len).freeze();
                    if !jpeg.is_empty() {
                        jpegs.push(jpeg);
                    }
                    self.state = ParseState::SeekingBoundary;
                }
                ParseState::CollectingJpeg {
                    content_length: None,
                } => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        if self.buffer.len() > self.max_part_size {
                            self.skip_part("no boundary after part");
                            break;
                        }
                        // Avoid re-scanning old data
                        self.jpeg_start = self.buffer.len().saturating_sub(boundary_len);
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let jpeg = self.buffer.split_to(end).freeze();
                    let _ = self.buffer.split_to(jpeg_end - end + boundary_len);
                    if !jpeg.is_empty() {
                        jpegs.push(jpeg);
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        jpegs
    }
}

/// Value of a `Content-Length` part header, if present and numeric.
fn content_length(headers: &[u8]) -> Option<usize> {
    std::str::from_utf8(headers).ok()?.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Relay an upstream MJPEG stream into the assembler.
/// Reconnects with exponential backoff on failure.
pub async fn run_mjpeg_source(camera: &CameraConfig, assembler: Arc<FrameAssembler>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        info!(url = camera.url, "connecting to upstream MJPEG stream");
        match consume_stream(&camera.url, &camera.boundary, &assembler).await {
            Ok(frames) => {
                info!(frames, "upstream stream ended cleanly, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(error = %e, "upstream stream error, reconnecting in {:?}", backoff);
            }
        }
        reset_for_restart(&assembler);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Consume one upstream connection. Returns the number of JPEGs relayed.
async fn consume_stream(
    url: &str,
    boundary: &str,
    assembler: &FrameAssembler,
) -> Result<u64, SourceError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(SourceError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to upstream MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new(boundary);
    let mut relayed: u64 = 0;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(SourceError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            if !camstream_common::frame::starts_frame(&jpeg) {
                warn!(bytes = jpeg.len(), "upstream part is not a JPEG, skipping");
                continue;
            }
            relayed += 1;
            debug!(relayed, bytes = jpeg.len(), "relaying upstream frame");
            assembler.ingest(&jpeg);
        }
    }

    Ok(relayed)
}
