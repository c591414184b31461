//! Frame assembly and latest-frame broadcast.
//!
//! The encoder hands over its output in arbitrary chunks. A chunk that starts
//! with the JPEG start-of-image marker opens a new frame, which is the only
//! point where the previous frame is known to be complete. So frame N is
//! published when the first chunk of frame N+1 arrives.
//!
//! ```text
//!   encoder ──ingest()──► Accumulator (Mutex<BytesMut>)
//!                              │ marker seen
//!                              ▼
//!                  watch slot: Option<Frame> (versioned)
//!                   │              │              │
//!                   ▼              ▼              ▼
//!              Subscriber     Subscriber     Subscriber
//!           wait_for_next_frame() ... one per client connection
//! ```
//!
//! Publishing never waits on readers. A reader that falls behind is handed
//! whatever is current when it wakes and never sees a backlog.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::frame::{starts_frame, Frame};

const INITIAL_BUFFER_CAPACITY: usize = 256 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssemblerError {
    #[error("frame assembler was dropped")]
    Closed,
}

/// Producer-side state. Only `ingest` and `reset` touch it.
struct Accumulator {
    buffer: BytesMut,
    seq: u64,
}

/// Turns a marker-delimited chunk stream into whole frames and broadcasts the
/// latest one to every [`Subscriber`].
pub struct FrameAssembler {
    accumulator: Mutex<Accumulator>,
    slot: watch::Sender<Option<Frame>>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            accumulator: Mutex::new(Accumulator {
                buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
                seq: 0,
            }),
            slot,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Accumulator> {
        self.accumulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one chunk of encoder output.
    ///
    /// If `chunk` starts with the start-of-image marker, everything
    /// accumulated before it is published as the new current frame and all
    /// waiting subscribers are woken. Accumulation then restarts with `chunk`.
    pub fn ingest(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        let mut acc = self.lock();

        // The first marker finds nothing accumulated. An empty buffer is never
        // published, so clients never get a zero-length part.
        if starts_frame(chunk) && !acc.buffer.is_empty() {
            let finished = acc.buffer.split().freeze();
            acc.seq += 1;
            let seq = acc.seq;
            let bytes = finished.len();
            if !starts_frame(&finished) {
                debug!(seq, bytes, "publishing data that does not begin with a frame marker");
            }
            let frame = Frame::new(finished, Utc::now().timestamp_millis(), seq);

            // send_replace succeeds with zero receivers and notifies every
            // receiver that exists.
            self.slot.send_replace(Some(frame));

            trace!(seq, bytes, "frame published");
            if seq % 100 == 0 {
                debug!(
                    seq,
                    bytes,
                    subscribers = self.subscriber_count(),
                    "frames published"
                );
            }
        }

        acc.buffer.extend_from_slice(chunk);
    }

    /// Drop the partially accumulated frame without publishing it.
    pub fn reset(&self) {
        let mut acc = self.lock();
        if !acc.buffer.is_empty() {
            debug!(bytes = acc.buffer.len(), "discarding partial frame");
            acc.buffer.clear();
        }
    }

    /// Register a new reader.
    ///
    /// The frame that is current at subscription time counts as already seen,
    /// so the first wait returns the next published frame.
    pub fn subscribe(&self) -> Subscriber {
        let rx = self.slot.subscribe();
        let last_seq = rx.borrow().as_ref().map_or(0, |frame| frame.seq);
        Subscriber { rx, last_seq }
    }

    /// The current frame, if any has been published.
    pub fn current(&self) -> Option<Frame> {
        self.slot.borrow().clone()
    }

    /// Number of frames published so far.
    pub fn published(&self) -> u64 {
        self.lock().seq
    }

    /// Bytes accumulated towards the next frame.
    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.slot.receiver_count()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client read handle on a [`FrameAssembler`].
pub struct Subscriber {
    rx: watch::Receiver<Option<Frame>>,
    last_seq: u64,
}

impl Subscriber {
    /// Wait until a frame newer than the last one returned is published, then
    /// return the frame that is current at wake time.
    ///
    /// Frames published while the caller was busy are skipped; sequence
    /// numbers returned to one subscriber are strictly increasing.
    pub async fn wait_for_next_frame(&mut self) -> Result<Frame, AssemblerError> {
        loop {
            self.rx
                .changed()
                .await
                .map_err(|_| AssemblerError::Closed)?;

            let latest = self.rx.borrow_and_update().clone();
            if let Some(frame) = latest {
                if frame.seq > self.last_seq {
                    self.last_seq = frame.seq;
                    return Ok(frame);
                }
            }
        }
    }

    /// Sequence number of the last frame this subscriber returned or skipped
    /// at subscription time.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}
