//! Per-connection multipart MJPEG loop.
//!
//! Each `/stream.mjpg` response body is its own wait → write cycle over a
//! [`Subscriber`]. Hyper polls the body as fast as the client socket drains,
//! so a slow client only delays its own stream. When a write fails or the
//! client goes away the body is dropped, which ends the loop and releases
//! the subscriber.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use camstream_common::assembler::Subscriber;
use camstream_common::frame::Frame;
use futures_util::stream::{self, Stream, StreamExt};
use tracing::{info, trace};

pub const BOUNDARY: &str = "FRAME";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=FRAME";

const PART_TRAILER: &[u8] = b"\r\n";

/// Boundary line and part headers for a JPEG of `len` bytes.
pub fn part_header(len: usize) -> Bytes {
    Bytes::from(format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n"
    ))
}

/// One multipart part: headers, the frame itself (shared, not copied), and
/// the separator.
pub fn encode_part(frame: &Frame) -> [Bytes; 3] {
    [
        part_header(frame.len()),
        frame.data.clone(),
        Bytes::from_static(PART_TRAILER),
    ]
}

/// Connection-scoped state. Dropping it is the client's removal.
struct StreamSession {
    subscriber: Subscriber,
    peer: SocketAddr,
    frames_sent: u64,
    clients: Arc<AtomicUsize>,
}

impl StreamSession {
    fn new(subscriber: Subscriber, peer: SocketAddr, clients: Arc<AtomicUsize>) -> Self {
        let connected = clients.fetch_add(1, Ordering::Relaxed) + 1;
        info!(peer = %peer, clients = connected, "streaming client connected");
        Self {
            subscriber,
            peer,
            frames_sent: 0,
            clients,
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let remaining = self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        info!(
            peer = %self.peer,
            frames_sent = self.frames_sent,
            last_seq = self.subscriber.last_seq(),
            clients = remaining,
            "removed streaming client"
        );
    }
}

/// Endless multipart body for one client.
///
/// Yields the three pieces of [`encode_part`] for every frame the subscriber
/// wakes up to. Ends only if the assembler goes away.
pub fn multipart_stream(
    subscriber: Subscriber,
    peer: SocketAddr,
    clients: Arc<AtomicUsize>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    let session = StreamSession::new(subscriber, peer, clients);

    stream::unfold(session, |mut session| async move {
        match session.subscriber.wait_for_next_frame().await {
            Ok(frame) => {
                session.frames_sent += 1;
                trace!(
                    peer = %session.peer,
                    seq = frame.seq,
                    bytes = frame.len(),
                    age_ms = frame.age().num_milliseconds(),
                    "sending frame"
                );
                let parts = stream::iter(encode_part(&frame).map(Ok::<_, io::Error>));
                Some((parts, session))
            }
            Err(e) => {
                info!(peer = %session.peer, error = %e, "frame source closed, ending stream");
                None
            }
        }
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use camstream_common::assembler::FrameAssembler;
    use camstream_common::frame::JPEG_SOI;

    use super::*;

    type PartStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

    fn marked(body: &[u8]) -> Vec<u8> {
        [JPEG_SOI.as_slice(), body].concat()
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn open(assembler: &FrameAssembler, port: u16, clients: &Arc<AtomicUsize>) -> PartStream {
        Box::pin(multipart_stream(
            assembler.subscribe(),
            peer(port),
            Arc::clone(clients),
        ))
    }

    async fn next_part(stream: &mut PartStream) -> Vec<u8> {
        let mut part = Vec::new();
        for _ in 0..3 {
            part.extend_from_slice(&stream.next().await.unwrap().unwrap());
        }
        part
    }

    #[test]
    fn part_framing() {
        let frame = Frame::new(Bytes::from(marked(b"abc")), 0, 1);
        let encoded = encode_part(&frame).concat();
        assert_eq!(
            encoded,
            b"--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n\r\n\xFF\xD8abc\r\n"
        );
    }

    #[test]
    fn part_shares_frame_bytes() {
        let frame = Frame::new(Bytes::from(marked(b"abc")), 0, 1);
        let [_, body, _] = encode_part(&frame);
        assert_eq!(body.as_ptr(), frame.data.as_ptr());
    }

    #[tokio::test]
    async fn streams_each_published_frame() {
        let assembler = FrameAssembler::new();
        let clients = Arc::new(AtomicUsize::new(0));
        let mut stream = open(&assembler, 1000, &clients);

        assembler.ingest(&marked(b"one"));
        assembler.ingest(&marked(b"two"));
        let part = next_part(&mut stream).await;
        assert!(part.starts_with(b"--FRAME\r\n"));
        assert!(part.ends_with(b"\xFF\xD8one\r\n"));

        assembler.ingest(&marked(b"three"));
        let part = next_part(&mut stream).await;
        assert!(part.ends_with(b"\xFF\xD8two\r\n"));
    }

    #[tokio::test]
    async fn dropping_one_client_leaves_the_other_untouched() {
        let assembler = FrameAssembler::new();
        let clients = Arc::new(AtomicUsize::new(0));
        let mut first = open(&assembler, 1001, &clients);
        let mut second = open(&assembler, 1002, &clients);
        assert_eq!(clients.load(Ordering::Relaxed), 2);

        assembler.ingest(&marked(&[1]));
        assembler.ingest(&marked(&[2]));

        // First client disappears after its part header went out.
        assert!(first.next().await.unwrap().is_ok());
        drop(first);
        assert_eq!(clients.load(Ordering::Relaxed), 1);
        assert_eq!(assembler.subscriber_count(), 1);

        let mut delivered = vec![next_part(&mut second).await];
        for i in 3..6u8 {
            assembler.ingest(&marked(&[i]));
            delivered.push(next_part(&mut second).await);
        }

        let expected: Vec<Vec<u8>> = (1..5u8)
            .map(|i| {
                let frame = Frame::new(Bytes::from(marked(&[i])), 0, i as u64);
                encode_part(&frame).concat()
            })
            .collect();
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn ends_when_assembler_goes_away() {
        let assembler = FrameAssembler::new();
        let clients = Arc::new(AtomicUsize::new(0));
        let mut stream = open(&assembler, 1003, &clients);
        drop(assembler);

        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(clients.load(Ordering::Relaxed), 0);
    }
}
