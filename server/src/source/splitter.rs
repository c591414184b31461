use bytes::{Bytes, BytesMut};
use camstream_common::frame::JPEG_SOI;

use super::find_subsequence;

/// Re-cuts raw encoder output so that every start-of-image marker begins a
/// new chunk.
///
/// Pipe reads land anywhere inside a frame. The assembler only recognises a
/// frame start at the head of a chunk, so reads are split at each marker.
/// A trailing `0xFF` is held back until the next read in case it is the first
/// half of a marker.
pub struct MarkerSplitter {
    pending: BytesMut,
}

impl MarkerSplitter {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut chunks = Vec::new();

        // Search from offset 1: a marker at offset 0 already heads its chunk.
        while self.pending.len() > 1 {
            match find_subsequence(&self.pending[1..], &JPEG_SOI) {
                Some(pos) => chunks.push(self.pending.split_to(pos + 1).freeze()),
                None => break,
            }
        }

        let flush = match self.pending.last() {
            Some(&0xFF) => self.pending.len() - 1,
            _ => self.pending.len(),
        };
        if flush > 0 {
            chunks.push(self.pending.split_to(flush).freeze());
        }

        chunks
    }

    /// Remaining held-back bytes at end of stream.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}
