use bytes::Bytes;

/// JPEG start-of-image marker. Every frame the encoder emits begins with it.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Returns true if `chunk` opens a new JPEG frame.
pub fn starts_frame(chunk: &[u8]) -> bool {
    chunk.starts_with(&JPEG_SOI)
}

/// A complete JPEG frame as published by the assembler.
///
/// Cloning is cheap: `data` is reference counted, so every subscriber that
/// receives the same publication shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    /// Generation number. Starts at 1 and increases by one per publish.
    pub seq: u64,
    /// Unix millis at publication.
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(data: Bytes, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data,
            seq,
            captured_at_ms,
        }
    }

    /// Returns the size of the JPEG data in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wall-clock capture time, falling back to now for out-of-range values.
    pub fn captured_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.captured_at_ms)
            .unwrap_or_else(chrono::Utc::now)
    }

    /// Time since publication.
    pub fn age(&self) -> chrono::TimeDelta {
        chrono::Utc::now() - self.captured_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_detection() {
        assert!(starts_frame(&[0xFF, 0xD8, 0xFF, 0xE0]));
        assert!(starts_frame(&[0xFF, 0xD8]));
        assert!(!starts_frame(&[0xFF]));
        assert!(!starts_frame(&[]));
        assert!(!starts_frame(&[0x00, 0xFF, 0xD8]));
    }

    #[test]
    fn frame_accessors() {
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 1708300000000, 3);
        assert_eq!(frame.len(), 4);
        assert!(!frame.is_empty());
        assert!(starts_frame(&frame.data));
        assert_eq!(frame.seq, 3);
        assert_eq!(frame.captured_at().timestamp_millis(), 1708300000000);
    }

    #[test]
    fn age_counts_from_publication() {
        let published = chrono::Utc::now().timestamp_millis() - 1500;
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8]), published, 1);
        let age = frame.age().num_milliseconds();
        assert!((1500..60_000).contains(&age), "age {age}");
    }

    #[test]
    fn clones_share_data() {
        let frame = Frame::new(Bytes::from(vec![0xFF, 0xD8, 1, 2, 3]), 0, 1);
        let copy = frame.clone();
        assert_eq!(frame.data.as_ptr(), copy.data.as_ptr());
    }
}
