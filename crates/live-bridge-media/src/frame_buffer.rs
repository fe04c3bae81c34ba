//! Byte accumulator that yields fixed-size PCM frames.

use bytes::{Bytes, BytesMut};

/// Accumulates raw 16-bit PCM bytes and hands them out one frame at a time.
///
/// Chunk boundaries are irrelevant: bytes are consumed strictly in FIFO order
/// and every successful [`FrameBuffer::pop_frame`] returns exactly
/// `frame_bytes` bytes.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(frame_bytes * 4),
            frame_bytes,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether at least one whole frame is buffered.
    pub fn has_frame(&self) -> bool {
        self.buf.len() >= self.frame_bytes
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append one frame-equivalent of silence.
    pub fn pad_silence(&mut self) {
        self.buf.resize(self.buf.len() + self.frame_bytes, 0);
    }

    /// Take exactly one frame from the front, keeping the remainder.
    pub fn pop_frame(&mut self) -> Option<Bytes> {
        if !self.has_frame() {
            return None;
        }
        Some(self.buf.split_to(self.frame_bytes).freeze())
    }

    /// Drop whatever is buffered. Returns the number of bytes discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }
}
