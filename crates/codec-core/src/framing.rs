//! Base64 payload wrapping and fixed-size frame splitting
//!
//! Both peers carry audio as base64 strings inside JSON events. Telephony
//! additionally expects outbound media in 20 ms frames, so agent audio
//! arriving in arbitrary chunk sizes is re-cut with [`FrameSplitter`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};

use crate::error::{CodecError, Result};

/// Decode a base64 media payload
pub fn decode_payload(encoded: &str) -> Result<Bytes> {
    STANDARD
        .decode(encoded.trim())
        .map(Bytes::from)
        .map_err(|e| CodecError::invalid_base64(e.to_string()))
}

/// Encode raw audio bytes as a base64 media payload
pub fn encode_payload(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

/// Re-cuts a byte stream into fixed-size frames
///
/// Leftover bytes are held until the next push so frame boundaries stay
/// aligned across chunks. [`FrameSplitter::flush`] releases the remainder
/// as a short final frame.
#[derive(Debug)]
pub struct FrameSplitter {
    frame_len: usize,
    pending: BytesMut,
}

impl FrameSplitter {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len: frame_len.max(1),
            pending: BytesMut::with_capacity(frame_len * 2),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Bytes buffered but not yet emitted
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append a chunk and return every complete frame it finishes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_len);
        while self.pending.len() >= self.frame_len {
            frames.push(self.pending.split_to(self.frame_len).freeze());
        }
        frames
    }

    /// Emit whatever is buffered as a final, possibly short, frame
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }

    /// Drop buffered bytes without emitting them
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
