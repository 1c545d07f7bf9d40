//! Frame extraction and stream reassembly.
//!
//! A frame on the wire is `0x01 <header> [0x02 <body>] 0x03`.  A single
//! read may return zero, one, or many frames, and a frame boundary may fall
//! anywhere; [`FrameBuffer`] joins partial frames across reads and extracts
//! each complete frame non-greedily between a `0x01` and the next `0x03`.
//! Bytes outside framing are discarded.

use crate::ProtocolError;
use crate::message::Message;

pub const FRAME_START: u8 = 0x01;
pub const FRAME_BODY: u8 = 0x02;
pub const FRAME_END: u8 = 0x03;

/// Reassembly buffer for a framed byte stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer::default()
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, returning the bytes between the
    /// delimiters.  Leading garbage and empty frames are dropped.  Returns
    /// `None` when the buffer holds no complete frame; any partial frame is
    /// retained for the next read.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = match self.buf.iter().position(|&b| b == FRAME_START) {
                Some(p) => p,
                None => {
                    // No frame start anywhere: everything is garbage.
                    self.buf.clear();
                    return None;
                }
            };
            let end = self.buf[start + 1..]
                .iter()
                .position(|&b| b == FRAME_END)
                .map(|p| start + 1 + p);
            match end {
                None => {
                    // Partial frame: keep from the start marker onward.
                    self.buf.drain(..start);
                    return None;
                }
                Some(end) => {
                    let inner = self.buf[start + 1..end].to_vec();
                    self.buf.drain(..=end);
                    if inner.is_empty() {
                        continue;
                    }
                    return Some(inner);
                }
            }
        }
    }

    /// Extract and decode every complete frame currently buffered.
    pub fn drain_messages(&mut self) -> Result<Vec<Message>, ProtocolError> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame() {
            out.push(Message::from_frame(&frame)?);
        }
        Ok(out)
    }
}

/// One-shot convenience: decode every frame in `payload`.
pub fn parse_payload(payload: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    let mut buf = FrameBuffer::new();
    buf.extend(payload);
    buf.drain_messages()
}
