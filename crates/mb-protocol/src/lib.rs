//! mb-protocol: wire codec for the machine control-server protocol.
//!
//! The control server speaks a framed, key/value text protocol: each message
//! is `0x01 <header> [0x02 <body>] 0x03`, where header and body are
//! `;`-separated field dictionaries with dynamically typed values.  After the
//! authentication handshake every byte on the data port is XOR-obfuscated
//! with a single-byte session key.
//!
//! This crate is pure: framing, field encoding/decoding, value typing, the
//! embedded-object mini-grammar, and the obfuscation primitive.  Socket
//! handling lives in the monitor service.
//!
//! # UTF-8 requirement
//!
//! Frame contents must be valid UTF-8; invalid bytes are rejected as a
//! protocol error, never silently rewritten.

pub mod frame;
pub mod message;
pub mod obfuscate;
pub mod value;

pub use frame::{FRAME_BODY, FRAME_END, FRAME_START, FrameBuffer, parse_payload};
pub use message::{FieldMap, Message};
pub use obfuscate::XorKey;
pub use value::{Scalar, Value, parse_embedded};

/// Errors arising while decoding wire payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}
