//! Encoder and decoder seams
//!
//! The session treats frame serialization and parsing as external
//! collaborators behind these two traits. [`crate::wire`] provides the
//! default pair; tests substitute recording or scripted fakes.

use bytes::{Bytes, BytesMut};

use crate::error::Result;

/// Serializes frames into a caller-provided buffer.
///
/// Masking is decided at construction (clients mask, servers do not);
/// there is no per-frame override. Write errors surface when the session
/// owner flushes the buffer to the transport, so the only errors raised
/// here are encode-level rejections such as oversized control payloads.
pub trait FrameSink {
    /// Encode a data frame. The first non-final frame of a message carries
    /// the text/binary opcode, subsequent fragments are continuations.
    fn data(&mut self, buf: &mut BytesMut, payload: &[u8], binary: bool, fin: bool) -> Result<()>;

    /// Encode a ping control frame
    fn ping(&mut self, buf: &mut BytesMut, payload: &[u8]) -> Result<()>;

    /// Encode a pong control frame
    fn pong(&mut self, buf: &mut BytesMut, payload: &[u8]) -> Result<()>;

    /// Encode a close control frame
    fn close(&mut self, buf: &mut BytesMut, code: u16, reason: &str) -> Result<()>;
}

/// Consumes transport bytes and emits decoded frame events.
pub trait FrameSource {
    /// Append bytes to the decode buffer and push every event that
    /// completes onto `out`, in wire order.
    ///
    /// A protocol violation stops decoding and returns
    /// [`crate::Error::Protocol`]; events decoded before the violation are
    /// still delivered through `out`.
    fn add(&mut self, bytes: &[u8], out: &mut Vec<WireEvent>) -> Result<()>;
}

/// A decoded frame event
///
/// Text and binary events carry one complete logical message; fragment
/// reassembly happens inside the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Complete text message (UTF-8 validated)
    Text(Bytes),
    /// Complete binary message
    Binary(Bytes),
    /// Ping control frame
    Ping(Bytes),
    /// Pong control frame
    Pong(Bytes),
    /// Close control frame
    Close {
        /// Close code, absent for an empty close payload
        code: Option<u16>,
        /// Close reason (UTF-8 validated)
        reason: String,
    },
}
