//! Default frame codec
//!
//! Implements the [`FrameSink`] / [`FrameSource`] collaborator contracts:
//! RFC 6455 frame headers with 7/16/64-bit payload lengths, client-side
//! masking, fragmented-message reassembly, and protocol-error detection
//! with the close code each violation maps to.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{FrameSink, FrameSource, WireEvent};
use crate::error::{CloseReason, Error, Result};
use crate::{Role, MAX_CONTROL_PAYLOAD};

/// Frame opcodes (RFC 6455 §5.2)
const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Payload length fitting the 7-bit field
const SMALL_PAYLOAD: usize = 125;
/// Payload length fitting the 16-bit extended field
const MEDIUM_PAYLOAD: usize = 65535;

/// XOR a payload with the 32-bit masking key
#[inline]
fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Generate a masking key
///
/// Uniqueness per frame is what the protocol needs; a per-process counter
/// mixed with the clock through a multiplicative hash provides it without
/// any RNG state.
fn generate_mask() -> [u8; 4] {
    use std::sync::atomic::{AtomicU64, Ordering};

    static FRAME_SEQ: AtomicU64 = AtomicU64::new(0);

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let seq = FRAME_SEQ.fetch_add(1, Ordering::Relaxed);
    let mixed = ((nanos << 32) | (seq & 0xFFFF_FFFF))
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .rotate_left(17);
    ((mixed >> 32) as u32).to_be_bytes()
}

/// Default frame encoder
///
/// Tracks fragmentation state so that the first frame of a message carries
/// the data opcode and subsequent fragments are continuations.
#[derive(Debug)]
pub struct WireEncoder {
    mask: bool,
    fragmenting: bool,
}

impl WireEncoder {
    /// Create an encoder for the given role
    pub fn new(role: Role) -> Self {
        Self {
            mask: role.masks_output(),
            fragmenting: false,
        }
    }

    /// Whether this encoder masks outbound frames
    #[inline]
    pub fn masks(&self) -> bool {
        self.mask
    }

    fn encode(&self, buf: &mut BytesMut, opcode: u8, payload: &[u8], fin: bool) {
        let mut b0 = opcode;
        if fin {
            b0 |= 0x80;
        }
        buf.put_u8(b0);

        let mask_bit = if self.mask { 0x80 } else { 0x00 };
        if payload.len() <= SMALL_PAYLOAD {
            buf.put_u8(mask_bit | payload.len() as u8);
        } else if payload.len() <= MEDIUM_PAYLOAD {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(payload.len() as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(payload.len() as u64);
        }

        if self.mask {
            let key = generate_mask();
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        } else {
            buf.put_slice(payload);
        }
    }

    fn control(&self, buf: &mut BytesMut, opcode: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Encoder("control payload exceeds 125 bytes"));
        }
        self.encode(buf, opcode, payload, true);
        Ok(())
    }
}

impl FrameSink for WireEncoder {
    fn data(&mut self, buf: &mut BytesMut, payload: &[u8], binary: bool, fin: bool) -> Result<()> {
        let opcode = if self.fragmenting {
            OP_CONTINUATION
        } else if binary {
            OP_BINARY
        } else {
            OP_TEXT
        };
        self.encode(buf, opcode, payload, fin);
        self.fragmenting = !fin;
        Ok(())
    }

    fn ping(&mut self, buf: &mut BytesMut, payload: &[u8]) -> Result<()> {
        self.control(buf, OP_PING, payload)
    }

    fn pong(&mut self, buf: &mut BytesMut, payload: &[u8]) -> Result<()> {
        self.control(buf, OP_PONG, payload)
    }

    fn close(&mut self, buf: &mut BytesMut, code: u16, reason: &str) -> Result<()> {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        self.control(buf, OP_CLOSE, &payload)
    }
}

fn protocol_err(reason: &'static str, code: u16) -> Error {
    Error::Protocol {
        reason,
        code: Some(code),
    }
}

/// Default frame decoder
///
/// Buffers transport bytes, enforces the masking rule for the peer's role,
/// reassembles fragmented data messages, and validates UTF-8 for text
/// payloads and close reasons.
#[derive(Debug)]
pub struct WireDecoder {
    expect_masked: bool,
    max_message_size: usize,
    buf: BytesMut,
    fragment: Option<(bool, BytesMut)>,
    failed: bool,
}

impl WireDecoder {
    /// Create a decoder for the given role
    ///
    /// A server expects masked input; a client expects unmasked input.
    pub fn new(role: Role, max_message_size: usize) -> Self {
        Self {
            expect_masked: role == Role::Server,
            max_message_size,
            buf: BytesMut::new(),
            fragment: None,
            failed: false,
        }
    }

    fn parse_frame(&mut self) -> Result<Option<(bool, u8, Bytes)>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];

        if b0 & 0x70 != 0 {
            return Err(protocol_err("reserved bits set", CloseReason::PROTOCOL_ERROR));
        }

        let opcode = b0 & 0x0F;
        if !matches!(
            opcode,
            OP_CONTINUATION | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG
        ) {
            return Err(protocol_err("reserved opcode", CloseReason::PROTOCOL_ERROR));
        }

        let fin = b0 & 0x80 != 0;
        let masked = b1 & 0x80 != 0;
        let len7 = (b1 & 0x7F) as usize;

        if opcode >= OP_CLOSE {
            if !fin {
                return Err(protocol_err(
                    "fragmented control frame",
                    CloseReason::PROTOCOL_ERROR,
                ));
            }
            if len7 > MAX_CONTROL_PAYLOAD {
                return Err(protocol_err(
                    "control payload exceeds 125 bytes",
                    CloseReason::PROTOCOL_ERROR,
                ));
            }
        }

        if masked != self.expect_masked {
            let reason = if self.expect_masked {
                "unmasked frame from client"
            } else {
                "masked frame from server"
            };
            return Err(protocol_err(reason, CloseReason::PROTOCOL_ERROR));
        }

        let ext_len = match len7 {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask_len = if masked { 4 } else { 0 };
        let header_len = 2 + ext_len + mask_len;
        if self.buf.len() < header_len {
            return Ok(None);
        }

        let payload_len = match len7 {
            126 => u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64,
            127 => u64::from_be_bytes([
                self.buf[2],
                self.buf[3],
                self.buf[4],
                self.buf[5],
                self.buf[6],
                self.buf[7],
                self.buf[8],
                self.buf[9],
            ]),
            _ => len7 as u64,
        };
        if payload_len > self.max_message_size as u64 {
            return Err(protocol_err("message too big", CloseReason::TOO_BIG));
        }
        let payload_len = payload_len as usize;

        if self.buf.len() < header_len + payload_len {
            return Ok(None);
        }

        let mut mask = [0u8; 4];
        if masked {
            mask.copy_from_slice(&self.buf[header_len - 4..header_len]);
        }

        self.buf.advance(header_len);
        let mut payload = self.buf.split_to(payload_len);
        if masked {
            apply_mask(&mut payload, mask);
        }

        Ok(Some((fin, opcode, payload.freeze())))
    }

    fn handle_frame(&mut self, fin: bool, opcode: u8, payload: Bytes) -> Result<Option<WireEvent>> {
        match opcode {
            OP_TEXT | OP_BINARY => {
                if self.fragment.is_some() {
                    return Err(protocol_err(
                        "expected continuation frame",
                        CloseReason::PROTOCOL_ERROR,
                    ));
                }
                let binary = opcode == OP_BINARY;
                if fin {
                    Ok(Some(complete_message(binary, payload)?))
                } else {
                    let mut buf = BytesMut::with_capacity(payload.len());
                    buf.extend_from_slice(&payload);
                    self.fragment = Some((binary, buf));
                    Ok(None)
                }
            }
            OP_CONTINUATION => {
                let (binary, mut buf) = self
                    .fragment
                    .take()
                    .ok_or(protocol_err(
                        "unexpected continuation frame",
                        CloseReason::PROTOCOL_ERROR,
                    ))?;
                if buf.len() + payload.len() > self.max_message_size {
                    return Err(protocol_err("message too big", CloseReason::TOO_BIG));
                }
                buf.extend_from_slice(&payload);
                if fin {
                    Ok(Some(complete_message(binary, buf.freeze())?))
                } else {
                    self.fragment = Some((binary, buf));
                    Ok(None)
                }
            }
            OP_CLOSE => Ok(Some(parse_close(&payload)?)),
            OP_PING => Ok(Some(WireEvent::Ping(payload))),
            OP_PONG => Ok(Some(WireEvent::Pong(payload))),
            _ => unreachable!("opcode validated in parse_frame"),
        }
    }
}

fn complete_message(binary: bool, payload: Bytes) -> Result<WireEvent> {
    if binary {
        Ok(WireEvent::Binary(payload))
    } else {
        if std::str::from_utf8(&payload).is_err() {
            return Err(protocol_err(
                "invalid UTF-8 in text message",
                CloseReason::INVALID_PAYLOAD,
            ));
        }
        Ok(WireEvent::Text(payload))
    }
}

fn parse_close(payload: &[u8]) -> Result<WireEvent> {
    if payload.is_empty() {
        return Ok(WireEvent::Close {
            code: None,
            reason: String::new(),
        });
    }
    if payload.len() == 1 {
        return Err(protocol_err(
            "invalid close frame payload",
            CloseReason::PROTOCOL_ERROR,
        ));
    }

    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !CloseReason::is_valid_code(code) {
        return Err(protocol_err("invalid close code", CloseReason::PROTOCOL_ERROR));
    }

    let reason = std::str::from_utf8(&payload[2..])
        .map_err(|_| protocol_err("invalid UTF-8 in close reason", CloseReason::INVALID_PAYLOAD))?;

    Ok(WireEvent::Close {
        code: Some(code),
        reason: reason.to_owned(),
    })
}

impl FrameSource for WireDecoder {
    fn add(&mut self, bytes: &[u8], out: &mut Vec<WireEvent>) -> Result<()> {
        if self.failed {
            return Ok(());
        }

        self.buf.extend_from_slice(bytes);

        loop {
            let frame = match self.parse_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            };
            let (fin, opcode, payload) = frame;
            match self.handle_frame(fin, opcode, payload) {
                Ok(Some(event)) => out.push(event),
                Ok(None) => {}
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut WireDecoder, bytes: &[u8]) -> Result<Vec<WireEvent>> {
        let mut out = Vec::new();
        decoder.add(bytes, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_encode_server_text_frame() {
        let mut encoder = WireEncoder::new(Role::Server);
        let mut buf = BytesMut::new();
        encoder.data(&mut buf, b"test", false, true).unwrap();

        assert_eq!(buf[0], 0x81); // FIN + Text
        assert_eq!(buf[1], 0x04); // Length 4, no mask
        assert_eq!(&buf[2..], b"test");
    }

    #[test]
    fn test_client_frames_are_masked() {
        let mut encoder = WireEncoder::new(Role::Client);
        let mut buf = BytesMut::new();
        encoder.data(&mut buf, b"hello", false, true).unwrap();

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x80 | 0x05); // Mask bit + length 5
        assert_eq!(buf.len(), 2 + 4 + 5);

        // Unmasking with the embedded key recovers the payload
        let mask = [buf[2], buf[3], buf[4], buf[5]];
        let mut payload: Vec<u8> = buf[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn test_fragment_opcodes() {
        let mut encoder = WireEncoder::new(Role::Server);
        let mut buf = BytesMut::new();
        encoder.data(&mut buf, b"hel", false, false).unwrap();
        encoder.data(&mut buf, b"lo", false, true).unwrap();

        assert_eq!(buf[0], 0x01); // Text, not FIN
        assert_eq!(buf[5], 0x80); // Continuation + FIN
    }

    #[test]
    fn test_client_to_server_round_trip() {
        let mut encoder = WireEncoder::new(Role::Client);
        let mut decoder = WireDecoder::new(Role::Server, 1024);

        let mut buf = BytesMut::new();
        encoder.data(&mut buf, b"hel", false, false).unwrap();
        encoder.data(&mut buf, b"lo", false, true).unwrap();
        encoder.ping(&mut buf, b"p").unwrap();

        let events = decode_all(&mut decoder, &buf).unwrap();
        assert_eq!(
            events,
            vec![
                WireEvent::Text(Bytes::from_static(b"hello")),
                WireEvent::Ping(Bytes::from_static(b"p")),
            ]
        );
    }

    #[test]
    fn test_extended_length_encoding() {
        let mut encoder = WireEncoder::new(Role::Server);
        let mut decoder = WireDecoder::new(Role::Client, 1024 * 1024);

        let payload = vec![0xAB; 300];
        let mut buf = BytesMut::new();
        encoder.data(&mut buf, &payload, true, true).unwrap();
        assert_eq!(buf[1], 126);

        let events = decode_all(&mut decoder, &buf).unwrap();
        assert_eq!(events, vec![WireEvent::Binary(Bytes::from(payload))]);
    }

    #[test]
    fn test_partial_input_yields_nothing() {
        let mut encoder = WireEncoder::new(Role::Server);
        let mut decoder = WireDecoder::new(Role::Client, 1024);

        let mut buf = BytesMut::new();
        encoder.data(&mut buf, b"split me", false, true).unwrap();

        let (a, b) = buf.split_at(4);
        assert!(decode_all(&mut decoder, a).unwrap().is_empty());
        let events = decode_all(&mut decoder, b).unwrap();
        assert_eq!(events, vec![WireEvent::Text(Bytes::from_static(b"split me"))]);
    }

    #[test]
    fn test_unexpected_continuation() {
        let mut decoder = WireDecoder::new(Role::Client, 1024);
        // FIN + continuation with empty payload, unmasked
        let err = decode_all(&mut decoder, &[0x80, 0x00]).unwrap_err();
        assert_eq!(err.close_code(), Some(CloseReason::PROTOCOL_ERROR));
    }

    #[test]
    fn test_masking_mismatch() {
        let mut decoder = WireDecoder::new(Role::Server, 1024);
        // Server expects masked input; send unmasked text
        let err = decode_all(&mut decoder, &[0x81, 0x02, b'h', b'i']).unwrap_err();
        assert_eq!(err.close_code(), Some(CloseReason::PROTOCOL_ERROR));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let mut decoder = WireDecoder::new(Role::Client, 1024);
        let err = decode_all(&mut decoder, &[0x81, 0x02, 0xC3, 0x28]).unwrap_err();
        assert_eq!(err.close_code(), Some(CloseReason::INVALID_PAYLOAD));
    }

    #[test]
    fn test_close_frame_payload() {
        let mut encoder = WireEncoder::new(Role::Server);
        let mut decoder = WireDecoder::new(Role::Client, 1024);

        let mut buf = BytesMut::new();
        encoder.close(&mut buf, 1001, "going away").unwrap();

        let events = decode_all(&mut decoder, &buf).unwrap();
        assert_eq!(
            events,
            vec![WireEvent::Close {
                code: Some(1001),
                reason: "going away".into(),
            }]
        );
    }

    #[test]
    fn test_close_with_one_byte_payload() {
        let mut decoder = WireDecoder::new(Role::Client, 1024);
        let err = decode_all(&mut decoder, &[0x88, 0x01, 0x03]).unwrap_err();
        assert_eq!(err.close_code(), Some(CloseReason::PROTOCOL_ERROR));
    }

    #[test]
    fn test_oversized_control_payload_rejected() {
        let mut encoder = WireEncoder::new(Role::Server);
        let mut buf = BytesMut::new();
        let err = encoder.ping(&mut buf, &[0u8; 126]).unwrap_err();
        assert!(matches!(err, Error::Encoder(_)));
    }

    #[test]
    fn test_message_too_big() {
        let mut decoder = WireDecoder::new(Role::Client, 16);
        let mut encoder = WireEncoder::new(Role::Server);
        let mut buf = BytesMut::new();
        encoder.data(&mut buf, &[0u8; 32], true, true).unwrap();

        let err = decode_all(&mut decoder, &buf).unwrap_err();
        assert_eq!(err.close_code(), Some(CloseReason::TOO_BIG));
    }

    #[test]
    fn test_zero_length_terminal_fragment() {
        let mut encoder = WireEncoder::new(Role::Server);
        let mut decoder = WireDecoder::new(Role::Client, 1024);

        let mut buf = BytesMut::new();
        encoder.data(&mut buf, b"tail", false, false).unwrap();
        encoder.data(&mut buf, b"", false, true).unwrap();

        let events = decode_all(&mut decoder, &buf).unwrap();
        assert_eq!(events, vec![WireEvent::Text(Bytes::from_static(b"tail"))]);
    }

    #[test]
    fn test_decoder_stops_after_failure() {
        let mut decoder = WireDecoder::new(Role::Client, 1024);
        assert!(decode_all(&mut decoder, &[0xF1, 0x00]).is_err());
        // Subsequent input is ignored rather than re-parsed
        assert!(decode_all(&mut decoder, &[0x81, 0x00]).unwrap().is_empty());
    }
}
