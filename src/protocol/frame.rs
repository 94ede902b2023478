//! Binary frame codec.
//!
//! Frame format:
//! ```text
//! +----------+-------------------+--------------------+
//! | type     | length            | payload            |
//! | (1 byte) | (4 bytes, BE u32) | (length bytes)     |
//! +----------+-------------------+--------------------+
//! ```
//!
//! The same codec is used in both directions. Payloads are opaque bytes;
//! chat text is UTF-8 by convention but the codec never inspects it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Frame header size: 1 byte type + 4 bytes length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Default upper bound for a single payload (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Type tag carried in the first header byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Chat text.
    Simple = 0x00,
    /// Slash command (`/help`, `/list`, `/msg`).
    Command = 0x01,
    /// Newline-separated list of display names.
    ListUsers = 0x02,
    /// Login request (client) or assigned name (server).
    Login = 0x03,
}

impl FrameType {
    pub const ALL: [FrameType; 4] = [
        FrameType::Simple,
        FrameType::Command,
        FrameType::ListUsers,
        FrameType::Login,
    ];

    pub fn from_u8(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0x00 => Ok(FrameType::Simple),
            0x01 => Ok(FrameType::Command),
            0x02 => Ok(FrameType::ListUsers),
            0x03 => Ok(FrameType::Login),
            other => Err(FrameError::UnknownType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Payload interpreted as chat text. Invalid UTF-8 is replaced, not rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self) -> Bytes {
        encode(&self.payload, self.frame_type)
    }
}

/// Outcome of a decode attempt that did not fail.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of buffer bytes it occupied.
    Frame(Frame, usize),
    /// Header or payload not fully received yet.
    Incomplete,
}

/// Malformed input. The connection that produced it cannot be resynchronised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    UnknownType(u8),
    TooLarge { len: usize, max: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnknownType(tag) => write!(f, "unknown frame type 0x{tag:02x}"),
            FrameError::TooLarge { len, max } => {
                write!(f, "frame payload too large: {len} > {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode `payload` as a complete frame of type `frame_type`.
pub fn encode(payload: &[u8], frame_type: FrameType) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.put_u8(frame_type.as_u8());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}

/// Decode one frame from the start of `buf` using [`MAX_PAYLOAD_SIZE`].
pub fn decode(buf: &[u8]) -> Result<Decoded, FrameError> {
    decode_with_limit(buf, MAX_PAYLOAD_SIZE)
}

/// Decode one frame from the start of `buf`, rejecting payloads above `max`.
///
/// The tag and length are validated as soon as the header is available, so a
/// bad frame is reported without waiting for its (possibly huge) payload.
pub fn decode_with_limit(buf: &[u8], max: usize) -> Result<Decoded, FrameError> {
    let frame_type = match header(buf) {
        Some(result) => result?,
        None => return Ok(Decoded::Incomplete),
    };
    let len = match size(buf) {
        Some(len) => len as usize,
        None => return Ok(Decoded::Incomplete),
    };
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }

    let total = FRAME_HEADER_SIZE + len;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]);
    Ok(Decoded::Frame(Frame::new(frame_type, payload), total))
}

/// Type tag of the frame at the start of `buf`, if at least one byte is present.
pub fn header(buf: &[u8]) -> Option<Result<FrameType, FrameError>> {
    buf.first().map(|&tag| FrameType::from_u8(tag))
}

/// Declared payload length of the frame at the start of `buf`, once the
/// 5-byte header is present.
pub fn size(buf: &[u8]) -> Option<u32> {
    if buf.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let mut len = &buf[1..FRAME_HEADER_SIZE];
    Some(len.get_u32())
}

/// Accumulates stream bytes and pops complete frames in arrival order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_payload,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame. `Ok(None)` means more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_with_limit(&self.buf, self.max_payload)? {
            Decoded::Frame(frame, consumed) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let encoded = encode(b"hi", FrameType::Login);
        assert_eq!(&encoded[..], &[0x03, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_round_trip_all_types() {
        let payloads: [&[u8]; 4] = [b"", b"hello", b"a\0b\0", &[0xff, 0x00, 0x7f, 0x0a]];
        for frame_type in FrameType::ALL {
            for payload in payloads {
                let encoded = encode(payload, frame_type);
                match decode(&encoded).unwrap() {
                    Decoded::Frame(frame, consumed) => {
                        assert_eq!(frame.frame_type, frame_type);
                        assert_eq!(&frame.payload[..], payload);
                        assert_eq!(consumed, encoded.len());
                    }
                    other => panic!("unexpected: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_incomplete_header_and_payload() {
        let encoded = encode(b"hello", FrameType::Simple);
        for cut in 0..encoded.len() {
            assert_eq!(decode(&encoded[..cut]).unwrap(), Decoded::Incomplete);
        }
    }

    #[test]
    fn test_accessors_on_partial_buffer() {
        let encoded = encode(b"hello", FrameType::Command);
        assert!(header(&[]).is_none());
        assert_eq!(header(&encoded[..1]), Some(Ok(FrameType::Command)));
        assert_eq!(size(&encoded[..4]), None);
        assert_eq!(size(&encoded[..5]), Some(5));
    }

    #[test]
    fn test_unknown_type() {
        let buf = [0x09, 0, 0, 0, 0];
        assert_eq!(decode(&buf), Err(FrameError::UnknownType(0x09)));
    }

    #[test]
    fn test_length_over_limit() {
        let buf = [0x00, 0, 0, 1, 0];
        assert_eq!(
            decode_with_limit(&buf, 16),
            Err(FrameError::TooLarge { len: 256, max: 16 })
        );
    }

    #[test]
    fn test_decoder_splits_stream() {
        let mut decoder = FrameDecoder::default();
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(b"one", FrameType::Simple));
        stream.extend_from_slice(&encode(b"two", FrameType::Command));
        let (first, rest) = stream.split_at(6);

        decoder.extend(first);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend(rest);
        let a = decoder.next_frame().unwrap().unwrap();
        let b = decoder.next_frame().unwrap().unwrap();
        assert_eq!((a.frame_type, a.text().as_str()), (FrameType::Simple, "one"));
        assert_eq!((b.frame_type, b.text().as_str()), (FrameType::Command, "two"));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }
}
