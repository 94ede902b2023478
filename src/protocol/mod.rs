//! Wire protocol.
//!
//! Every message in either direction is one [`frame::Frame`]: a one-byte type
//! tag, a big-endian `u32` length, and that many payload bytes.

pub mod frame;

pub use frame::{
    decode, decode_with_limit, encode, Decoded, Frame, FrameDecoder, FrameError, FrameType,
    FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
