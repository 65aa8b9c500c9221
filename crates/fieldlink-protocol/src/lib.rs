//! Fieldlink Protocol -- wire frames, stream codec, reassembly.
//!
//! Every message is a single length-prefixed frame:
//!   [len: u8][type: u8][seq: u16 BE][payload ...]
//! where `len` counts the whole frame including itself. Heartbeats carry no
//! sequence number; their seq bytes are zero-filled.

pub mod codec;
pub mod frame;

pub use codec::{FrameCodec, ReassemblyBuffer};
pub use frame::{Frame, Message, Payload};

/// Poll request.
pub const KIND_POLL: u8 = 0x01;

/// Poll acknowledgment.
pub const KIND_ACK: u8 = 0x11;

/// Liveness probe from the relay towards the poller.
pub const KIND_HEARTBEAT: u8 = 0xFE;

/// Payload sentinel for an ordinary poll.
pub const PAYLOAD_NORMAL: [u8; 2] = [0x00, 0x00];

/// Payload sentinel asking the receiving node to shut down.
pub const PAYLOAD_SHUTDOWN: [u8; 2] = [0xFF, 0xFF];

/// Length + type + seq.
pub const HEADER_LEN: usize = 4;

/// The length prefix is a single byte.
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Sequence number correlating a poll with its acknowledgment.
pub type PackId = u16;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {len} byte(s), no type field")]
    Malformed { len: usize },
    #[error("truncated frame: type {kind:#04x} needs 4 bytes, got {len}")]
    Truncated { kind: u8, len: usize },
    #[error("zero length prefix")]
    ZeroLength,
    #[error("frame too large: {size} bytes (max 255)")]
    FrameTooLarge { size: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
