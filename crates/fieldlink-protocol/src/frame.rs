//! Frame type and message classification.
//!
//! A `Frame` keeps its raw bytes so the relay can forward it untouched;
//! `Frame::message` interprets them for the nodes that care about content.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    PackId, ProtocolError, HEADER_LEN, KIND_ACK, KIND_HEARTBEAT, KIND_POLL, MAX_FRAME_LEN,
    PAYLOAD_NORMAL, PAYLOAD_SHUTDOWN,
};

/// One complete length-prefixed frame, exactly as it appeared on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Bytes,
}

/// Payload of a poll or acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `00 00`
    Normal,
    /// `FF FF`
    Shutdown,
    Other(Bytes),
}

/// Interpreted frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Poll { seq: PackId, payload: Payload },
    Ack { seq: PackId, payload: Payload },
    Heartbeat,
    /// Any type byte the nodes do not act on.
    Unknown { kind: u8 },
}

impl Payload {
    fn classify(bytes: Bytes) -> Self {
        if bytes.as_ref() == PAYLOAD_NORMAL {
            Payload::Normal
        } else if bytes.as_ref() == PAYLOAD_SHUTDOWN {
            Payload::Shutdown
        } else {
            Payload::Other(bytes)
        }
    }
}

impl Frame {
    /// Encode a sequenced frame: `[4 + len(payload)][kind][seq BE][payload]`.
    pub fn encode(kind: u8, seq: PackId, payload: &[u8]) -> Result<Self, ProtocolError> {
        let size = HEADER_LEN + payload.len();
        if size > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { size });
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(size as u8);
        buf.put_u8(kind);
        buf.put_u16(seq);
        buf.extend_from_slice(payload);
        Ok(Self { raw: buf.freeze() })
    }

    /// `06 01 <seq> 00 00`
    pub fn poll(seq: PackId) -> Self {
        Self::fixed(KIND_POLL, seq, PAYLOAD_NORMAL)
    }

    /// `06 11 <seq> 00 00`
    pub fn ack(seq: PackId) -> Self {
        Self::fixed(KIND_ACK, seq, PAYLOAD_NORMAL)
    }

    /// `06 01 00 00 FF FF`
    pub fn shutdown() -> Self {
        Self::fixed(KIND_POLL, 0, PAYLOAD_SHUTDOWN)
    }

    /// `04 FE 00 00`
    pub fn heartbeat() -> Self {
        Self {
            raw: Bytes::from_static(&[HEADER_LEN as u8, KIND_HEARTBEAT, 0x00, 0x00]),
        }
    }

    fn fixed(kind: u8, seq: PackId, payload: [u8; 2]) -> Self {
        let [hi, lo] = seq.to_be_bytes();
        Self {
            raw: Bytes::copy_from_slice(&[6, kind, hi, lo, payload[0], payload[1]]),
        }
    }

    /// Wrap bytes already split off by the decoder. The first byte must equal
    /// the slice length.
    pub(crate) fn from_raw(raw: Bytes) -> Self {
        debug_assert_eq!(raw.first().map(|&n| n as usize), Some(raw.len()));
        Self { raw }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Type byte, if the frame is long enough to carry one.
    pub fn kind(&self) -> Option<u8> {
        self.raw.get(1).copied()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    /// Lowercase hex of the raw frame, for log lines.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.raw)
    }

    /// Interpret the frame. Fails only for frames too short for their type.
    pub fn message(&self) -> Result<Message, ProtocolError> {
        let len = self.raw.len();
        let kind = self.kind().ok_or(ProtocolError::Malformed { len })?;
        match kind {
            KIND_POLL | KIND_ACK => {
                if len < HEADER_LEN {
                    return Err(ProtocolError::Truncated { kind, len });
                }
                let seq = u16::from_be_bytes([self.raw[2], self.raw[3]]);
                let payload = Payload::classify(self.raw.slice(HEADER_LEN..));
                if kind == KIND_POLL {
                    Ok(Message::Poll { seq, payload })
                } else {
                    Ok(Message::Ack { seq, payload })
                }
            }
            KIND_HEARTBEAT => Ok(Message::Heartbeat),
            other => Ok(Message::Unknown { kind: other }),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.to_hex())
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}
