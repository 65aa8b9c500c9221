//! Length-prefixed frame codec for serial and TCP byte streams.
//!
//! Wire format: 1-byte total length (including itself) + frame body.
//! A read may carry zero, one or many frames, and a frame may span reads.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;
use crate::ProtocolError;

/// Codec for framing `Frame` values over a byte stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&declared) = src.first() else {
            return Ok(None);
        };
        let length = declared as usize;

        // A zero prefix never completes; drop it so the stream can resync.
        if length == 0 {
            src.advance(1);
            return Err(ProtocolError::ZeroLength);
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        Ok(Some(Frame::from_raw(src.split_to(length).freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

/// Per-connection accumulator for partial reads.
///
/// Bytes leave the buffer only as complete frames; the first buffered byte is
/// always the next frame's declared length. Malformed prefixes are logged and
/// skipped.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    buf: BytesMut,
    codec: FrameCodec,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(frame) => return frame,
                Err(e) => {
                    tracing::warn!(pending = self.buf.len(), "discarding bytes: {e}");
                }
            }
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
