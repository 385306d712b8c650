//! Bridge wire format.
//!
//! Each stream buffer travels as one length-prefixed message with a
//! 10-byte header:
//!
//! ```text
//! ┌─────────┬───────┬──────────┬──────────┐
//! │ Channel │ Flags │ Error    │ Size     │
//! │ 1 byte  │ 1 byte│ 4 bytes  │ 4 bytes  │
//! │         │       │ u32 BE   │ u32 BE   │
//! └─────────┴───────┴──────────┴──────────┘
//! ```
//!
//! Flag bit 0 is the continue flag: more buffer messages belong to the
//! same frame. All multi-byte integers are big endian.

use bytes::BytesMut;

use crate::error::{DaqError, Result};
use crate::stream::frame::error_bits;
use crate::stream::{Buffer, Frame};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Default maximum buffer payload (matches the 28-bit frame size domain).
pub const DEFAULT_MAX_PAYLOAD: u32 = 0x0FFF_FFFF;

/// Flag constants for buffer messages.
pub mod flags {
    /// More buffer messages belong to the current frame.
    pub const CONT: u8 = 0b0000_0001;

    /// Reserved bits mask (bits 1-7).
    pub const RESERVED_MASK: u8 = 0b1111_1110;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded buffer-message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Frame channel (0..255).
    pub channel: u8,
    /// Flags byte (see [`flags`]).
    pub flags: u8,
    /// Buffer error bits.
    pub error: u32,
    /// Payload length in bytes.
    pub size: u32,
}

impl BufferHeader {
    pub fn new(channel: u8, flags: u8, error: u32, size: u32) -> Self {
        Self {
            channel,
            flags,
            error,
            size,
        }
    }

    /// Encode the header to bytes (big endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.channel;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.error.to_be_bytes());
        buf[6..10].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Decode a header from bytes; `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            channel: buf[0],
            flags: buf[1],
            error: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            size: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Validate for protocol compliance.
    pub fn validate(&self, max_payload: u32) -> Result<()> {
        if self.size > max_payload {
            return Err(DaqError::Protocol(format!(
                "buffer payload {} exceeds maximum {}",
                self.size, max_payload
            )));
        }
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(DaqError::Protocol(
                "reserved flag bits must be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// More buffers follow in this frame.
    #[inline]
    pub fn is_cont(&self) -> bool {
        flags::has_flag(self.flags, flags::CONT)
    }
}

/// Serialise a frame as one message per buffer.
///
/// The continue flag is set on every message except the last; an empty
/// frame still produces a single zero-length message so frame boundaries
/// survive the wire.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let total: usize = frame.payload() + HEADER_SIZE * frame.buffer_count().max(1);
    let mut out = Vec::with_capacity(total);
    let count = frame.buffer_count();
    if count == 0 {
        let header = BufferHeader::new(frame.channel(), 0, frame.error(), 0);
        out.extend_from_slice(&header.encode());
        return out;
    }
    for (i, buf) in frame.buffers().iter().enumerate() {
        let cont = if i + 1 < count { flags::CONT } else { 0 };
        let header = BufferHeader::new(frame.channel(), cont, buf.error(), buf.size() as u32);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(buf.data());
    }
    out
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: BufferHeader },
}

/// Reassembles frames from a fragmented byte stream.
///
/// Buffer messages accumulate into the current frame until one arrives
/// with the continue flag clear. On connection loss the in-flight partial
/// frame is surfaced through [`take_partial`](Self::take_partial) with its
/// error bits set.
pub struct FrameAssembler {
    buffer: BytesMut,
    state: State,
    partial: Frame,
    partial_dirty: bool,
    max_payload: u32,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            partial: Frame::new(false),
            partial_dirty: false,
            max_payload,
        }
    }

    /// Push received bytes, extracting every completed frame.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = BufferHeader::decode(&self.buffer[..HEADER_SIZE])
                        .expect("buffer has enough bytes");
                    header.validate(self.max_payload)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForPayload { header };
                }
                State::WaitingForPayload { header } => {
                    if self.buffer.len() < header.size as usize {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(header.size as usize);
                    let mut buf = Buffer::from_vec(payload.to_vec(), None);
                    buf.set_size(header.size as usize)
                        .expect("payload sized from header");
                    buf.set_error(header.error);
                    self.partial.set_channel(header.channel);
                    self.partial.append_buffer(buf);
                    self.partial_dirty = true;
                    self.state = State::WaitingForHeader;

                    if !header.is_cont() {
                        self.partial_dirty = false;
                        return Ok(Some(std::mem::replace(&mut self.partial, Frame::new(false))));
                    }
                }
            }
        }
    }

    /// Surrender the in-flight partial frame after a connection drop.
    ///
    /// Any accumulated buffers come back as a frame flagged
    /// `TRUNCATED | DISCARDED`; buffered bytes and parser state reset.
    pub fn take_partial(&mut self) -> Option<Frame> {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
        if !self.partial_dirty {
            return None;
        }
        self.partial_dirty = false;
        let mut frame = std::mem::replace(&mut self.partial, Frame::new(false));
        frame.set_error(error_bits::TRUNCATED | error_bits::DISCARDED);
        Some(frame)
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_frame(channel: u8, data: &[u8]) -> Frame {
        let mut frame = Frame::heap(data.len());
        frame.write_bytes(0, data).unwrap();
        frame.set_channel(channel);
        frame
    }

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = BufferHeader::new(3, flags::CONT, 0x0104, 512);
        let decoded = BufferHeader::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_layout() {
        let header = BufferHeader::new(0x01, 0x00, 0x02030405, 0x06070809);
        let bytes = header.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[2..6], &[0x02, 0x03, 0x04, 0x05]);
        assert_eq!(&bytes[6..10], &[0x06, 0x07, 0x08, 0x09]);
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(BufferHeader::decode(&[0u8; HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn test_validate_rejects_oversize_and_reserved() {
        assert!(BufferHeader::new(0, 0, 0, 100).validate(99).is_err());
        assert!(BufferHeader::new(0, 0x80, 0, 0).validate(100).is_err());
        assert!(BufferHeader::new(0, flags::CONT, 0, 10).validate(100).is_ok());
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = payload_frame(5, &[1, 2, 3, 4]);
        let bytes = encode_frame(&frame);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel(), 5);
        let data: Vec<u8> = frames[0].iter().collect();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_multi_buffer_frame_glued_by_cont() {
        let mut frame = Frame::new(false);
        for chunk in [&[1u8, 2][..], &[3, 4][..], &[5][..]] {
            let mut buf = Buffer::alloc(chunk.len());
            buf.data_mut().unwrap().copy_from_slice(chunk);
            buf.set_size(chunk.len()).unwrap();
            frame.append_buffer(buf);
        }
        frame.set_channel(9);

        let bytes = encode_frame(&frame);
        let mut asm = FrameAssembler::new();
        let frames = asm.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].buffer_count(), 3);
        let data: Vec<u8> = frames[0].iter().collect();
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_fragmented_push() {
        let frame = payload_frame(1, b"fragmented payload");
        let bytes = encode_frame(&frame);

        let mut asm = FrameAssembler::new();
        for byte in &bytes[..bytes.len() - 1] {
            assert!(asm.push(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        let frames = asm.push(&bytes[bytes.len() - 1..]).unwrap();
        assert_eq!(frames.len(), 1);
        let data: Vec<u8> = frames[0].iter().collect();
        assert_eq!(data, b"fragmented payload");
    }

    #[test]
    fn test_multiple_frames_in_sequence() {
        let mut bytes = Vec::new();
        for i in 0..5u8 {
            bytes.extend(encode_frame(&payload_frame(i, &[i; 3])));
        }
        let mut asm = FrameAssembler::new();
        let frames = asm.push(&bytes).unwrap();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.channel(), i as u8);
        }
    }

    #[test]
    fn test_empty_frame_survives_wire() {
        let frame = Frame::new(false);
        let bytes = encode_frame(&frame);
        assert_eq!(bytes.len(), HEADER_SIZE);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_error_bits_travel() {
        let mut frame = payload_frame(0, &[1]);
        frame.buffers_mut()[0].set_error(0x02);
        let bytes = encode_frame(&frame);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&bytes).unwrap();
        assert_eq!(frames[0].error(), 0x02);
    }

    #[test]
    fn test_take_partial_flags_discard() {
        // One complete buffer message with CONT set, then the connection
        // "drops" mid-frame.
        let mut bytes = Vec::new();
        let header = BufferHeader::new(4, flags::CONT, 0, 2);
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(&[1, 2]);

        let mut asm = FrameAssembler::new();
        assert!(asm.push(&bytes).unwrap().is_empty());

        let partial = asm.take_partial().unwrap();
        assert_ne!(partial.error() & error_bits::TRUNCATED, 0);
        assert_ne!(partial.error() & error_bits::DISCARDED, 0);
        let data: Vec<u8> = partial.iter().collect();
        assert_eq!(data, vec![1, 2]);

        // Assembler is clean afterwards.
        assert!(asm.take_partial().is_none());
    }

    #[test]
    fn test_oversize_payload_is_protocol_error() {
        let header = BufferHeader::new(0, 0, 0, 1000);
        let mut asm = FrameAssembler::with_max_payload(100);
        let result = asm.push(&header.encode());
        assert!(matches!(result, Err(DaqError::Protocol(_))));
    }
}
