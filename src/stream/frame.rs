//! Frames: ordered buffer sequences forming one logical message.

use crate::error::{DaqError, Result};
use crate::stream::Buffer;

/// Frame error bit layout.
///
/// The low byte mirrors the hardware error bits reported by the driver;
/// software conditions occupy the bits above it.
pub mod error_bits {
    /// Driver-reported hardware error bits.
    pub const HARDWARE_MASK: u32 = 0x0000_00FF;
    /// Frame ended early: short read or missing trailer.
    pub const TRUNCATED: u32 = 0x0000_0100;
    /// A positioned write ran past the reserved payload.
    pub const OVERFLOW: u32 = 0x0000_0200;
    /// Partial frame flushed during a bridge reconnect.
    pub const DISCARDED: u32 = 0x0000_0400;
}

/// Ordered sequence of buffers plus channel and error state.
///
/// A frame exclusively owns its buffers; the concatenated buffer payloads
/// are the frame payload. Appending a heap buffer to a zero-copy frame
/// downgrades the zero-copy flag.
#[derive(Debug, Default)]
pub struct Frame {
    buffers: Vec<Buffer>,
    channel: u8,
    error: u32,
    zero_copy: bool,
}

impl Frame {
    /// Create an empty frame with the given zero-copy disposition.
    pub fn new(zero_copy: bool) -> Self {
        Self {
            buffers: Vec::new(),
            channel: 0,
            error: 0,
            zero_copy,
        }
    }

    /// Create a frame backed by a single heap buffer of `capacity` bytes.
    pub fn heap(capacity: usize) -> Self {
        let mut frame = Self::new(false);
        frame.append_buffer(Buffer::alloc(capacity));
        frame
    }

    /// Append a buffer, folding its error bits into the frame.
    pub fn append_buffer(&mut self, buffer: Buffer) {
        if !buffer.is_zero_copy() {
            self.zero_copy = false;
        }
        self.error |= buffer.error();
        self.buffers.push(buffer);
    }

    /// Number of buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer-granular access.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Mutable buffer-granular access.
    pub fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers
    }

    /// Consume the frame, yielding its buffers in order.
    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers
    }

    /// Total payload across buffers.
    pub fn payload(&self) -> usize {
        self.buffers.iter().map(|b| b.size()).sum()
    }

    /// Sum of the available windows across buffers (write capacity).
    pub fn available(&self) -> usize {
        self.buffers.iter().map(|b| b.available()).sum()
    }

    /// True when the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload() == 0
    }

    /// True when every buffer maps a driver page.
    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy
    }

    /// Frame channel (0..255).
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    /// Aggregated error bits: frame-level bits OR-ed with every buffer's.
    pub fn error(&self) -> u32 {
        self.buffers
            .iter()
            .fold(self.error, |acc, b| acc | b.error())
    }

    /// OR additional error bits into the frame.
    pub fn set_error(&mut self, error: u32) {
        self.error |= error;
    }

    /// Iterate the payload bytes across buffers.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.buffers.iter().flat_map(|b| b.data().iter().copied())
    }

    /// Copy payload bytes starting at `offset` into `dst`.
    ///
    /// Random access within a buffer, forward across buffers.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if offset + dst.len() > self.payload() {
            return Err(DaqError::Protocol(format!(
                "read of {} at {} exceeds payload {}",
                dst.len(),
                offset,
                self.payload()
            )));
        }
        let mut skip = offset;
        let mut filled = 0;
        for buf in &self.buffers {
            let data = buf.data();
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let take = (data.len() - skip).min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&data[skip..skip + take]);
            filled += take;
            skip = 0;
            if filled == dst.len() {
                break;
            }
        }
        Ok(())
    }

    /// Write `src` into the frame starting at `offset`, growing each
    /// buffer's payload up to its available window.
    ///
    /// Writing past the reserved capacity sets the `OVERFLOW` error bit and
    /// fails; nothing is silently truncated.
    pub fn write_bytes(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        if offset + src.len() > self.available() {
            self.error |= error_bits::OVERFLOW;
            return Err(DaqError::Protocol(format!(
                "write of {} at {} exceeds capacity {}",
                src.len(),
                offset,
                self.available()
            )));
        }
        let mut skip = offset;
        let mut written = 0;
        for buf in &mut self.buffers {
            let avail = buf.available();
            if skip >= avail {
                skip -= avail;
                continue;
            }
            let take = (avail - skip).min(src.len() - written);
            let end = skip + take;
            buf.data_mut()?[skip..end].copy_from_slice(&src[written..written + take]);
            if end > buf.size() {
                buf.set_size(end)?;
            }
            written += take;
            skip = 0;
            if written == src.len() {
                break;
            }
        }
        Ok(())
    }

    /// Deep-copy the payload into a fresh heap frame (channel and error
    /// bits carried over). Used by fan-out, where each sink needs its own
    /// exclusively-owned buffers.
    pub fn deep_copy(&self) -> Frame {
        let mut copy = Frame::heap(self.payload());
        let data: Vec<u8> = self.iter().collect();
        // Infallible: the target was sized from payload().
        let _ = copy.write_bytes(0, &data);
        copy.channel = self.channel;
        copy.error = self.error();
        copy
    }
}
