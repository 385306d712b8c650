//! Payload buffers with origin-aware recycling.
//!
//! A [`Buffer`] is one contiguous payload region inside a [`Frame`]. Its
//! bytes live either on the heap or inside a mapped DMA page; the origin is
//! recorded in a `u32` meta word (see [`meta`]) so the return path knows
//! whether to recycle heap memory or re-arm a driver page.
//!
//! [`Frame`]: crate::stream::Frame

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{DaqError, Result};

/// Buffer origin meta word layout.
pub mod meta {
    /// Buffer bytes map a driver page; the low bits carry the page index.
    pub const ZERO_COPY: u32 = 0x8000_0000;
    /// Ownership was already handed back to the driver; the buffer is
    /// read-only and must not be returned again.
    pub const STALE: u32 = 0x4000_0000;
    /// Driver page index mask.
    pub const INDEX_MASK: u32 = 0x3FFF_FFFF;

    /// Extract the driver page index.
    #[inline]
    pub fn index(meta: u32) -> u32 {
        meta & INDEX_MASK
    }

    /// Check the zero-copy bit.
    #[inline]
    pub fn is_zero_copy(meta: u32) -> bool {
        meta & ZERO_COPY != 0
    }

    /// Check the stale bit.
    #[inline]
    pub fn is_stale(meta: u32) -> bool {
        meta & STALE != 0
    }
}

/// Return path for buffers dropping out of a frame.
///
/// Heap storage is handed back as `Some(mem)` for reuse; zero-copy storage
/// passes `None` and the meta word identifies the driver page.
pub trait ReturnBuffer: Send + Sync {
    fn ret_buffer(&self, mem: Option<Vec<u8>>, meta: u32);
}

enum Storage {
    Heap(Vec<u8>),
    Raw { ptr: NonNull<u8>, capacity: usize },
}

/// A single contiguous payload region plus metadata.
///
/// The logical payload window sits between `head_room` and `tail_room`
/// inside the raw capacity; `size` bytes of it are currently valid.
pub struct Buffer {
    storage: Storage,
    head: usize,
    tail: usize,
    size: usize,
    error: u32,
    meta: u32,
    returner: Option<Arc<dyn ReturnBuffer>>,
}

// SAFETY: a Raw buffer holds the only live reference to its driver page;
// the kernel does not touch the page while user space owns the index.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocate a plain heap buffer with no return path.
    pub fn alloc(capacity: usize) -> Self {
        Self::from_vec(vec![0u8; capacity], None)
    }

    /// Wrap heap memory, optionally routing it back to `returner` on drop.
    pub fn from_vec(mem: Vec<u8>, returner: Option<Arc<dyn ReturnBuffer>>) -> Self {
        Self {
            storage: Storage::Heap(mem),
            head: 0,
            tail: 0,
            size: 0,
            error: 0,
            meta: 0,
            returner,
        }
    }

    /// Wrap a mapped DMA page.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `capacity` bytes for the
    /// lifetime of the buffer, and this buffer must be the only live
    /// reference to the page (the caller holds the driver index).
    pub unsafe fn from_raw(
        ptr: NonNull<u8>,
        capacity: usize,
        meta: u32,
        returner: Arc<dyn ReturnBuffer>,
    ) -> Self {
        Self {
            storage: Storage::Raw { ptr, capacity },
            head: 0,
            tail: 0,
            size: 0,
            error: 0,
            meta,
            returner: Some(returner),
        }
    }

    /// Raw capacity of the underlying storage.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Heap(mem) => mem.len(),
            Storage::Raw { capacity, .. } => *capacity,
        }
    }

    /// Bytes available to the payload window (capacity minus reserved room).
    pub fn available(&self) -> usize {
        self.capacity() - self.head - self.tail
    }

    /// Current payload size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Set the payload size; must fit the available window.
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        if size > self.available() {
            return Err(DaqError::Protocol(format!(
                "payload size {} exceeds available {}",
                size,
                self.available()
            )));
        }
        self.size = size;
        Ok(())
    }

    /// Reserved bytes ahead of the payload window.
    pub fn head_room(&self) -> usize {
        self.head
    }

    /// Reserved bytes behind the payload window.
    pub fn tail_room(&self) -> usize {
        self.tail
    }

    /// Shift the start of the payload window.
    pub fn set_head_room(&mut self, head: usize) -> Result<()> {
        if head + self.tail + self.size > self.capacity() {
            return Err(DaqError::Protocol(format!(
                "head room {} leaves no space for payload {}",
                head, self.size
            )));
        }
        self.head = head;
        Ok(())
    }

    /// Shift the end of the payload window.
    pub fn set_tail_room(&mut self, tail: usize) -> Result<()> {
        if self.head + tail + self.size > self.capacity() {
            return Err(DaqError::Protocol(format!(
                "tail room {} leaves no space for payload {}",
                tail, self.size
            )));
        }
        self.tail = tail;
        Ok(())
    }

    /// Current payload bytes.
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Heap(mem) => &mem[self.head..self.head + self.size],
            // SAFETY: window stays inside the page per set_size/set_head_room
            // checks, and we hold the only reference.
            Storage::Raw { ptr, .. } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr().add(self.head), self.size)
            },
        }
    }

    /// Mutable view of the full available window (not just the payload).
    ///
    /// Returns an error for a stale zero-copy buffer, which is read-only.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if meta::is_stale(self.meta) {
            return Err(DaqError::Protocol(
                "write to stale zero-copy buffer".to_string(),
            ));
        }
        let head = self.head;
        let avail = self.available();
        Ok(match &mut self.storage {
            Storage::Heap(mem) => &mut mem[head..head + avail],
            // SAFETY: as in data(); exclusivity through &mut self.
            Storage::Raw { ptr, .. } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr().add(head), avail)
            },
        })
    }

    /// Hardware/software error bits attached to this buffer.
    pub fn error(&self) -> u32 {
        self.error
    }

    /// Replace the error bits.
    pub fn set_error(&mut self, error: u32) {
        self.error = error;
    }

    /// Origin meta word.
    pub fn meta(&self) -> u32 {
        self.meta
    }

    /// True when the bytes map a driver page.
    pub fn is_zero_copy(&self) -> bool {
        meta::is_zero_copy(self.meta)
    }

    /// True when the page was already returned to the driver.
    pub fn is_stale(&self) -> bool {
        meta::is_stale(self.meta)
    }

    /// Mark the page as handed back to the driver.
    pub fn mark_stale(&mut self) {
        self.meta |= meta::STALE;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(returner) = self.returner.take() {
            let mem = match std::mem::replace(&mut self.storage, Storage::Heap(Vec::new())) {
                Storage::Heap(mem) => Some(mem),
                Storage::Raw { .. } => None,
            };
            returner.ret_buffer(mem, self.meta);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("size", &self.size)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("error", &self.error)
            .field("meta", &format_args!("{:#010x}", self.meta))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        calls: Mutex<Vec<(bool, u32)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl ReturnBuffer for Recorder {
        fn ret_buffer(&self, mem: Option<Vec<u8>>, meta: u32) {
            self.calls.lock().unwrap().push((mem.is_some(), meta));
        }
    }

    #[test]
    fn test_heap_alloc_and_size() {
        let mut buf = Buffer::alloc(64);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.size(), 0);

        buf.set_size(32).unwrap();
        assert_eq!(buf.size(), 32);
        assert_eq!(buf.data().len(), 32);

        assert!(buf.set_size(65).is_err());
    }

    #[test]
    fn test_head_tail_room_window() {
        let mut buf = Buffer::alloc(64);
        buf.set_head_room(8).unwrap();
        buf.set_tail_room(8).unwrap();
        assert_eq!(buf.available(), 48);
        assert!(buf.set_size(48).is_ok());
        assert!(buf.set_size(49).is_err());

        // Shrinking the window below the payload is rejected.
        assert!(buf.set_head_room(32).is_err());
    }

    #[test]
    fn test_write_through_window() {
        let mut buf = Buffer::alloc(8);
        buf.data_mut().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buf.set_size(4).unwrap();
        assert_eq!(buf.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_meta_helpers() {
        assert!(meta::is_zero_copy(meta::ZERO_COPY | 7));
        assert!(!meta::is_zero_copy(7));
        assert!(meta::is_stale(meta::STALE));
        assert_eq!(meta::index(meta::ZERO_COPY | meta::STALE | 42), 42);
    }

    #[test]
    fn test_drop_returns_heap_memory() {
        let rec = Recorder::new();
        {
            let _buf = Buffer::from_vec(vec![0u8; 16], Some(rec.clone()));
        }
        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0, "heap memory should travel with the return");
        assert_eq!(calls[0].1, 0);
    }

    #[test]
    fn test_stale_meta_survives_to_return() {
        let rec = Recorder::new();
        {
            let mut buf = Buffer::from_vec(vec![0u8; 16], Some(rec.clone()));
            buf.meta = meta::ZERO_COPY | 5;
            buf.mark_stale();
        }
        let calls = rec.calls.lock().unwrap();
        assert!(meta::is_stale(calls[0].1));
        assert_eq!(meta::index(calls[0].1), 5);
    }

    #[test]
    fn test_stale_buffer_is_read_only() {
        let mut buf = Buffer::alloc(16);
        buf.meta = meta::ZERO_COPY | 1;
        buf.mark_stale();
        assert!(buf.data_mut().is_err());
    }
}
