//! Heap buffer allocation and recycling.

use std::sync::{Arc, Mutex};

use crate::stream::buffer::ReturnBuffer;
use crate::stream::{Buffer, Frame};

/// Default retained free-list cap.
pub const DEFAULT_FREE_CAP: usize = 256;

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    allocations: usize,
    reuses: usize,
}

/// Allocator and recycler for heap buffers.
///
/// Returned heap memory lands on a free list up to a soft cap; anything
/// beyond the cap is released to the allocator. DMA pages never pass
/// through here; their return path is the owning endpoint.
pub struct Pool {
    inner: Mutex<PoolInner>,
    free_cap: usize,
}

impl Pool {
    pub fn new() -> Arc<Self> {
        Self::with_free_cap(DEFAULT_FREE_CAP)
    }

    /// Create a pool retaining at most `free_cap` free buffers.
    pub fn with_free_cap(free_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner::default()),
            free_cap,
        })
    }

    /// Allocate a buffer of at least `min_size` bytes, reusing a free-list
    /// entry when one is large enough.
    pub fn alloc_buffer(self: &Arc<Self>, min_size: usize) -> Buffer {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding += 1;
        if let Some(pos) = inner.free.iter().position(|mem| mem.len() >= min_size) {
            inner.reuses += 1;
            let mem = inner.free.swap_remove(pos);
            drop(inner);
            return Buffer::from_vec(mem, Some(self.clone() as Arc<dyn ReturnBuffer>));
        }
        inner.allocations += 1;
        drop(inner);
        Buffer::from_vec(vec![0u8; min_size], Some(self.clone() as Arc<dyn ReturnBuffer>))
    }

    /// Build a frame of `chunk`-sized buffers covering at least `total`
    /// bytes. A `total` of zero yields an empty frame.
    pub fn frame(self: &Arc<Self>, total: usize, chunk: usize) -> Frame {
        let mut frame = Frame::new(false);
        if total == 0 {
            return frame;
        }
        let chunk = chunk.max(1);
        let mut remaining = total;
        while remaining > 0 {
            frame.append_buffer(self.alloc_buffer(chunk));
            remaining = remaining.saturating_sub(chunk);
        }
        frame
    }

    /// Buffers currently out in the wild.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding
    }

    /// Free-list depth.
    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// (fresh allocations, free-list reuses) since creation.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.allocations, inner.reuses)
    }
}

impl ReturnBuffer for Pool {
    fn ret_buffer(&self, mem: Option<Vec<u8>>, _meta: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if let Some(mem) = mem {
            if inner.free.len() < self.free_cap {
                inner.free.push(mem);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_return_cycles() {
        let pool = Pool::new();
        let buf = pool.alloc_buffer(128);
        assert_eq!(pool.outstanding(), 1);
        drop(buf);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(), 1);

        // Second allocation reuses the returned memory.
        let _buf = pool.alloc_buffer(64);
        let (allocs, reuses) = pool.stats();
        assert_eq!(allocs, 1);
        assert_eq!(reuses, 1);
    }

    #[test]
    fn test_free_cap_is_soft_limit() {
        let pool = Pool::with_free_cap(2);
        let bufs: Vec<_> = (0..4).map(|_| pool.alloc_buffer(16)).collect();
        drop(bufs);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_small_free_entries_are_skipped() {
        let pool = Pool::new();
        drop(pool.alloc_buffer(16));
        let big = pool.alloc_buffer(1024);
        assert!(big.capacity() >= 1024);
    }

    #[test]
    fn test_frame_chunking() {
        let pool = Pool::new();
        let frame = pool.frame(10, 4);
        assert_eq!(frame.buffer_count(), 3);
        assert!(frame.available() >= 10);
        assert!(!frame.is_zero_copy());

        let empty = pool.frame(0, 4);
        assert_eq!(empty.buffer_count(), 0);
    }
}
