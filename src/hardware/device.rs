//! DMA character-device contract.
//!
//! [`DmaDevice`] names the kernel operations the endpoint consumes: mask
//! selection, page-table mapping, indexed receive/transmit, index return
//! and readiness polling. [`CharDevice`] binds the contract to a real
//! `/dev` node; [`LoopbackDevice`] is a software rendition that echoes
//! transmitted pages back to the receive queue, for development and tests.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One received page descriptor.
#[derive(Debug, Clone, Copy)]
pub struct RxDesc {
    /// Driver page index.
    pub index: u32,
    /// Payload bytes in the page.
    pub size: usize,
    /// Hardware error bits.
    pub error: u8,
    /// More pages belong to this frame.
    pub cont: bool,
}

/// One copy-mode receive result.
#[derive(Debug, Clone, Copy)]
pub struct RxCopy {
    pub size: usize,
    pub error: u8,
    pub cont: bool,
}

enum MappingOrigin {
    /// mmap'd device memory, unmapped on drop.
    Device { len: usize },
    /// Leaked heap slab (software devices), reboxed on drop.
    Slab { len: usize },
}

/// A mapped DMA page table: `count` pages of `page_size` bytes.
pub struct DmaMapping {
    base: NonNull<u8>,
    count: u32,
    page_size: usize,
    origin: MappingOrigin,
}

// SAFETY: pages are only touched through the index-ownership protocol; a
// page is referenced by at most one Buffer at a time.
unsafe impl Send for DmaMapping {}
unsafe impl Sync for DmaMapping {}

impl DmaMapping {
    /// Wrap an mmap'd region.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `count * page_size`
    /// bytes that stays valid until this value is dropped.
    unsafe fn from_device(base: NonNull<u8>, count: u32, page_size: usize) -> Self {
        Self {
            base,
            count,
            page_size,
            origin: MappingOrigin::Device {
                len: count as usize * page_size,
            },
        }
    }

    /// Build a heap-backed page table for software devices.
    fn slab(count: u32, page_size: usize) -> Self {
        let len = count as usize * page_size;
        let mem: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let base = NonNull::new(Box::leak(mem).as_mut_ptr()).expect("leaked slab is non-null");
        Self {
            base,
            count,
            page_size,
            origin: MappingOrigin::Slab { len },
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Base pointer of page `index`.
    pub fn page(&self, index: u32) -> Option<NonNull<u8>> {
        if index >= self.count {
            return None;
        }
        // SAFETY: index bound checked against the mapping extent.
        unsafe {
            Some(NonNull::new_unchecked(
                self.base.as_ptr().add(index as usize * self.page_size),
            ))
        }
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        match self.origin {
            MappingOrigin::Device { len } => unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, len);
            },
            MappingOrigin::Slab { len } => unsafe {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(
                    self.base.as_ptr(),
                    len,
                )));
            },
        }
    }
}

/// Kernel operations of the DMA character device.
///
/// Methods return raw `io::Result`; the endpoint translates failures into
/// frame error bits or [`DaqError`](crate::DaqError) as appropriate.
pub trait DmaDevice: Send + Sync {
    /// Select the (lane, virtual channel) pairs of interest.
    fn set_mask(&self, mask: u32) -> io::Result<()>;

    /// Map the receive/transmit page table; `None` when the driver does
    /// not support mapping (the endpoint then runs in copy mode).
    fn map_dma(&self) -> io::Result<Option<Arc<DmaMapping>>>;

    /// Retrieve the next received page, if any.
    fn read_index(&self) -> io::Result<Option<RxDesc>>;

    /// Copy-mode receive into `buf`.
    fn read_copy(&self, buf: &mut [u8]) -> io::Result<Option<RxCopy>>;

    /// Re-arm a page for reception.
    fn ret_index(&self, index: u32) -> io::Result<()>;

    /// Acquire a free transmit page index, if one is available.
    fn alloc_index(&self) -> io::Result<Option<u32>>;

    /// Submit a mapped page downstream.
    fn write_index(&self, index: u32, size: usize, lane: u8, vc: u8, cont: bool)
        -> io::Result<()>;

    /// Copy-mode transmit; `false` means the buffer race was lost and the
    /// caller should retry.
    fn write_copy(&self, data: &[u8], lane: u8, vc: u8, cont: bool) -> io::Result<bool>;

    /// Wait until a receive descriptor may be available.
    fn poll_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Wait until the transmit side may accept a submission.
    fn poll_writable(&self, timeout: Duration) -> io::Result<bool>;
}

// ============================================================================
// Character device
// ============================================================================

// Driver command numbers (character-device contract, consumed as-is).
const CMD_BUFF_COUNT: libc::c_ulong = 0x1001;
const CMD_BUFF_SIZE: libc::c_ulong = 0x1002;
const CMD_SET_MASK: libc::c_ulong = 0x1004;
const CMD_RET_INDEX: libc::c_ulong = 0x1005;
const CMD_GET_INDEX: libc::c_ulong = 0x1006;

const DESC_FLAG_CONT: u32 = 0x1;

/// Transmit descriptor handed to the driver via `write(2)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct TxDesc {
    data: u64,
    dest: u32,
    flags: u32,
    index: u32,
    size: u32,
    is_index: u32,
    _pad: u32,
}

/// Receive descriptor filled by the driver via `read(2)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RxRaw {
    data: u64,
    dest: u32,
    flags: u32,
    index: u32,
    error: u32,
    size: u32,
    is_index: u32,
    _pad: u32,
}

fn dest(lane: u8, vc: u8) -> u32 {
    (lane as u32) * 4 + vc as u32
}

fn wait_fd(fd: RawFd, write: bool, timeout: Duration) -> io::Result<bool> {
    // SAFETY: fd_set/timeval are plain C structures; fd is a live
    // descriptor owned by the caller.
    unsafe {
        let mut fds: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut fds);
        libc::FD_SET(fd, &mut fds);
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let (read_set, write_set) = if write {
            (std::ptr::null_mut(), &mut fds as *mut libc::fd_set)
        } else {
            (&mut fds as *mut libc::fd_set, std::ptr::null_mut())
        };
        let res = libc::select(fd + 1, read_set, write_set, std::ptr::null_mut(), &mut tv);
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res > 0)
    }
}

/// The Linux character-device implementation.
pub struct CharDevice {
    file: File,
}

impl CharDevice {
    /// Open the device node read/write.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn ioctl(&self, cmd: libc::c_ulong, arg: libc::c_long) -> io::Result<libc::c_long> {
        // SAFETY: plain scalar ioctl against an open descriptor.
        let res = unsafe { libc::ioctl(self.fd(), cmd, arg) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as libc::c_long)
    }
}

impl DmaDevice for CharDevice {
    fn set_mask(&self, mask: u32) -> io::Result<()> {
        self.ioctl(CMD_SET_MASK, mask as libc::c_long)?;
        Ok(())
    }

    fn map_dma(&self) -> io::Result<Option<Arc<DmaMapping>>> {
        let count = self.ioctl(CMD_BUFF_COUNT, 0)? as u32;
        let size = self.ioctl(CMD_BUFF_SIZE, 0)? as usize;
        if count == 0 || size == 0 {
            return Ok(None);
        }
        // SAFETY: mapping the driver's page table; length derived from the
        // driver's own counts.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                count as usize * size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            // Driver without mapping support: fall back to copy mode.
            return Ok(None);
        }
        let base = NonNull::new(base as *mut u8).ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "mmap returned null")
        })?;
        // SAFETY: base/count/size describe the mapping created above.
        Ok(Some(Arc::new(unsafe {
            DmaMapping::from_device(base, count, size)
        })))
    }

    fn read_index(&self) -> io::Result<Option<RxDesc>> {
        let mut raw = RxRaw {
            is_index: 1,
            ..Default::default()
        };
        // SAFETY: the driver fills the descriptor struct handed to read(2).
        let res = unsafe {
            libc::read(
                self.fd(),
                &mut raw as *mut RxRaw as *mut libc::c_void,
                std::mem::size_of::<RxRaw>(),
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        if res == 0 {
            return Ok(None);
        }
        Ok(Some(RxDesc {
            index: raw.index,
            size: raw.size as usize,
            error: raw.error as u8,
            cont: raw.flags & DESC_FLAG_CONT != 0,
        }))
    }

    fn read_copy(&self, buf: &mut [u8]) -> io::Result<Option<RxCopy>> {
        let mut raw = RxRaw {
            data: buf.as_mut_ptr() as u64,
            size: buf.len() as u32,
            ..Default::default()
        };
        // SAFETY: the driver copies at most `size` bytes into `data`.
        let res = unsafe {
            libc::read(
                self.fd(),
                &mut raw as *mut RxRaw as *mut libc::c_void,
                std::mem::size_of::<RxRaw>(),
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        if res == 0 {
            return Ok(None);
        }
        Ok(Some(RxCopy {
            size: raw.size as usize,
            error: raw.error as u8,
            cont: raw.flags & DESC_FLAG_CONT != 0,
        }))
    }

    fn ret_index(&self, index: u32) -> io::Result<()> {
        self.ioctl(CMD_RET_INDEX, index as libc::c_long)?;
        Ok(())
    }

    fn alloc_index(&self) -> io::Result<Option<u32>> {
        match self.ioctl(CMD_GET_INDEX, 0) {
            Ok(idx) if idx >= 0 => Ok(Some(idx as u32)),
            Ok(_) => Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_index(
        &self,
        index: u32,
        size: usize,
        lane: u8,
        vc: u8,
        cont: bool,
    ) -> io::Result<()> {
        let desc = TxDesc {
            dest: dest(lane, vc),
            flags: if cont { DESC_FLAG_CONT } else { 0 },
            index,
            size: size as u32,
            is_index: 1,
            ..Default::default()
        };
        // SAFETY: descriptor submission over write(2); the driver takes
        // ownership of the page index.
        let res = unsafe {
            libc::write(
                self.fd(),
                &desc as *const TxDesc as *const libc::c_void,
                std::mem::size_of::<TxDesc>(),
            )
        };
        if res <= 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn write_copy(&self, data: &[u8], lane: u8, vc: u8, cont: bool) -> io::Result<bool> {
        let desc = TxDesc {
            data: data.as_ptr() as u64,
            dest: dest(lane, vc),
            flags: if cont { DESC_FLAG_CONT } else { 0 },
            size: data.len() as u32,
            ..Default::default()
        };
        // SAFETY: the driver copies `size` bytes out of `data` before
        // write(2) returns.
        let res = unsafe {
            libc::write(
                self.fd(),
                &desc as *const TxDesc as *const libc::c_void,
                std::mem::size_of::<TxDesc>(),
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res > 0)
    }

    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        wait_fd(self.fd(), false, timeout)
    }

    fn poll_writable(&self, timeout: Duration) -> io::Result<bool> {
        wait_fd(self.fd(), true, timeout)
    }
}

// ============================================================================
// Loopback device
// ============================================================================

struct LoopbackState {
    free: VecDeque<u32>,
    rx: VecDeque<RxDesc>,
    mask: u32,
    inject_error: u8,
    ret_calls: usize,
}

/// Software device: transmitted pages echo straight back to the receive
/// queue. Stands in for the kernel driver in development and tests.
pub struct LoopbackDevice {
    mapping: Arc<DmaMapping>,
    mapped: bool,
    state: Mutex<LoopbackState>,
    cv: Condvar,
}

impl LoopbackDevice {
    pub fn new(count: u32, page_size: usize) -> Arc<Self> {
        Self::with_mapping(count, page_size, true)
    }

    /// `mapped = false` simulates a driver without page mapping: the
    /// endpoint then exercises its copy-mode paths.
    pub fn with_mapping(count: u32, page_size: usize, mapped: bool) -> Arc<Self> {
        Arc::new(Self {
            mapping: Arc::new(DmaMapping::slab(count, page_size)),
            mapped,
            state: Mutex::new(LoopbackState {
                free: (0..count).collect(),
                rx: VecDeque::new(),
                mask: 0,
                inject_error: 0,
                ret_calls: 0,
            }),
            cv: Condvar::new(),
        })
    }

    /// Currently applied lane/vc mask.
    pub fn mask(&self) -> u32 {
        self.state.lock().unwrap().mask
    }

    /// Error bits to stamp on the next echoed descriptors.
    pub fn inject_error(&self, bits: u8) {
        self.state.lock().unwrap().inject_error = bits;
    }

    /// Number of `ret_index` calls observed (for return-idempotence tests).
    pub fn ret_calls(&self) -> usize {
        self.state.lock().unwrap().ret_calls
    }

    fn page_slice(&self, index: u32) -> &mut [u8] {
        let ptr = self.mapping.page(index).expect("index in range");
        // SAFETY: index ownership hands exclusive access to the caller.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.mapping.page_size()) }
    }
}

impl DmaDevice for LoopbackDevice {
    fn set_mask(&self, mask: u32) -> io::Result<()> {
        self.state.lock().unwrap().mask = mask;
        Ok(())
    }

    fn map_dma(&self) -> io::Result<Option<Arc<DmaMapping>>> {
        Ok(self.mapped.then(|| self.mapping.clone()))
    }

    fn read_index(&self) -> io::Result<Option<RxDesc>> {
        Ok(self.state.lock().unwrap().rx.pop_front())
    }

    fn read_copy(&self, buf: &mut [u8]) -> io::Result<Option<RxCopy>> {
        let desc = {
            let mut state = self.state.lock().unwrap();
            match state.rx.pop_front() {
                Some(d) => d,
                None => return Ok(None),
            }
        };
        let take = desc.size.min(buf.len());
        buf[..take].copy_from_slice(&self.page_slice(desc.index)[..take]);
        // Copy mode: the page goes straight back to the free pool.
        let mut state = self.state.lock().unwrap();
        state.free.push_back(desc.index);
        drop(state);
        self.cv.notify_all();
        Ok(Some(RxCopy {
            size: take,
            error: desc.error,
            cont: desc.cont,
        }))
    }

    fn ret_index(&self, index: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ret_calls += 1;
        state.free.push_back(index);
        drop(state);
        self.cv.notify_all();
        Ok(())
    }

    fn alloc_index(&self) -> io::Result<Option<u32>> {
        Ok(self.state.lock().unwrap().free.pop_front())
    }

    fn write_index(
        &self,
        index: u32,
        size: usize,
        _lane: u8,
        _vc: u8,
        cont: bool,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let error = state.inject_error;
        state.rx.push_back(RxDesc {
            index,
            size,
            error,
            cont,
        });
        drop(state);
        self.cv.notify_all();
        Ok(())
    }

    fn write_copy(&self, data: &[u8], _lane: u8, _vc: u8, cont: bool) -> io::Result<bool> {
        let index = {
            let mut state = self.state.lock().unwrap();
            match state.free.pop_front() {
                Some(i) => i,
                None => return Ok(false),
            }
        };
        let take = data.len().min(self.mapping.page_size());
        self.page_slice(index)[..take].copy_from_slice(&data[..take]);
        let mut state = self.state.lock().unwrap();
        let error = state.inject_error;
        state.rx.push_back(RxDesc {
            index,
            size: take,
            error,
            cont,
        });
        drop(state);
        self.cv.notify_all();
        Ok(true)
    }

    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.rx.is_empty())
            .unwrap();
        Ok(!state.rx.is_empty())
    }

    fn poll_writable(&self, timeout: Duration) -> io::Result<bool> {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.free.is_empty())
            .unwrap();
        Ok(!state.free.is_empty())
    }
}
