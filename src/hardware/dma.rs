//! DMA stream endpoint.
//!
//! [`DmaStream`] is a combined Master+Slave bound to one (lane, virtual
//! channel) of a [`DmaDevice`]. A dedicated reader thread drains the
//! receive side; transmit walks the frame's buffers under the endpoint
//! mutex, zero-copy where the buffer already maps a driver page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{DaqError, Result};
use crate::hardware::device::{DmaDevice, DmaMapping};
use crate::stream::buffer::{meta, ReturnBuffer};
use crate::stream::{Buffer, Frame, Master, Pool, Slave};

/// Reader readiness poll; short so shutdown stays responsive.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Copy-mode buffer size when the driver exposes no page mapping.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default transmit/allocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

struct DmaShared {
    dev: Arc<dyn DmaDevice>,
    mapping: Option<Arc<DmaMapping>>,
    page_size: usize,
    lane: u8,
    vc: u8,
    timeout: Mutex<Duration>,
    /// Serialises multi-buffer submissions and the transmit index pool.
    submit: Mutex<()>,
    master: Master,
    pool: Arc<Pool>,
    stop: AtomicBool,
}

impl DmaShared {
    fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap()
    }
}

impl ReturnBuffer for DmaShared {
    fn ret_buffer(&self, _mem: Option<Vec<u8>>, buf_meta: u32) {
        // Stale pages already belong to the driver again; returning twice
        // would corrupt the receive ring.
        if meta::is_zero_copy(buf_meta) && !meta::is_stale(buf_meta) {
            if let Err(e) = self.dev.ret_index(meta::index(buf_meta)) {
                tracing::warn!(index = meta::index(buf_meta), error = %e, "index return failed");
            }
        }
    }
}

/// Combined stream Master+Slave over a DMA character device.
pub struct DmaStream {
    shared: Arc<DmaShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DmaStream {
    /// Bind to one (lane, vc) of `dev` and start the reader thread.
    ///
    /// The lane/vc mask is applied first; a driver without page mapping
    /// support drops the endpoint into copy mode.
    pub fn open(dev: Arc<dyn DmaDevice>, lane: u8, vc: u8) -> Result<Arc<Self>> {
        let mask = 1u32 << (lane as u32 * 4 + vc as u32);
        dev.set_mask(mask).map_err(|_| DaqError::Open {
            path: "dma device".to_string(),
            mask,
        })?;
        let mapping = dev.map_dma()?;
        let page_size = mapping
            .as_ref()
            .map(|m| m.page_size())
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let shared = Arc::new(DmaShared {
            dev,
            mapping,
            page_size,
            lane,
            vc,
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            submit: Mutex::new(()),
            master: Master::new(),
            pool: Pool::new(),
            stop: AtomicBool::new(false),
        });

        let reader_shared = shared.clone();
        let reader = std::thread::Builder::new()
            .name(format!("dma-rx-{}.{}", lane, vc))
            .spawn(move || run_reader(reader_shared))?;

        Ok(Arc::new(Self {
            shared,
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Connect the sink receiving inbound frames.
    pub fn set_slave(&self, slave: Arc<dyn Slave>) {
        self.shared.master.set_slave(slave);
    }

    /// Transmit/allocation timeout for blocking paths.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.shared.timeout.lock().unwrap() = timeout.max(Duration::from_micros(1));
    }

    pub fn lane(&self) -> u8 {
        self.shared.lane
    }

    pub fn vc(&self) -> u8 {
        self.shared.vc
    }

    /// Mapped page size, or the copy-mode buffer size.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// True while the driver page table is mapped (zero-copy capable).
    pub fn is_zero_copy(&self) -> bool {
        self.shared.mapping.is_some()
    }

    /// Stop the reader thread and wait for it to exit.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DmaStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl Slave for DmaStream {
    /// Transmit one frame: each buffer is submitted in order, the continue
    /// flag clear only on the last.
    fn accept_frame(&self, frame: Frame) -> Result<()> {
        let shared = &self.shared;
        let timeout = shared.timeout();
        let buffers = frame.into_buffers();
        let count = buffers.len();

        let _guard = shared.submit.lock().unwrap();
        for (i, mut buf) in buffers.into_iter().enumerate() {
            let cont = i + 1 < count;

            if buf.is_zero_copy() {
                if buf.is_stale() {
                    continue;
                }
                shared.dev.write_index(
                    meta::index(buf.meta()),
                    buf.size(),
                    shared.lane,
                    shared.vc,
                    cont,
                )?;
                // The kernel owns the page now; returning it must not
                // re-arm reception.
                buf.mark_stale();
            } else {
                // Single budget across every retry of this transfer.
                let deadline = Instant::now() + timeout;
                loop {
                    let remaining = deadline
                        .checked_duration_since(Instant::now())
                        .ok_or(DaqError::Timeout(timeout))?;
                    if !shared.dev.poll_writable(remaining.min(timeout))? {
                        return Err(DaqError::Timeout(timeout));
                    }
                    if shared
                        .dev
                        .write_copy(buf.data(), shared.lane, shared.vc, cont)?
                    {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Allocate a frame, zero-copy preferred: transmit page indices are
    /// drawn from the kernel free pool until the request is covered.
    fn accept_req(&self, size: usize, zero_copy_ok: bool) -> Result<Frame> {
        let shared = &self.shared;
        let mapping = match (&shared.mapping, zero_copy_ok) {
            (Some(m), true) => m,
            // Caller refused zero copy, or mapping failed: heap buffers no
            // smaller than the page size.
            _ => return Ok(shared.pool.frame(size.max(1), shared.page_size)),
        };

        let timeout = shared.timeout();
        let mut frame = Frame::new(true);
        let _guard = shared.submit.lock().unwrap();
        let mut alloc = 0usize;
        while alloc < size {
            let index = loop {
                match shared.dev.alloc_index()? {
                    Some(index) => break index,
                    None => {
                        // The readiness poll can fire while another caller
                        // wins the page; keep trying inside the budget.
                        if !shared.dev.poll_writable(timeout)? {
                            return Err(DaqError::Timeout(timeout));
                        }
                    }
                }
            };
            let ptr = mapping.page(index).ok_or_else(|| {
                DaqError::Protocol(format!("driver returned out-of-range index {index}"))
            })?;
            // SAFETY: holding the index grants exclusive access to the page
            // until it is written or returned.
            let buf = unsafe {
                Buffer::from_raw(
                    ptr,
                    mapping.page_size(),
                    meta::ZERO_COPY | index,
                    shared.clone(),
                )
            };
            frame.append_buffer(buf);
            alloc += mapping.page_size();
        }
        Ok(frame)
    }
}

/// Receive loop: poll, wrap pages into buffers, dispatch on frame end.
fn run_reader(shared: Arc<DmaShared>) {
    let zero_copy = shared.mapping.is_some();
    let mut frame = Frame::new(zero_copy);

    while !shared.stop.load(Ordering::Acquire) {
        match shared.dev.poll_readable(POLL_INTERVAL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(error = %e, "readiness poll failed");
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let appended = if let Some(mapping) = &shared.mapping {
            match shared.dev.read_index() {
                Ok(Some(desc)) => {
                    let Some(ptr) = mapping.page(desc.index) else {
                        tracing::error!(index = desc.index, "driver index out of range");
                        continue;
                    };
                    // SAFETY: the driver handed us this index; the page is
                    // ours until returned.
                    let mut buf = unsafe {
                        Buffer::from_raw(
                            ptr,
                            mapping.page_size(),
                            meta::ZERO_COPY | desc.index,
                            shared.clone() as Arc<dyn ReturnBuffer>,
                        )
                    };
                    let _ = buf.set_size(desc.size.min(mapping.page_size()));
                    buf.set_error(desc.error as u32);
                    frame.append_buffer(buf);
                    Some(desc.cont)
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "indexed read failed");
                    None
                }
            }
        } else {
            let mut buf = shared.pool.alloc_buffer(shared.page_size);
            let window = buf.data_mut().expect("fresh heap buffer is writable");
            match shared.dev.read_copy(window) {
                Ok(Some(rx)) => {
                    let _ = buf.set_size(rx.size);
                    buf.set_error(rx.error as u32);
                    frame.append_buffer(buf);
                    Some(rx.cont)
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "copy read failed");
                    None
                }
            }
        };

        if let Some(cont) = appended {
            if !cont {
                let mut done = std::mem::replace(&mut frame, Frame::new(zero_copy));
                done.set_channel(shared.vc);
                if let Err(e) = shared.master.send_frame(done) {
                    tracing::warn!(error = %e, "downstream rejected frame");
                }
            }
        }
    }
}
