//! Stream sinks and the fan-out splitter.

use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::stream::{Frame, Pool};

/// A frame sink.
///
/// Implementations must tolerate concurrent calls from multiple master
/// threads, either lock-free or serialising internally.
pub trait Slave: Send + Sync {
    /// Accept one frame from the upstream master.
    fn accept_frame(&self, frame: Frame) -> Result<()>;

    /// Allocate a frame of at least `size` bytes for the upstream master.
    ///
    /// The returned frame may carry more (or, for exotic sinks, less)
    /// capacity than requested. The default draws a single heap buffer.
    fn accept_req(&self, size: usize, _zero_copy_ok: bool) -> Result<Frame> {
        Ok(Frame::heap(size))
    }
}

/// A sink that allocates from a shared [`Pool`] and drops inbound frames.
///
/// Useful as the default allocator behind sources that never consume
/// frames themselves.
pub struct PoolSlave {
    pool: Arc<Pool>,
    chunk: usize,
}

impl PoolSlave {
    pub fn new(pool: Arc<Pool>, chunk: usize) -> Arc<Self> {
        Arc::new(Self { pool, chunk })
    }
}

impl Slave for PoolSlave {
    fn accept_frame(&self, frame: Frame) -> Result<()> {
        tracing::debug!(payload = frame.payload(), "pool slave dropping frame");
        Ok(())
    }

    fn accept_req(&self, size: usize, _zero_copy_ok: bool) -> Result<Frame> {
        Ok(self.pool.frame(size, self.chunk))
    }
}

/// Explicit splitter: one inbound edge fanned out to several sinks.
///
/// Every sink except the last receives a deep copy; the last receives the
/// original frame, buffers and all.
#[derive(Default)]
pub struct Fanout {
    slaves: RwLock<Vec<Arc<dyn Slave>>>,
}

impl Fanout {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach another downstream sink.
    pub fn add_slave(&self, slave: Arc<dyn Slave>) {
        self.slaves.write().unwrap().push(slave);
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.read().unwrap().len()
    }
}

impl Slave for Fanout {
    fn accept_frame(&self, frame: Frame) -> Result<()> {
        let slaves = self.slaves.read().unwrap().clone();
        let Some((last, rest)) = slaves.split_last() else {
            tracing::warn!("fanout with no sinks, dropping frame");
            return Ok(());
        };
        for slave in rest {
            slave.accept_frame(frame.deep_copy())?;
        }
        last.accept_frame(frame)
    }
}
