//! Stream source endpoint.

use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::stream::{Frame, Slave};

/// Frame source port.
///
/// Endpoint components embed a `Master` and connect it to exactly one
/// [`Slave`] (fan-out goes through [`Fanout`]). Transmission is a
/// same-thread call into the slave; any threading is the slave's business.
///
/// [`Fanout`]: crate::stream::Fanout
#[derive(Default)]
pub struct Master {
    slave: RwLock<Option<Arc<dyn Slave>>>,
}

impl Master {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the downstream sink, replacing any previous one.
    pub fn set_slave(&self, slave: Arc<dyn Slave>) {
        *self.slave.write().unwrap() = Some(slave);
    }

    /// The currently connected sink, if any.
    pub fn slave(&self) -> Option<Arc<dyn Slave>> {
        self.slave.read().unwrap().clone()
    }

    /// Ask the downstream sink to allocate a frame of at least `size`
    /// bytes. Unconnected masters fall back to a plain heap frame.
    pub fn req_frame(&self, size: usize, zero_copy_ok: bool) -> Result<Frame> {
        match self.slave() {
            Some(slave) => slave.accept_req(size, zero_copy_ok),
            None => Ok(Frame::heap(size)),
        }
    }

    /// Hand a frame to the downstream sink, synchronously.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        match self.slave() {
            Some(slave) => slave.accept_frame(frame),
            None => {
                tracing::warn!(
                    payload = frame.payload(),
                    channel = frame.channel(),
                    "send_frame with no slave connected, dropping"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::Recorder;

    #[test]
    fn test_unconnected_master_allocates_heap() {
        let master = Master::new();
        let frame = master.req_frame(64, true).unwrap();
        assert!(frame.available() >= 64);
        assert!(!frame.is_zero_copy());
    }

    #[test]
    fn test_unconnected_send_drops() {
        let master = Master::new();
        assert!(master.send_frame(Frame::heap(4)).is_ok());
    }

    #[test]
    fn test_send_frame_reaches_slave() {
        let master = Master::new();
        let rec = Recorder::new();
        master.set_slave(rec.clone());

        let mut frame = master.req_frame(4, false).unwrap();
        frame.write_bytes(0, &[0xAA, 0xBB]).unwrap();
        frame.set_channel(1);
        master.send_frame(frame).unwrap();

        let frames = rec.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 1);
        assert_eq!(frames[0].data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_ordering_on_one_edge() {
        let master = Master::new();
        let rec = Recorder::new();
        master.set_slave(rec.clone());

        for i in 0..10u8 {
            let mut frame = Frame::heap(1);
            frame.write_bytes(0, &[i]).unwrap();
            master.send_frame(frame).unwrap();
        }

        let frames = rec.frames();
        let order: Vec<u8> = frames.iter().map(|f| f.data[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<u8>>());
    }
}
