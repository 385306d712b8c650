//! Zero-copy frame-passing fabric.
//!
//! Sources ([`Master`]) hand [`Frame`]s of [`Buffer`]s to sinks
//! ([`Slave`]) over synchronous edges; [`Pool`] recycles heap buffers and
//! DMA pages travel with their driver index in the buffer meta word.

pub mod buffer;
pub mod frame;
pub mod master;
pub mod pool;
pub mod slave;

pub use buffer::{Buffer, ReturnBuffer};
pub use frame::Frame;
pub use master::Master;
pub use pool::Pool;
pub use slave::{Fanout, PoolSlave, Slave};
