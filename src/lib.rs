//! # daqwire
//!
//! Host-side framework for composing data-acquisition and control
//! pipelines against FPGA-based detector electronics: PCIe DMA cards
//! exposing lanes and virtual channels, plus register access carried over
//! the same or an alternative transport.
//!
//! Two cores, tightly coupled:
//!
//! - **Stream core** ([`stream`], [`hardware`], [`bridge`], [`fileio`]):
//!   a zero-copy frame-passing fabric connecting Masters (sources) to
//!   Slaves (sinks), with multi-buffer frames, DMA-index bookkeeping and
//!   pluggable transports (local DMA, TCP bridge, file replay).
//! - **Memory-transaction core** ([`memory`]): an asynchronous,
//!   at-most-once register-access protocol between memory masters and
//!   slaves, with timeouts, per-transaction completion, and a
//!   Variable/Block layer that packs typed fields into shared byte blocks
//!   and coalesces reads and writes.
//!
//! The [`control`] module exposes a request/response + publish channel
//! for remote interaction with registered variables.
//!
//! ## Example
//!
//! ```
//! use daqwire::hardware::{DmaStream, LoopbackDevice};
//! use daqwire::stream::Slave;
//!
//! let device = LoopbackDevice::new(16, 4096);
//! let dma = DmaStream::open(device, 1, 2).unwrap();
//!
//! let mut frame = dma.accept_req(64, true).unwrap();
//! frame.write_bytes(0, &[1, 2, 3, 4]).unwrap();
//! dma.accept_frame(frame).unwrap();
//! ```

pub mod bridge;
pub mod control;
pub mod error;
pub mod fileio;
pub mod hardware;
pub mod memory;
pub mod stream;

pub use error::{DaqError, Result};
