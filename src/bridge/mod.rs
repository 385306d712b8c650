//! Frame bridging between hosts.

pub mod tcp;
pub mod wire;

pub use tcp::TcpBridge;
pub use wire::{BufferHeader, FrameAssembler, HEADER_SIZE};
