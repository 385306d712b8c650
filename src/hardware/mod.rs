//! DMA hardware endpoints and the character-device contract.

pub mod device;
pub mod dma;

pub use device::{CharDevice, DmaDevice, DmaMapping, LoopbackDevice, RxCopy, RxDesc};
pub use dma::DmaStream;
