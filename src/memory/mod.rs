//! Asynchronous, at-most-once register-access protocol.
//!
//! [`MemoryMaster`]s build [`Transaction`]s and dispatch them to a
//! [`MemorySlave`]; completion is signalled in-band through a `u32` error
//! code (see [`codes`]). The [`Block`]/[`Variable`] layer packs typed
//! fields into shared shadow windows and coalesces the resulting reads
//! and writes.

pub mod block;
pub mod master;
pub mod ram;
pub mod slave;
pub mod transaction;
pub mod variable;

pub use block::Block;
pub use master::MemoryMaster;
pub use ram::RamSlave;
pub use slave::{MemorySlave, SlaveCore};
pub use transaction::{AccessKind, Transaction};
pub use variable::{Mode, Model, Variable};

use std::time::Duration;

use crate::error::DaqError;

/// In-band transaction error codes.
///
/// The low byte mirrors hardware error bits; software conditions occupy
/// one bit each above.
pub mod codes {
    /// Success.
    pub const OK: u32 = 0;
    /// Hardware error bits reported on the bus.
    pub const HARDWARE_MASK: u32 = 0x0000_00FF;
    /// The master's wait budget expired.
    pub const TIMEOUT: u32 = 0x0100_0000;
    /// Read-after-write comparison diverged.
    pub const VERIFY: u32 = 0x0200_0000;
    /// Address outside the slave's window.
    pub const ADDRESS: u32 = 0x0400_0000;
    /// Size outside the slave's access range.
    pub const SIZE: u32 = 0x0800_0000;
    /// Slave does not implement the access.
    pub const UNSUPPORTED: u32 = 0x1000_0000;
    /// Endpoint torn down with the transaction pending.
    pub const CANCELED: u32 = 0x2000_0000;
    /// Malformed request or response.
    pub const PROTOCOL: u32 = 0x4000_0000;
    /// Bus-level failure with hardware bits in the low byte.
    pub const AXIS: u32 = 0x8000_0000;
}

/// Translate an in-band code into the crate error type.
///
/// `budget` is the wait budget in force, reported by timeout errors.
pub fn code_to_error(code: u32, budget: Duration) -> DaqError {
    if code & codes::TIMEOUT != 0 {
        DaqError::Timeout(budget)
    } else if code & codes::VERIFY != 0 {
        DaqError::VerifyMismatch {
            offset: 0,
            expected: 0,
            actual: 0,
        }
    } else if code & codes::CANCELED != 0 {
        DaqError::Canceled
    } else if code & codes::UNSUPPORTED != 0 {
        DaqError::Unsupported("slave rejected transaction".to_string())
    } else if code & (codes::SIZE | codes::ADDRESS) != 0 {
        DaqError::Protocol(format!("access outside slave window (code {code:#010x})"))
    } else if code & codes::AXIS != 0 || code & codes::HARDWARE_MASK != 0 {
        DaqError::Axis((code & codes::HARDWARE_MASK) as u8)
    } else {
        DaqError::Protocol(format!("transaction failed (code {code:#010x})"))
    }
}
