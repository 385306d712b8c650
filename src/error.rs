//! Error types for daqwire.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all daqwire operations.
#[derive(Debug, Error)]
pub enum DaqError {
    /// Device, socket or file could not be opened. Carries the path and
    /// the lane/vc mask that was being applied at the time (0 when not
    /// applicable).
    #[error("failed to open {path} (mask {mask:#010x})")]
    Open { path: String, mask: u32 },

    /// A timed wait expired without completion; carries the elapsed budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Requested transaction size outside the slave's access window.
    #[error("transaction size {size} outside access range [{min}, {max}]")]
    SizeRange { size: u32, min: u32, max: u32 },

    /// A buffer or write reported non-zero hardware error bits.
    #[error("hardware error bits {0:#04x}")]
    Axis(u8),

    /// A read-after-write check diverged.
    #[error("verify mismatch at byte {offset}: expected {expected:#04x}, actual {actual:#04x}")]
    VerifyMismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },

    /// A variable write violated its declared min/max range.
    #[error("value {value} outside range [{min}, {max}]")]
    Range { value: f64, min: f64, max: f64 },

    /// Operation aborted by shutdown.
    #[error("operation canceled by shutdown")]
    Canceled,

    /// Default slave rejection, or an invalid variable encoding.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Malformed frame, bad header size, reconnect discard.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error during device/socket/file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error on the control plane.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using DaqError.
pub type Result<T> = std::result::Result<T, DaqError>;
