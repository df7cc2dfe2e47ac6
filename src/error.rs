//! Error taxonomy for the block-device driver core.
//!
//! Narrower than a whole-kernel error type on purpose: every variant here
//! is something a client of the driver core can act on (retry, give up,
//! restart the process).

use core::fmt;

/// Errors produced by the driver core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DriverError {
    /// Caller violated a precondition: sector out of range, segment count
    /// too large, mismatched addressing mode, and similar.
    InvalidArgument,
    /// Transient: all slots full, partition ceiling reached, device busy
    /// bit asserted. Callers may retry.
    Busy,
    /// Hardware absent or removed.
    NoDevice,
    /// DMA allocation or mapping failed.
    OutOfMemory,
    /// Device reported a command-level failure.
    IoError,
    /// The owning state machine entered the irrecoverable Fatal state;
    /// only a process restart recovers.
    Fatal,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DriverError::InvalidArgument => "invalid argument",
            DriverError::Busy => "device or slot pool busy",
            DriverError::NoDevice => "no device",
            DriverError::OutOfMemory => "out of memory",
            DriverError::IoError => "I/O error",
            DriverError::Fatal => "controller in fatal state",
        };
        f.write_str(msg)
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for DriverError {}

pub type DriverResult<T> = Result<T, DriverError>;
