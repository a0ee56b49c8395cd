//! Error types for the UHCI scheduler
//!
//! Mirrors the kernel's `KernelError` layout: struct-like variants that carry
//! enough context to log a useful message without allocating.

use core::fmt;

use crate::descriptor::{DescriptorKind, TdStatus};

/// Scheduler error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UhciError {
    /// Descriptor pool exhausted. Recoverable: the caller retries with
    /// backoff.
    OutOfMemory {
        kind: DescriptorKind,
        requested: usize,
        available: usize,
    },

    /// Not enough periodic bandwidth left in at least one virtual frame.
    /// No partial reservation is left behind.
    AdmissionFailure {
        requested: u32,
        available: u32,
    },

    /// The controller reported a transaction fault for a transfer.
    BusError {
        status: TdStatus,
    },

    /// The endpoint returned STALL.
    Stalled,

    /// An internal schedule invariant does not hold. Fatal: the controller
    /// is halted.
    ScheduleCorruption {
        reason: &'static str,
    },

    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    Busy {
        resource: &'static str,
        id: u64,
    },

    /// Controller did not respond the way the register interface promised.
    HardwareError {
        device: &'static str,
        code: u32,
    },
    Timeout {
        operation: &'static str,
        frames: u32,
    },
}

/// Result type alias for scheduler operations
pub type UhciResult<T> = Result<T, UhciError>;

impl UhciError {
    /// Errors the caller may retry, possibly with different parameters.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::AdmissionFailure { .. }
                | Self::Busy { .. }
                | Self::Timeout { .. }
        )
    }

    /// Errors after which the schedule can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ScheduleCorruption { .. })
    }
}

impl fmt::Display for UhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                kind,
                requested,
                available,
            } => write!(
                f,
                "Out of {:?} descriptors: requested {}, {} available",
                kind, requested, available
            ),
            Self::AdmissionFailure {
                requested,
                available,
            } => write!(
                f,
                "Periodic bandwidth exhausted: requested {} bit times, {} available",
                requested, available
            ),
            Self::BusError { status } => {
                write!(f, "Bus error: TD status 0x{:08x}", status.bits())
            }
            Self::Stalled => write!(f, "Endpoint stalled"),
            Self::ScheduleCorruption { reason } => write!(f, "Schedule corruption: {}", reason),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::Busy { resource, id } => write!(f, "{} {} is busy", resource, id),
            Self::HardwareError { device, code } => {
                write!(f, "Hardware error on {}: code 0x{:x}", device, code)
            }
            Self::Timeout { operation, frames } => {
                write!(f, "Timeout in {} after {} frames", operation, frames)
            }
        }
    }
}
