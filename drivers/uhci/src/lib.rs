//! UHCI frame-list transfer scheduler for VeridianOS
//!
//! Builds and maintains the schedule a USB 1.1 UHCI host controller walks
//! every millisecond: the 1024-entry frame list, the periodic isochronous and
//! interrupt descriptors hung off it, and the control and bulk queues that
//! follow. Callers open endpoints, submit transfers and poll for
//! completions; the scheduler handles descriptor lifetimes, data toggles,
//! bandwidth admission and safe cancellation.
//!
//! The hardware is reached only through [`HostControllerOps`] and
//! [`DmaMapper`], so the same scheduler runs against real registers or the
//! software model in [`sim`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bandwidth;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod dma;
pub mod endpoint;
pub mod error;
pub mod frame_list;
pub mod pool;
pub mod registers;
pub mod schedule;
pub mod sim;
pub mod transfer;

pub use bandwidth::{BandwidthEstimator, BitTimeEstimator};
pub use config::SchedulerConfig;
pub use controller::{ControllerState, InterruptSummary, ScheduleView, UhciScheduler};
pub use dma::{DmaBuffer, DmaMapper, IdentityMapper, PhysicalAddress};
pub use endpoint::{EndpointDescriptor, EndpointId, QueueState};
pub use error::{UhciError, UhciResult};
pub use registers::{HostControllerOps, UhciRegisters};
pub use schedule::ReclamationTarget;
pub use transfer::{
    AbortStatus, Completion, CompletionStatus, Direction, TransferFlags, TransferId,
    TransferKind, TransferRequest, UsbSpeed,
};
