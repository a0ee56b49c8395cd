//! Endpoint (pipe) state
//!
//! An open endpoint owns the descriptors that stay in the schedule for its
//! whole lifetime: one QH in its class chain for control and bulk, one QH per
//! polled slot for interrupt, one TD per polled slot for isochronous. The
//! transfers queued on it are served strictly in submission order.

use alloc::{collections::VecDeque, vec::Vec};

use crate::{
    error::{UhciError, UhciResult},
    frame_list::SlotSet,
    pool::{QhHandle, TdHandle},
    schedule::ScheduleClass,
    transfer::{Direction, TransferId, TransferKind, UsbSpeed},
};

/// Handle returned by `open_endpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub(crate) u32);

impl EndpointId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// What the caller knows about an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// USB device address
    pub address: u8,
    /// Endpoint number
    pub endpoint: u8,
    pub kind: TransferKind,
    pub direction: Direction,
    pub speed: UsbSpeed,
    pub max_packet: u16,
    /// Polling interval in frames, periodic endpoints only.
    pub interval: u16,
    /// Fixed slot phase instead of the least loaded one.
    pub phase: Option<usize>,
}

impl EndpointDescriptor {
    pub fn control(address: u8, max_packet: u16, speed: UsbSpeed) -> Self {
        Self {
            address,
            endpoint: 0,
            kind: TransferKind::Control,
            direction: Direction::Out,
            speed,
            max_packet,
            interval: 0,
            phase: None,
        }
    }

    pub fn bulk(address: u8, endpoint: u8, direction: Direction, max_packet: u16) -> Self {
        Self {
            address,
            endpoint,
            kind: TransferKind::Bulk,
            direction,
            speed: UsbSpeed::Full,
            max_packet,
            interval: 0,
            phase: None,
        }
    }

    pub fn interrupt(
        address: u8,
        endpoint: u8,
        direction: Direction,
        speed: UsbSpeed,
        max_packet: u16,
        interval: u16,
    ) -> Self {
        Self {
            address,
            endpoint,
            kind: TransferKind::Interrupt,
            direction,
            speed,
            max_packet,
            interval,
            phase: None,
        }
    }

    pub fn isochronous(
        address: u8,
        endpoint: u8,
        direction: Direction,
        max_packet: u16,
        interval: u16,
    ) -> Self {
        Self {
            address,
            endpoint,
            kind: TransferKind::Isochronous,
            direction,
            speed: UsbSpeed::Full,
            max_packet,
            interval,
            phase: None,
        }
    }

    pub fn with_phase(mut self, slot: usize) -> Self {
        self.phase = Some(slot);
        self
    }

    pub fn validate(&self) -> UhciResult<()> {
        if self.address > 127 || self.endpoint > 15 {
            return Err(UhciError::InvalidArgument {
                name: "endpoint",
                value: "address or endpoint number out of range",
            });
        }
        let limit = match (self.kind, self.speed) {
            (TransferKind::Isochronous, UsbSpeed::Full) => 1023,
            (TransferKind::Isochronous | TransferKind::Bulk, UsbSpeed::Low) => {
                return Err(UhciError::InvalidArgument {
                    name: "speed",
                    value: "low-speed devices have no bulk or isochronous endpoints",
                })
            }
            (_, UsbSpeed::Low) => 8,
            _ => 64,
        };
        if self.max_packet == 0 || self.max_packet > limit {
            return Err(UhciError::InvalidArgument {
                name: "max_packet",
                value: "out of range for transfer type",
            });
        }
        if self.kind.is_periodic() && self.interval == 0 {
            return Err(UhciError::InvalidArgument {
                name: "interval",
                value: "zero",
            });
        }
        Ok(())
    }

    /// Class chain for non-periodic endpoints.
    pub fn class(&self) -> Option<ScheduleClass> {
        match (self.kind, self.speed) {
            (TransferKind::Control, UsbSpeed::Low) => Some(ScheduleClass::LowSpeedControl),
            (TransferKind::Control, UsbSpeed::Full) => Some(ScheduleClass::FullSpeedControl),
            (TransferKind::Bulk, _) => Some(ScheduleClass::Bulk),
            _ => None,
        }
    }
}

/// Endpoint queue state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing pending; the QH element is terminated.
    Empty,
    /// Transfers waiting, none reachable by the controller.
    Queued,
    /// A transfer is linked and may be executing.
    Active,
}

/// One permanent isochronous TD and the slot it sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IsoFrame {
    pub slot: usize,
    pub td: TdHandle,
    /// Filled for a transfer that has not been reclaimed yet.
    pub busy: bool,
}

/// Bandwidth held by a periodic endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub slots: SlotSet,
    pub bandwidth: u32,
}

pub(crate) struct Endpoint {
    pub desc: EndpointDescriptor,
    /// Control and bulk: the QH spliced into the class chain.
    pub qh: Option<QhHandle>,
    /// Interrupt: one QH per polled slot.
    pub intr_qhs: Vec<(usize, QhHandle)>,
    /// Isochronous: one TD per polled slot, ascending slot order.
    pub iso_frames: Vec<IsoFrame>,
    pub reservation: Option<Reservation>,
    /// Transfers not yet armed, in submission order.
    pub queue: VecDeque<TransferId>,
    /// Transfer currently reachable by the controller (or quiescing after
    /// an abort). Isochronous endpoints keep every in-flight transfer in
    /// `queue` instead.
    pub armed: Option<TransferId>,
    /// Data toggle for the next bulk/interrupt transfer.
    pub toggle: bool,
    /// Next isochronous TD to fill, index into `iso_frames`.
    pub iso_next: usize,
}

impl Endpoint {
    pub fn new(desc: EndpointDescriptor) -> Self {
        Self {
            desc,
            qh: None,
            intr_qhs: Vec::new(),
            iso_frames: Vec::new(),
            reservation: None,
            queue: VecDeque::new(),
            armed: None,
            toggle: false,
            iso_next: 0,
        }
    }

    pub fn iso_in_use(&self) -> usize {
        self.iso_frames.iter().filter(|f| f.busy).count()
    }

    /// Release the isochronous TDs of a finished transfer.
    pub fn release_iso_tds(&mut self, tds: &[TdHandle]) {
        for frame in self.iso_frames.iter_mut() {
            if tds.contains(&frame.td) {
                frame.busy = false;
            }
        }
    }

    pub fn queue_state(&self) -> QueueState {
        if self.desc.kind == TransferKind::Isochronous {
            if self.queue.is_empty() {
                QueueState::Empty
            } else {
                QueueState::Active
            }
        } else if self.armed.is_some() {
            QueueState::Active
        } else if self.queue.is_empty() {
            QueueState::Empty
        } else {
            QueueState::Queued
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue_state() == QueueState::Empty
    }

    /// Slot indices this endpoint occupies.
    pub fn slots(&self) -> Vec<usize> {
        match self.reservation {
            Some(res) => res.slots.iter().collect(),
            None => Vec::new(),
        }
    }
}
