//! Periodic bandwidth admission
//!
//! Each virtual slot carries the bandwidth already promised to isochronous
//! and interrupt endpoints polled in it. A reservation covers a whole
//! [`SlotSet`] and is all-or-nothing: either every slot has room and all of
//! them are charged, or nothing changes.

use alloc::vec::Vec;

use crate::{
    error::{UhciError, UhciResult},
    frame_list::SlotSet,
    transfer::{Direction, TransferKind, UsbSpeed},
};

/// Outcome of [`AdmissionControl::try_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// `slot` is the first slot without room; `available` is what it had.
    Rejected { slot: usize, available: u32 },
}

/// Per-slot bandwidth ledger.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    reserved: Vec<u32>,
    limit: u32,
}

impl AdmissionControl {
    /// `limit` is the admissible amount per slot (budget times fraction).
    pub fn new(slots: usize, limit: u32) -> Self {
        Self {
            reserved: alloc::vec![0; slots],
            limit,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn reserved(&self, slot: usize) -> u32 {
        self.reserved[slot]
    }

    /// Smallest headroom across the set.
    pub fn available(&self, set: &SlotSet) -> u32 {
        set.iter()
            .map(|slot| self.limit.saturating_sub(self.reserved[slot]))
            .min()
            .unwrap_or(0)
    }

    pub fn try_reserve(&mut self, set: &SlotSet, estimate: u32) -> Admission {
        for slot in set.iter() {
            let available = self.limit.saturating_sub(self.reserved[slot]);
            if estimate > available {
                return Admission::Rejected { slot, available };
            }
        }
        for slot in set.iter() {
            self.reserved[slot] += estimate;
        }
        Admission::Accepted
    }

    /// Undo a reservation made with the same set and estimate.
    pub fn release(&mut self, set: &SlotSet, estimate: u32) -> UhciResult<()> {
        if set.iter().any(|slot| self.reserved[slot] < estimate) {
            return Err(UhciError::ScheduleCorruption {
                reason: "bandwidth release exceeds reservation",
            });
        }
        for slot in set.iter() {
            self.reserved[slot] -= estimate;
        }
        Ok(())
    }

    /// Phase in `0..interval` that can take `estimate` everywhere and has the
    /// least bandwidth already committed. Ties go to the lowest phase.
    pub fn best_offset(&self, interval: usize, estimate: u32) -> Option<usize> {
        let frames = self.reserved.len();
        (0..interval.min(frames))
            .map(|offset| SlotSet::new(offset, interval, frames))
            .filter(|set| self.available(set) >= estimate)
            .min_by_key(|set| set.iter().map(|s| self.reserved[s] as u64).sum::<u64>())
            .map(|set| set.offset())
    }

    /// Every slot within the limit.
    pub fn verify(&self) -> UhciResult<()> {
        if self.reserved.iter().any(|&bw| bw > self.limit) {
            return Err(UhciError::ScheduleCorruption {
                reason: "slot bandwidth above admission limit",
            });
        }
        Ok(())
    }
}

/// Bus time of one transaction, in full-speed bit times.
pub trait BandwidthEstimator: Send {
    fn estimate(
        &self,
        kind: TransferKind,
        speed: UsbSpeed,
        direction: Direction,
        max_packet: u16,
    ) -> u32;
}

/// Bit-time estimate after USB 2.0 section 5.11.3, rounded to full-speed
/// bit times (83.33 ns). Worst-case bit stuffing is 7/6 of the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitTimeEstimator;

// Protocol overhead including host delay, in full-speed bit times.
const FS_ISO_IN_OVERHEAD: u32 = 99;
const FS_ISO_OUT_OVERHEAD: u32 = 87;
const FS_OVERHEAD: u32 = 121;
const LS_OVERHEAD: u32 = 789;
const LS_BIT_TIME: u32 = 8;

impl BandwidthEstimator for BitTimeEstimator {
    fn estimate(
        &self,
        kind: TransferKind,
        speed: UsbSpeed,
        direction: Direction,
        max_packet: u16,
    ) -> u32 {
        let stuffed = (7 * 8 * max_packet as u32) / 6;
        match (speed, kind) {
            (UsbSpeed::Low, _) => LS_OVERHEAD + stuffed * LS_BIT_TIME,
            (UsbSpeed::Full, TransferKind::Isochronous) => {
                let overhead = match direction {
                    Direction::In => FS_ISO_IN_OVERHEAD,
                    Direction::Out => FS_ISO_OUT_OVERHEAD,
                };
                overhead + stuffed
            }
            (UsbSpeed::Full, _) => FS_OVERHEAD + stuffed,
        }
    }
}
