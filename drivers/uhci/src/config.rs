//! Scheduler configuration

use crate::{
    error::{UhciError, UhciResult},
    frame_list::UHCI_FRAME_LIST_COUNT,
    pool::{QHS_PER_PAGE, TDS_PER_PAGE},
    schedule::ReclamationTarget,
};

/// Boundary QHs plus the last QH.
const FIXED_QHS: usize = 4;

/// Tunables for [`UhciScheduler`](crate::UhciScheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Virtual frame slots (V). Power of two dividing 1024.
    pub virtual_frames: usize,
    /// Bus time per frame, in full-speed bit times.
    pub frame_budget: u32,
    /// Share of `frame_budget` periodic traffic may reserve.
    pub admission_percent: u32,
    /// TD pool limit, in 4 KiB pages.
    pub max_td_pages: usize,
    /// QH pool limit, in 4 KiB pages.
    pub max_qh_pages: usize,
    /// Frame boundaries to wait before reclaiming an unlinked descriptor.
    pub quiesce_frames: u16,
    /// Width of the hardware frame counter.
    pub frame_number_mask: u16,
    /// How many frames ahead of the current one an idle isochronous
    /// endpoint starts.
    pub isoc_start_lead: u16,
    /// Bandwidth reclamation loop target, `None` to never close the loop.
    pub reclamation: Option<ReclamationTarget>,
    /// Let full-speed control transfers use the reclamation loop too.
    pub control_reclamation: bool,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self {
            virtual_frames: 128,
            frame_budget: 12_000,
            admission_percent: 90,
            max_td_pages: 16,
            max_qh_pages: 4,
            quiesce_frames: 2,
            frame_number_mask: 0x7FF,
            isoc_start_lead: 3,
            reclamation: Some(ReclamationTarget::Bulk),
            control_reclamation: false,
        }
    }

    pub fn with_virtual_frames(mut self, frames: usize) -> Self {
        self.virtual_frames = frames;
        self
    }

    pub fn with_admission(mut self, frame_budget: u32, percent: u32) -> Self {
        self.frame_budget = frame_budget;
        self.admission_percent = percent;
        self
    }

    pub fn with_pool_limits(mut self, td_pages: usize, qh_pages: usize) -> Self {
        self.max_td_pages = td_pages;
        self.max_qh_pages = qh_pages;
        self
    }

    pub fn with_quiesce_frames(mut self, frames: u16) -> Self {
        self.quiesce_frames = frames;
        self
    }

    pub fn with_reclamation(mut self, target: Option<ReclamationTarget>) -> Self {
        self.reclamation = target;
        self
    }

    pub fn with_control_reclamation(mut self, enabled: bool) -> Self {
        self.control_reclamation = enabled;
        self
    }

    pub fn with_isoc_start_lead(mut self, frames: u16) -> Self {
        self.isoc_start_lead = frames;
        self
    }

    /// Per-slot admission limit.
    pub fn admission_limit(&self) -> u32 {
        (self.frame_budget as u64 * self.admission_percent as u64 / 100) as u32
    }

    pub fn validate(&self) -> UhciResult<()> {
        let v = self.virtual_frames;
        if v == 0 || !v.is_power_of_two() || UHCI_FRAME_LIST_COUNT % v != 0 {
            return Err(UhciError::InvalidArgument {
                name: "virtual_frames",
                value: "must be a power of two dividing 1024",
            });
        }
        if self.admission_percent == 0 || self.admission_percent > 100 {
            return Err(UhciError::InvalidArgument {
                name: "admission_percent",
                value: "must be in 1..=100",
            });
        }
        if self.quiesce_frames == 0 {
            return Err(UhciError::InvalidArgument {
                name: "quiesce_frames",
                value: "zero",
            });
        }
        if !(self.frame_number_mask as u32 + 1).is_power_of_two()
            || (self.frame_number_mask as usize) < UHCI_FRAME_LIST_COUNT - 1
        {
            return Err(UhciError::InvalidArgument {
                name: "frame_number_mask",
                value: "must be 2^n - 1 covering the frame list",
            });
        }
        // One dummy head TD and QH per slot, plus the fixed chain.
        if self.max_td_pages * TDS_PER_PAGE <= v {
            return Err(UhciError::InvalidArgument {
                name: "max_td_pages",
                value: "too small for the virtual frame list",
            });
        }
        if self.max_qh_pages * QHS_PER_PAGE < v + FIXED_QHS {
            return Err(UhciError::InvalidArgument {
                name: "max_qh_pages",
                value: "too small for the virtual frame list",
            });
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}
