//! Non-periodic class chains
//!
//! After the periodic part of every slot the controller walks one shared
//! chain of boundary QHs:
//!
//! ```text
//! low-speed control -> full-speed control -> bulk -> last QH (-> terminal TD)
//! ```
//!
//! Endpoint QHs are spliced in behind the boundary QH of their class and in
//! front of the next boundary, so class order is fixed by construction. The
//! last QH can loop back to the bulk (or full-speed control) boundary to let
//! the controller reclaim the rest of the frame; that loop is closed only
//! while at least one transfer asked for it.

use alloc::vec::Vec;

use crate::{
    descriptor::LinkPointer,
    dma::DmaMapper,
    error::{UhciError, UhciResult},
    pool::{DescriptorHandle, DescriptorPool, QhHandle, TdHandle},
};

/// Non-periodic traffic classes, in service order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScheduleClass {
    LowSpeedControl,
    FullSpeedControl,
    Bulk,
}

impl ScheduleClass {
    pub const ALL: [Self; 3] = [Self::LowSpeedControl, Self::FullSpeedControl, Self::Bulk];

    fn index(self) -> usize {
        self as usize
    }
}

/// Where the reclamation loop re-enters the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclamationTarget {
    FullSpeedControl,
    Bulk,
}

/// Boundary QHs and the endpoint QHs spliced between them.
pub struct ClassChains {
    boundary: [QhHandle; 3],
    members: [Vec<QhHandle>; 3],
    last_qh: QhHandle,
    terminal_td: TdHandle,
    reclamation: Option<ReclamationTarget>,
    loops: u32,
}

impl ClassChains {
    pub fn new<M: DmaMapper>(
        pool: &mut DescriptorPool<M>,
        reclamation: Option<ReclamationTarget>,
    ) -> UhciResult<Self> {
        // Some PIIX parts walk past a QH with a terminated element, so the
        // last QH always holds one inactive TD.
        let terminal_td = pool.alloc_td()?;
        let last_qh = pool.alloc_qh()?;
        pool.qh(last_qh)
            .set_element(LinkPointer::td(pool.td_phys(terminal_td)));

        let bulk = pool.alloc_qh()?;
        pool.link_qh(bulk, last_qh);
        let fs_control = pool.alloc_qh()?;
        pool.link_qh(fs_control, bulk);
        let ls_control = pool.alloc_qh()?;
        pool.link_qh(ls_control, fs_control);

        Ok(Self {
            boundary: [ls_control, fs_control, bulk],
            members: [Vec::new(), Vec::new(), Vec::new()],
            last_qh,
            terminal_td,
            reclamation,
            loops: 0,
        })
    }

    /// First QH after the periodic schedule.
    pub fn entry(&self) -> QhHandle {
        self.boundary[0]
    }

    /// Skeleton QH that opens `class`.
    pub fn boundary(&self, class: ScheduleClass) -> QhHandle {
        self.boundary[class.index()]
    }

    /// Endpoint QHs linked into `class`, in schedule order.
    pub fn members(&self, class: ScheduleClass) -> &[QhHandle] {
        &self.members[class.index()]
    }

    /// QH that ends every frame's chain.
    pub fn last_qh(&self) -> QhHandle {
        self.last_qh
    }

    pub fn terminal_td(&self) -> TdHandle {
        self.terminal_td
    }

    /// Armed transfers currently holding the reclamation loop.
    pub fn reclamation_users(&self) -> u32 {
        self.loops
    }

    fn end(&self, class: ScheduleClass) -> QhHandle {
        self.members[class.index()]
            .last()
            .copied()
            .unwrap_or(self.boundary[class.index()])
    }

    /// Splice `qh` at the end of its class.
    pub fn add<M: DmaMapper>(
        &mut self,
        pool: &DescriptorPool<M>,
        class: ScheduleClass,
        qh: QhHandle,
    ) {
        let end = self.end(class);
        pool.qh(qh)
            .set_head_link_raw(pool.qh(end).head_link_raw());
        pool.link_qh(end, qh);
        self.members[class.index()].push(qh);
        log::debug!("[UHCI] Linked QH {:?} into {:?}", qh, class);
    }

    /// Unlink `qh` from its class. Its element is terminated first.
    pub fn remove<M: DmaMapper>(
        &mut self,
        pool: &DescriptorPool<M>,
        class: ScheduleClass,
        qh: QhHandle,
    ) -> UhciResult<()> {
        let list = &mut self.members[class.index()];
        let pos = list
            .iter()
            .position(|&q| q == qh)
            .ok_or(UhciError::ScheduleCorruption {
                reason: "QH not in its class chain",
            })?;
        let prev = if pos == 0 {
            self.boundary[class.index()]
        } else {
            list[pos - 1]
        };
        if !pool.qh(qh).element().is_terminate() {
            pool.terminate(DescriptorHandle::Qh(qh));
        }
        pool.qh(prev)
            .set_head_link_raw(pool.qh(qh).head_link_raw());
        list.remove(pos);
        log::debug!("[UHCI] Unlinked QH {:?} from {:?}", qh, class);
        Ok(())
    }

    // ========================================================================
    // Bandwidth reclamation
    // ========================================================================

    fn loop_target(&self) -> Option<QhHandle> {
        match self.reclamation? {
            ReclamationTarget::FullSpeedControl => {
                Some(self.boundary(ScheduleClass::FullSpeedControl))
            }
            ReclamationTarget::Bulk => Some(self.boundary(ScheduleClass::Bulk)),
        }
    }

    /// Register one user of the reclamation loop. Returns whether the loop
    /// is configured at all.
    pub fn add_loop<M: DmaMapper>(&mut self, pool: &DescriptorPool<M>) -> bool {
        let Some(target) = self.loop_target() else {
            return false;
        };
        self.loops += 1;
        if self.loops == 1 {
            pool.link_qh(self.last_qh, target);
            log::debug!("[UHCI] Reclamation loop closed");
        }
        true
    }

    pub fn remove_loop<M: DmaMapper>(&mut self, pool: &DescriptorPool<M>) -> UhciResult<()> {
        if self.loops == 0 {
            return Err(UhciError::ScheduleCorruption {
                reason: "reclamation loop released more often than taken",
            });
        }
        self.loops -= 1;
        if self.loops == 0 {
            pool.qh(self.last_qh).set_head_link(LinkPointer::Terminate);
            log::debug!("[UHCI] Reclamation loop opened");
        }
        Ok(())
    }

    // ========================================================================
    // Audit
    // ========================================================================

    pub fn verify<M: DmaMapper>(&self, pool: &DescriptorPool<M>) -> UhciResult<()> {
        let corrupt = |reason: &'static str| -> UhciResult<()> {
            Err(UhciError::ScheduleCorruption { reason })
        };

        let mut cur = self.entry();
        let mut expected = Vec::new();
        for class in ScheduleClass::ALL {
            if class != ScheduleClass::LowSpeedControl {
                expected.push(self.boundary(class));
            }
            expected.extend(self.members(class).iter().copied());
        }
        expected.push(self.last_qh);

        for next in expected {
            if pool.qh(cur).head_link() != LinkPointer::Qh(pool.qh_phys(next)) {
                return corrupt("class chain out of order");
            }
            if !pool.qh_allocated(next) {
                return corrupt("class chain names a freed QH");
            }
            cur = next;
        }

        let tail = pool.qh(self.last_qh).head_link();
        match (self.loops, self.loop_target()) {
            (0, _) | (_, None) if !tail.is_terminate() => {
                return corrupt("reclamation loop closed without users")
            }
            (n, Some(target)) if n > 0 && tail != LinkPointer::Qh(pool.qh_phys(target)) => {
                return corrupt("reclamation loop open while in use")
            }
            _ => {}
        }

        if pool.qh(self.last_qh).element() != LinkPointer::td(pool.td_phys(self.terminal_td)) {
            return corrupt("last QH lost its terminal TD");
        }
        if pool.is_active(self.terminal_td) {
            return corrupt("terminal TD is active");
        }
        Ok(())
    }
}
