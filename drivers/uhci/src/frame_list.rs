//! Real and virtual frame lists
//!
//! The controller fetches one pointer per millisecond from a 1024-entry,
//! page-aligned frame list. That list is filled once at start-up: entry `i`
//! points at the dummy head TD of virtual slot `i mod V` and never changes
//! afterwards. All scheduling happens behind those dummy heads:
//!
//! ```text
//! real[i] -> head TD -> iso TD ... -> head QH -> intr QH ... -> low-speed control
//! ```
//!
//! Isochronous TDs are inserted right after the head TD, interrupt QHs after
//! the slot's current tail QH. The dummy head TD is never active and never
//! unlinked, so every frame entry stays valid while the interior changes.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    descriptor::LinkPointer,
    dma::{DmaMapper, PhysicalAddress, PAGE_SIZE},
    error::{UhciError, UhciResult},
    pool::{DescriptorHandle, DescriptorPool, QhHandle, TdHandle},
};

/// Entries in the hardware frame list.
pub const UHCI_FRAME_LIST_COUNT: usize = 1024;

#[repr(C, align(4096))]
struct FrameListPage {
    entries: [AtomicU32; UHCI_FRAME_LIST_COUNT],
}

const _: () = assert!(core::mem::size_of::<FrameListPage>() == PAGE_SIZE);

impl FrameListPage {
    fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| AtomicU32::new(1)),
        }
    }
}

/// Set of virtual slots polled by one periodic endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSet {
    offset: usize,
    interval: usize,
    frames: usize,
}

impl SlotSet {
    /// Slots `j` with `j mod interval == offset mod interval`, out of
    /// `frames` virtual slots. `interval` must be a power of two no larger
    /// than `frames`.
    pub fn new(offset: usize, interval: usize, frames: usize) -> Self {
        Self {
            offset: offset % interval,
            interval,
            frames,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.frames / self.interval
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, slot: usize) -> bool {
        slot < self.frames && slot % self.interval == self.offset
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        (self.offset..self.frames).step_by(self.interval)
    }
}

/// Round a polling interval in frames down to a power of two in `1..=frames`.
pub fn normalize_interval(interval: u16, frames: usize) -> UhciResult<usize> {
    if interval == 0 {
        return Err(UhciError::InvalidArgument {
            name: "interval",
            value: "zero",
        });
    }
    let clamped = (interval as usize).min(frames);
    Ok(1 << (usize::BITS - 1 - clamped.leading_zeros()))
}

/// One virtual frame slot.
#[derive(Debug)]
pub struct VirtualFrame {
    head_td: TdHandle,
    head_qh: QhHandle,
    tail_qh: QhHandle,
    iso_tds: Vec<TdHandle>,
    intr_qhs: Vec<QhHandle>,
}

impl VirtualFrame {
    pub fn head_td(&self) -> TdHandle {
        self.head_td
    }

    pub fn head_qh(&self) -> QhHandle {
        self.head_qh
    }

    pub fn tail_qh(&self) -> QhHandle {
        self.tail_qh
    }

    pub fn iso_tds(&self) -> &[TdHandle] {
        &self.iso_tds
    }

    pub fn interrupt_qhs(&self) -> &[QhHandle] {
        &self.intr_qhs
    }
}

/// Hardware frame list plus its virtual slots.
pub struct FrameList {
    page: Box<FrameListPage>,
    phys: PhysicalAddress,
    slots: Vec<VirtualFrame>,
    entry: QhHandle,
}

impl FrameList {
    /// Build `virtual_frames` slots whose chains all end in `entry`, the
    /// first non-periodic QH.
    pub fn new<M: DmaMapper>(
        pool: &mut DescriptorPool<M>,
        virtual_frames: usize,
        entry: QhHandle,
    ) -> UhciResult<Self> {
        if virtual_frames == 0
            || !virtual_frames.is_power_of_two()
            || virtual_frames > UHCI_FRAME_LIST_COUNT
        {
            return Err(UhciError::InvalidArgument {
                name: "virtual_frames",
                value: "must be a power of two in 1..=1024",
            });
        }

        let page = Box::new(FrameListPage::new());
        let phys = pool.map_page(&*page as *const FrameListPage as *const u8)?;

        let mut slots = Vec::with_capacity(virtual_frames);
        for _ in 0..virtual_frames {
            match Self::build_slot(pool, entry) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    pool.unmap_page(phys);
                    return Err(err);
                }
            }
        }

        for (i, pointer) in page.entries.iter().enumerate() {
            let head = pool.td_phys(slots[i % virtual_frames].head_td);
            pointer.store(LinkPointer::td_horizontal(head).encode(), Ordering::Release);
        }

        log::debug!(
            "[UHCI] Frame list at {:#x}: {} virtual slots",
            phys.as_u32(),
            virtual_frames
        );

        Ok(Self {
            page,
            phys,
            slots,
            entry,
        })
    }

    fn build_slot<M: DmaMapper>(
        pool: &mut DescriptorPool<M>,
        entry: QhHandle,
    ) -> UhciResult<VirtualFrame> {
        let head_td = pool.alloc_td()?;
        let head_qh = pool.alloc_qh()?;
        pool.link_qh(head_qh, entry);
        pool.terminate(DescriptorHandle::Qh(head_qh));
        // Head TD stays inactive forever; it only exists to be pointed at.
        pool.link_td_to_qh(head_td, head_qh);
        Ok(VirtualFrame {
            head_td,
            head_qh,
            tail_qh: head_qh,
            iso_tds: Vec::new(),
            intr_qhs: Vec::new(),
        })
    }

    pub fn physical_address(&self) -> PhysicalAddress {
        self.phys
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &VirtualFrame {
        &self.slots[index]
    }

    /// Raw frame list entry `index`.
    pub fn entry(&self, index: usize) -> u32 {
        self.page.entries[index % UHCI_FRAME_LIST_COUNT].load(Ordering::Acquire)
    }

    pub fn slot_for_frame(&self, frame: u16) -> usize {
        frame as usize % self.slots.len()
    }

    /// Slots occupied by an endpoint of `interval` frames placed at
    /// `slot_index`.
    pub fn schedule_interval(&self, slot_index: usize, interval: usize) -> SlotSet {
        SlotSet::new(slot_index, interval, self.slots.len())
    }

    // ========================================================================
    // Interrupt queue heads
    // ========================================================================

    pub fn insert_interrupt_qh<M: DmaMapper>(
        &mut self,
        pool: &DescriptorPool<M>,
        slot: usize,
        qh: QhHandle,
    ) {
        let vf = &mut self.slots[slot];
        let tail = pool.qh(vf.tail_qh);
        pool.qh(qh).set_head_link_raw(tail.head_link_raw());
        pool.link_qh(vf.tail_qh, qh);
        vf.intr_qhs.push(qh);
        vf.tail_qh = qh;
    }

    pub fn remove_interrupt_qh<M: DmaMapper>(
        &mut self,
        pool: &DescriptorPool<M>,
        slot: usize,
        qh: QhHandle,
    ) -> UhciResult<()> {
        let vf = &mut self.slots[slot];
        let pos = vf
            .intr_qhs
            .iter()
            .position(|&q| q == qh)
            .ok_or(UhciError::ScheduleCorruption {
                reason: "interrupt QH not in its slot",
            })?;
        let prev = if pos == 0 {
            vf.head_qh
        } else {
            vf.intr_qhs[pos - 1]
        };
        if !pool.qh(qh).element().is_terminate() {
            pool.terminate(DescriptorHandle::Qh(qh));
        }
        pool.qh(prev).set_head_link_raw(pool.qh(qh).head_link_raw());
        vf.intr_qhs.remove(pos);
        if vf.tail_qh == qh {
            vf.tail_qh = prev;
        }
        Ok(())
    }

    // ========================================================================
    // Isochronous transfer descriptors
    // ========================================================================

    pub fn insert_iso_td<M: DmaMapper>(
        &mut self,
        pool: &DescriptorPool<M>,
        slot: usize,
        td: TdHandle,
    ) {
        let vf = &mut self.slots[slot];
        let head = pool.td(vf.head_td);
        pool.td(td).set_link_raw(head.link_raw());
        head.set_link(LinkPointer::td_horizontal(pool.td_phys(td)));
        vf.iso_tds.insert(0, td);
    }

    pub fn remove_iso_td<M: DmaMapper>(
        &mut self,
        pool: &DescriptorPool<M>,
        slot: usize,
        td: TdHandle,
    ) -> UhciResult<()> {
        let vf = &mut self.slots[slot];
        let pos = vf
            .iso_tds
            .iter()
            .position(|&t| t == td)
            .ok_or(UhciError::ScheduleCorruption {
                reason: "isochronous TD not in its slot",
            })?;
        let prev = if pos == 0 {
            vf.head_td
        } else {
            vf.iso_tds[pos - 1]
        };
        pool.td(prev).set_link_raw(pool.td(td).link_raw());
        vf.iso_tds.remove(pos);
        Ok(())
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Check the hardware links of every slot against the soft records.
    pub fn verify<M: DmaMapper>(&self, pool: &DescriptorPool<M>) -> UhciResult<()> {
        let corrupt = |reason: &'static str| -> UhciResult<()> {
            Err(UhciError::ScheduleCorruption { reason })
        };
        let entry_phys = pool.qh_phys(self.entry);

        for i in 0..UHCI_FRAME_LIST_COUNT {
            let head = pool.td_phys(self.slots[i % self.slots.len()].head_td);
            if self.entry(i) != LinkPointer::td_horizontal(head).encode() {
                return corrupt("frame list entry does not name its slot head");
            }
        }

        for vf in &self.slots {
            if pool.is_active(vf.head_td) {
                return corrupt("dummy head TD is active");
            }

            let mut link = pool.td(vf.head_td).link();
            for &td in &vf.iso_tds {
                match link {
                    LinkPointer::Td { phys, .. } if phys == pool.td_phys(td) => {}
                    _ => return corrupt("isochronous TD list broken"),
                }
                if !pool.td_allocated(td) {
                    return corrupt("isochronous TD linked after free");
                }
                link = pool.td(td).link();
            }
            if link != LinkPointer::Qh(pool.qh_phys(vf.head_qh)) {
                return corrupt("slot TD list does not end at the slot QH");
            }

            let mut cur = vf.head_qh;
            for &qh in &vf.intr_qhs {
                if pool.qh(cur).head_link() != LinkPointer::Qh(pool.qh_phys(qh)) {
                    return corrupt("interrupt QH list broken");
                }
                if !pool.qh_allocated(qh) {
                    return corrupt("interrupt QH linked after free");
                }
                cur = qh;
            }
            if cur != vf.tail_qh {
                return corrupt("slot tail QH out of date");
            }
            if pool.qh(cur).head_link() != LinkPointer::Qh(entry_phys) {
                return corrupt("periodic chain does not reach the control schedule");
            }
        }
        Ok(())
    }
}
