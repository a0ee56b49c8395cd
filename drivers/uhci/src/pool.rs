//! Descriptor pool
//!
//! TDs and QHs are carved out of 4 KiB pages that are mapped once and never
//! move. A handle is a flat index: `index / PER_PAGE` selects the page,
//! `index % PER_PAGE` the slot inside it, so resolving a handle needs no
//! per-descriptor bookkeeping. Pages are only returned to the mapper when the
//! pool itself is dropped.
//!
//! The soft descriptor operations (`link_td`, `link_qh`, `terminate`,
//! `is_active`) live here as well because they only need a handle-to-memory
//! lookup. None of them block and all of them are O(1).

use alloc::{boxed::Box, vec::Vec};
use core::mem::size_of;

use crate::{
    descriptor::{DescriptorKind, HwQh, HwTd, LinkPointer},
    dma::{DmaMapper, PhysicalAddress, PAGE_SIZE},
    error::{UhciError, UhciResult},
};

/// TDs per pool page
pub const TDS_PER_PAGE: usize = PAGE_SIZE / size_of::<HwTd>();

/// QHs per pool page
pub const QHS_PER_PAGE: usize = PAGE_SIZE / size_of::<HwQh>();

#[repr(C, align(4096))]
struct TdPage {
    tds: [HwTd; TDS_PER_PAGE],
}

#[repr(C, align(4096))]
struct QhPage {
    qhs: [HwQh; QHS_PER_PAGE],
}

const _: () = assert!(size_of::<TdPage>() == PAGE_SIZE);
const _: () = assert!(size_of::<QhPage>() == PAGE_SIZE);

impl TdPage {
    fn new() -> Self {
        Self {
            tds: core::array::from_fn(|_| HwTd::new()),
        }
    }
}

impl QhPage {
    fn new() -> Self {
        Self {
            qhs: core::array::from_fn(|_| HwQh::new()),
        }
    }
}

struct MappedPage<P> {
    page: Box<P>,
    phys: PhysicalAddress,
}

/// Handle to a pool-owned transfer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdHandle(u32);

/// Handle to a pool-owned queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QhHandle(u32);

impl TdHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl QhHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle of either descriptor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHandle {
    Td(TdHandle),
    Qh(QhHandle),
}

impl DescriptorHandle {
    pub fn kind(self) -> DescriptorKind {
        match self {
            Self::Td(_) => DescriptorKind::TransferDescriptor,
            Self::Qh(_) => DescriptorKind::QueueHead,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub td_pages: usize,
    pub qh_pages: usize,
    pub tds_total: usize,
    pub tds_free: usize,
    pub qhs_total: usize,
    pub qhs_free: usize,
    pub allocations: u64,
    pub deallocations: u64,
    pub allocation_failures: u64,
}

impl PoolStats {
    pub fn tds_in_use(&self) -> usize {
        self.tds_total - self.tds_free
    }

    pub fn qhs_in_use(&self) -> usize {
        self.qhs_total - self.qhs_free
    }
}

/// Page-chunked TD/QH allocator.
pub struct DescriptorPool<M: DmaMapper> {
    mapper: M,
    td_pages: Vec<MappedPage<TdPage>>,
    qh_pages: Vec<MappedPage<QhPage>>,
    td_in_use: Vec<bool>,
    qh_in_use: Vec<bool>,
    free_tds: Vec<TdHandle>,
    free_qhs: Vec<QhHandle>,
    max_td_pages: usize,
    max_qh_pages: usize,
    allocations: u64,
    deallocations: u64,
    allocation_failures: u64,
}

impl<M: DmaMapper> DescriptorPool<M> {
    /// Create an empty pool. Pages are mapped on demand up to the limits.
    pub fn new(mapper: M, max_td_pages: usize, max_qh_pages: usize) -> Self {
        Self {
            mapper,
            td_pages: Vec::new(),
            qh_pages: Vec::new(),
            td_in_use: Vec::new(),
            qh_in_use: Vec::new(),
            free_tds: Vec::new(),
            free_qhs: Vec::new(),
            max_td_pages,
            max_qh_pages,
            allocations: 0,
            deallocations: 0,
            allocation_failures: 0,
        }
    }

    fn map<P>(&mut self, page: Box<P>) -> UhciResult<MappedPage<P>> {
        let phys = self.mapper.map_page(&*page as *const P as *const u8)?;
        if !phys.is_aligned(PAGE_SIZE as u32) {
            self.mapper.unmap_page(phys);
            return Err(UhciError::InvalidState {
                expected: "page-aligned bus address",
                actual: "unaligned mapping",
            });
        }
        Ok(MappedPage { page, phys })
    }

    fn grow_tds(&mut self) -> UhciResult<()> {
        if self.td_pages.len() >= self.max_td_pages {
            self.allocation_failures += 1;
            log::warn!(
                "[UHCI] TD pool exhausted ({} pages, {} descriptors)",
                self.td_pages.len(),
                self.td_in_use.len()
            );
            return Err(UhciError::OutOfMemory {
                kind: DescriptorKind::TransferDescriptor,
                requested: 1,
                available: 0,
            });
        }
        let mapped = self.map(Box::new(TdPage::new()))?;
        let base = self.td_in_use.len();
        self.td_pages.push(mapped);
        self.td_in_use.resize(base + TDS_PER_PAGE, false);
        // Lowest index is handed out first.
        self.free_tds
            .extend((base..base + TDS_PER_PAGE).rev().map(|i| TdHandle(i as u32)));
        log::debug!("[UHCI] TD pool grew to {} pages", self.td_pages.len());
        Ok(())
    }

    fn grow_qhs(&mut self) -> UhciResult<()> {
        if self.qh_pages.len() >= self.max_qh_pages {
            self.allocation_failures += 1;
            log::warn!(
                "[UHCI] QH pool exhausted ({} pages, {} descriptors)",
                self.qh_pages.len(),
                self.qh_in_use.len()
            );
            return Err(UhciError::OutOfMemory {
                kind: DescriptorKind::QueueHead,
                requested: 1,
                available: 0,
            });
        }
        let mapped = self.map(Box::new(QhPage::new()))?;
        let base = self.qh_in_use.len();
        self.qh_pages.push(mapped);
        self.qh_in_use.resize(base + QHS_PER_PAGE, false);
        self.free_qhs
            .extend((base..base + QHS_PER_PAGE).rev().map(|i| QhHandle(i as u32)));
        log::debug!("[UHCI] QH pool grew to {} pages", self.qh_pages.len());
        Ok(())
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Hand out a cleared TD, mapping another page if the free list is empty.
    pub fn alloc_td(&mut self) -> UhciResult<TdHandle> {
        if self.free_tds.is_empty() {
            self.grow_tds()?;
        }
        let handle = self.free_tds.pop().ok_or(UhciError::OutOfMemory {
            kind: DescriptorKind::TransferDescriptor,
            requested: 1,
            available: 0,
        })?;
        self.td_in_use[handle.index()] = true;
        self.td(handle).clear();
        self.allocations += 1;
        Ok(handle)
    }

    /// Hand out a cleared QH, mapping another page if the free list is empty.
    pub fn alloc_qh(&mut self) -> UhciResult<QhHandle> {
        if self.free_qhs.is_empty() {
            self.grow_qhs()?;
        }
        let handle = self.free_qhs.pop().ok_or(UhciError::OutOfMemory {
            kind: DescriptorKind::QueueHead,
            requested: 1,
            available: 0,
        })?;
        self.qh_in_use[handle.index()] = true;
        self.qh(handle).clear();
        self.allocations += 1;
        Ok(handle)
    }

    /// Allocate `count` TDs or none at all.
    pub fn alloc_tds(&mut self, count: usize) -> UhciResult<Vec<TdHandle>> {
        let obtainable = self.tds_obtainable();
        if count > obtainable {
            self.allocation_failures += 1;
            log::warn!(
                "[UHCI] {} TDs requested, pool can supply {}",
                count,
                obtainable
            );
            return Err(UhciError::OutOfMemory {
                kind: DescriptorKind::TransferDescriptor,
                requested: count,
                available: obtainable,
            });
        }
        let mut tds = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc_td() {
                Ok(td) => tds.push(td),
                Err(err) => {
                    for td in tds {
                        // Fresh TDs are inactive, so this cannot fail.
                        let _ = self.free_td(td);
                    }
                    return Err(match err {
                        UhciError::OutOfMemory { kind, .. } => UhciError::OutOfMemory {
                            kind,
                            requested: count,
                            available: self.free_tds.len(),
                        },
                        other => other,
                    });
                }
            }
        }
        Ok(tds)
    }

    /// TDs available without exceeding the page limit.
    pub fn tds_obtainable(&self) -> usize {
        let unmapped = self.max_td_pages.saturating_sub(self.td_pages.len());
        self.free_tds.len() + unmapped * TDS_PER_PAGE
    }

    /// Return a TD to the free list. Double frees and (in debug builds)
    /// active TDs are reported as corruption.
    pub fn free_td(&mut self, handle: TdHandle) -> UhciResult<()> {
        if !self.td_in_use.get(handle.index()).copied().unwrap_or(false) {
            return Err(UhciError::ScheduleCorruption {
                reason: "TD freed twice or never allocated",
            });
        }
        if cfg!(debug_assertions) && self.td(handle).is_active() {
            return Err(UhciError::ScheduleCorruption {
                reason: "TD freed while still active",
            });
        }
        self.td(handle).clear();
        self.td_in_use[handle.index()] = false;
        self.free_tds.push(handle);
        self.deallocations += 1;
        Ok(())
    }

    /// Return a QH to the free list.
    pub fn free_qh(&mut self, handle: QhHandle) -> UhciResult<()> {
        if !self.qh_in_use.get(handle.index()).copied().unwrap_or(false) {
            return Err(UhciError::ScheduleCorruption {
                reason: "QH freed twice or never allocated",
            });
        }
        self.qh(handle).clear();
        self.qh_in_use[handle.index()] = false;
        self.free_qhs.push(handle);
        self.deallocations += 1;
        Ok(())
    }

    /// Allocate a descriptor of either kind.
    pub fn allocate(&mut self, kind: DescriptorKind) -> UhciResult<DescriptorHandle> {
        match kind {
            DescriptorKind::TransferDescriptor => self.alloc_td().map(DescriptorHandle::Td),
            DescriptorKind::QueueHead => self.alloc_qh().map(DescriptorHandle::Qh),
        }
    }

    /// Free a descriptor of either kind.
    pub fn free(&mut self, handle: DescriptorHandle) -> UhciResult<()> {
        match handle {
            DescriptorHandle::Td(td) => self.free_td(td),
            DescriptorHandle::Qh(qh) => self.free_qh(qh),
        }
    }

    /// Bus address of either descriptor kind.
    pub fn physical_address(&self, handle: DescriptorHandle) -> PhysicalAddress {
        match handle {
            DescriptorHandle::Td(td) => self.td_phys(td),
            DescriptorHandle::Qh(qh) => self.qh_phys(qh),
        }
    }

    // ========================================================================
    // Handle resolution
    // ========================================================================

    /// Hardware view of a TD.
    pub fn td(&self, handle: TdHandle) -> &HwTd {
        let idx = handle.index();
        &self.td_pages[idx / TDS_PER_PAGE].page.tds[idx % TDS_PER_PAGE]
    }

    /// Hardware view of a QH.
    pub fn qh(&self, handle: QhHandle) -> &HwQh {
        let idx = handle.index();
        &self.qh_pages[idx / QHS_PER_PAGE].page.qhs[idx % QHS_PER_PAGE]
    }

    /// Bus address the controller uses for a TD.
    pub fn td_phys(&self, handle: TdHandle) -> PhysicalAddress {
        let idx = handle.index();
        self.td_pages[idx / TDS_PER_PAGE]
            .phys
            .offset(((idx % TDS_PER_PAGE) * size_of::<HwTd>()) as u32)
    }

    /// Bus address the controller uses for a QH.
    pub fn qh_phys(&self, handle: QhHandle) -> PhysicalAddress {
        let idx = handle.index();
        self.qh_pages[idx / QHS_PER_PAGE]
            .phys
            .offset(((idx % QHS_PER_PAGE) * size_of::<HwQh>()) as u32)
    }

    /// Map a bus address back to the TD it names, if this pool owns it.
    pub fn resolve_td(&self, phys: PhysicalAddress) -> Option<TdHandle> {
        let (page, offset) = self
            .td_pages
            .iter()
            .enumerate()
            .find_map(|(i, p)| locate(p.phys, phys).map(|off| (i, off)))?;
        if offset % size_of::<HwTd>() != 0 {
            return None;
        }
        Some(TdHandle(
            (page * TDS_PER_PAGE + offset / size_of::<HwTd>()) as u32,
        ))
    }

    /// Map a bus address back to the QH it names, if this pool owns it.
    pub fn resolve_qh(&self, phys: PhysicalAddress) -> Option<QhHandle> {
        let (page, offset) = self
            .qh_pages
            .iter()
            .enumerate()
            .find_map(|(i, p)| locate(p.phys, phys).map(|off| (i, off)))?;
        if offset % size_of::<HwQh>() != 0 {
            return None;
        }
        Some(QhHandle(
            (page * QHS_PER_PAGE + offset / size_of::<HwQh>()) as u32,
        ))
    }

    /// Whether a TD is currently handed out.
    pub fn td_allocated(&self, handle: TdHandle) -> bool {
        self.td_in_use.get(handle.index()).copied().unwrap_or(false)
    }

    /// Whether a QH is currently handed out.
    pub fn qh_allocated(&self, handle: QhHandle) -> bool {
        self.qh_in_use.get(handle.index()).copied().unwrap_or(false)
    }

    // ========================================================================
    // Soft descriptor operations
    // ========================================================================

    /// Point `prev` at `next` inside a queue (depth-first).
    pub fn link_td(&self, prev: TdHandle, next: TdHandle) {
        self.td(prev).set_link(LinkPointer::td(self.td_phys(next)));
    }

    /// Point a TD horizontally at a QH.
    pub fn link_td_to_qh(&self, prev: TdHandle, next: QhHandle) {
        self.td(prev).set_link(LinkPointer::Qh(self.qh_phys(next)));
    }

    /// Point `prev`'s horizontal link at `next`.
    pub fn link_qh(&self, prev: QhHandle, next: QhHandle) {
        self.qh(prev)
            .set_head_link(LinkPointer::Qh(self.qh_phys(next)));
    }

    /// Publish a TD chain as the QH's pending element.
    pub fn set_qh_element(&self, qh: QhHandle, first: Option<TdHandle>) {
        let link = match first {
            Some(td) => LinkPointer::td(self.td_phys(td)),
            None => LinkPointer::Terminate,
        };
        self.qh(qh).set_element(link);
    }

    /// Terminate a TD's link, or a QH's element link.
    pub fn terminate(&self, handle: DescriptorHandle) {
        match handle {
            DescriptorHandle::Td(td) => self.td(td).set_link(LinkPointer::Terminate),
            DescriptorHandle::Qh(qh) => self.qh(qh).set_element(LinkPointer::Terminate),
        }
    }

    /// Whether the controller would still execute a TD.
    pub fn is_active(&self, td: TdHandle) -> bool {
        self.td(td).is_active()
    }

    // ========================================================================
    // External pages and statistics
    // ========================================================================

    /// Map a page that is not a descriptor page (the frame list).
    pub fn map_page(&mut self, virt: *const u8) -> UhciResult<PhysicalAddress> {
        self.mapper.map_page(virt)
    }

    /// Release a page mapped with `map_page`.
    pub fn unmap_page(&mut self, phys: PhysicalAddress) {
        self.mapper.unmap_page(phys);
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Snapshot of page and descriptor counts.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            td_pages: self.td_pages.len(),
            qh_pages: self.qh_pages.len(),
            tds_total: self.td_in_use.len(),
            tds_free: self.free_tds.len(),
            qhs_total: self.qh_in_use.len(),
            qhs_free: self.free_qhs.len(),
            allocations: self.allocations,
            deallocations: self.deallocations,
            allocation_failures: self.allocation_failures,
        }
    }
}

impl<M: DmaMapper> Drop for DescriptorPool<M> {
    fn drop(&mut self) {
        for page in self.td_pages.iter() {
            self.mapper.unmap_page(page.phys);
        }
        for page in self.qh_pages.iter() {
            self.mapper.unmap_page(page.phys);
        }
    }
}

fn locate(base: PhysicalAddress, phys: PhysicalAddress) -> Option<usize> {
    let offset = phys.as_u32().checked_sub(base.as_u32())? as usize;
    (offset < PAGE_SIZE).then_some(offset)
}
