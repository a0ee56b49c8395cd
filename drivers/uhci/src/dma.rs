//! DMA address plumbing
//!
//! The scheduler never assumes an identity mapping: every page the
//! controller reads (descriptor pages, the frame list) is translated through
//! a [`DmaMapper`] supplied by the platform.

use crate::error::{UhciError, UhciResult};

/// Hardware alignment unit for descriptor pages and the frame list.
pub const PAGE_SIZE: usize = 4096;

/// 32-bit bus address as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(u32);

impl PhysicalAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    pub const fn is_aligned(self, align: u32) -> bool {
        self.0 & (align - 1) == 0
    }
}

/// A caller-owned buffer the controller reads from or writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    pub phys: PhysicalAddress,
    pub len: usize,
}

impl DmaBuffer {
    pub const fn new(phys: PhysicalAddress, len: usize) -> Self {
        Self { phys, len }
    }

    /// Zero-length data stage.
    pub const fn empty() -> Self {
        Self {
            phys: PhysicalAddress(0),
            len: 0,
        }
    }

    /// Whether every byte lies below the 4 GiB the controller can address.
    pub fn fits_bus(&self) -> bool {
        u64::try_from(self.len)
            .ok()
            .and_then(|len| len.checked_add(self.phys.as_u32() as u64))
            .is_some_and(|end| end <= 1 << 32)
    }
}

/// Translates page-aligned kernel memory into bus addresses.
pub trait DmaMapper: Send {
    /// Map one [`PAGE_SIZE`] page starting at `virt`.
    ///
    /// The page stays at the same location until `unmap_page` is called
    /// with the returned address.
    fn map_page(&mut self, virt: *const u8) -> UhciResult<PhysicalAddress>;

    fn unmap_page(&mut self, phys: PhysicalAddress);
}

/// Mapper for kernels that identity-map the low 4 GiB.
#[derive(Debug, Default)]
pub struct IdentityMapper;

impl DmaMapper for IdentityMapper {
    fn map_page(&mut self, virt: *const u8) -> UhciResult<PhysicalAddress> {
        let addr = virt as usize;
        if addr % PAGE_SIZE != 0 {
            return Err(UhciError::InvalidArgument {
                name: "virt",
                value: "not page aligned",
            });
        }
        let addr = u32::try_from(addr).map_err(|_| UhciError::InvalidArgument {
            name: "virt",
            value: "above 4 GiB",
        })?;
        Ok(PhysicalAddress::new(addr))
    }

    fn unmap_page(&mut self, _phys: PhysicalAddress) {}
}
