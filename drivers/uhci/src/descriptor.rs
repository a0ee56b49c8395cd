//! UHCI transfer descriptors and queue heads
//!
//! Hardware-visible layouts plus the bit encodings the controller expects:
//! - Link pointers (terminate, QH-select and depth-first bits)
//! - TD control/status word and actual-length encoding
//! - TD token (PID, device address, endpoint, data toggle, max length)
//!
//! Every hardware-visible word is an `AtomicU32`. The controller writes
//! status words and QH element pointers behind our back, so plain loads and
//! stores are never used on these fields. Loads use acquire ordering, stores
//! that publish a link use release ordering so the descriptor behind the
//! link is fully written before the controller can follow it.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::dma::PhysicalAddress;

/// Which fixed-size descriptor a pool handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    TransferDescriptor,
    QueueHead,
}

bitflags! {
    /// Low bits of every UHCI link pointer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LinkFlags: u32 {
        /// Nothing follows
        const TERMINATE = 1 << 0;
        /// Target is a queue head (otherwise a TD)
        const QH = 1 << 1;
        /// Depth-first: keep walking vertically after this TD
        const DEPTH_FIRST = 1 << 2;
    }
}

/// Descriptors are 16-byte aligned, so the low nibble holds flags.
pub const LINK_ADDRESS_MASK: u32 = !0xF;

/// Decoded link pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPointer {
    Terminate,
    Td {
        phys: PhysicalAddress,
        depth_first: bool,
    },
    Qh(PhysicalAddress),
}

impl LinkPointer {
    /// Link to a TD inside a queue; the controller continues down the queue.
    pub const fn td(phys: PhysicalAddress) -> Self {
        Self::Td {
            phys,
            depth_first: true,
        }
    }

    /// Horizontal link to a TD (isochronous list, dummy heads).
    pub const fn td_horizontal(phys: PhysicalAddress) -> Self {
        Self::Td {
            phys,
            depth_first: false,
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            Self::Terminate => LinkFlags::TERMINATE.bits(),
            Self::Td { phys, depth_first } => {
                let mut raw = phys.as_u32() & LINK_ADDRESS_MASK;
                if depth_first {
                    raw |= LinkFlags::DEPTH_FIRST.bits();
                }
                raw
            }
            Self::Qh(phys) => (phys.as_u32() & LINK_ADDRESS_MASK) | LinkFlags::QH.bits(),
        }
    }

    pub fn decode(raw: u32) -> Self {
        let flags = LinkFlags::from_bits_truncate(raw);
        let phys = PhysicalAddress::new(raw & LINK_ADDRESS_MASK);
        if flags.contains(LinkFlags::TERMINATE) {
            Self::Terminate
        } else if flags.contains(LinkFlags::QH) {
            Self::Qh(phys)
        } else {
            Self::Td {
                phys,
                depth_first: flags.contains(LinkFlags::DEPTH_FIRST),
            }
        }
    }

    pub fn is_terminate(self) -> bool {
        matches!(self, Self::Terminate)
    }

    /// Target address, `None` for a terminated link.
    pub fn address(self) -> Option<PhysicalAddress> {
        match self {
            Self::Terminate => None,
            Self::Td { phys, .. } | Self::Qh(phys) => Some(phys),
        }
    }
}

bitflags! {
    /// TD control/status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TdStatus: u32 {
        const BITSTUFF = 1 << 17;
        /// CRC error or timeout
        const CRC_TIMEOUT = 1 << 18;
        const NAK = 1 << 19;
        const BABBLE = 1 << 20;
        /// Data buffer overrun/underrun
        const DATA_BUFFER = 1 << 21;
        const STALLED = 1 << 22;
        /// Owned by the controller
        const ACTIVE = 1 << 23;
        /// Interrupt on complete
        const IOC = 1 << 24;
        /// Isochronous select
        const ISO = 1 << 25;
        const LOW_SPEED = 1 << 26;
        /// Error counter, two bits
        const ERROR_COUNT = 3 << 27;
        /// Short packet detect
        const SPD = 1 << 29;

        /// Actual length field (n - 1 encoded)
        const ACTUAL_LENGTH = 0x7FF;

        /// Conditions that retire a TD with an error
        const ERROR = Self::BITSTUFF.bits()
            | Self::CRC_TIMEOUT.bits()
            | Self::BABBLE.bits()
            | Self::DATA_BUFFER.bits()
            | Self::STALLED.bits();

        const _ = !0;
    }
}

/// Encoding of a zero actual length.
pub const ACTUAL_LENGTH_ZERO: u32 = 0x7FF;

impl TdStatus {
    /// Status for a freshly armed TD: three retries, active, zero length.
    pub fn armed(low_speed: bool, short_ok: bool) -> Self {
        let mut status = Self::ERROR_COUNT | Self::ACTIVE | Self::ACTUAL_LENGTH;
        status.set(Self::LOW_SPEED, low_speed);
        status.set(Self::SPD, short_ok);
        status
    }

    /// Bytes actually moved by the controller.
    pub fn actual_length(self) -> u16 {
        (self.bits().wrapping_add(1) & 0x7FF) as u16
    }

    /// Replace the actual-length field with `len` bytes.
    pub fn with_actual_length(self, len: u16) -> Self {
        let encoded = (len as u32).wrapping_sub(1) & 0x7FF;
        Self::from_bits_retain((self.bits() & !0x7FF) | encoded)
    }

    pub fn error_bits(self) -> Self {
        self & Self::ERROR
    }
}

/// USB packet identifiers used by UHCI tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pid {
    Setup = 0x2D,
    In = 0x69,
    Out = 0xE1,
}

impl Pid {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x2D => Some(Self::Setup),
            0x69 => Some(Self::In),
            0xE1 => Some(Self::Out),
            _ => None,
        }
    }
}

const TOKEN_TOGGLE: u32 = 1 << 19;

/// Decoded TD token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub pid: Pid,
    pub address: u8,
    pub endpoint: u8,
    pub toggle: bool,
    /// Maximum bytes for this TD, 0..=1023
    pub max_len: u16,
}

impl Token {
    pub fn encode(&self) -> u32 {
        // Length is stored as n-1; zero becomes 0x7FF.
        let max_len = (self.max_len as u32).wrapping_sub(1) & 0x7FF;
        (self.pid as u32)
            | ((self.address as u32 & 0x7F) << 8)
            | ((self.endpoint as u32 & 0xF) << 15)
            | (if self.toggle { TOKEN_TOGGLE } else { 0 })
            | (max_len << 21)
    }

    pub fn decode(raw: u32) -> Option<Self> {
        Some(Self {
            pid: Pid::from_raw((raw & 0xFF) as u8)?,
            address: ((raw >> 8) & 0x7F) as u8,
            endpoint: ((raw >> 15) & 0xF) as u8,
            toggle: raw & TOKEN_TOGGLE != 0,
            max_len: token_max_len(raw),
        })
    }
}

pub fn token_toggle(raw: u32) -> bool {
    raw & TOKEN_TOGGLE != 0
}

pub fn token_with_toggle(raw: u32, toggle: bool) -> u32 {
    if toggle {
        raw | TOKEN_TOGGLE
    } else {
        raw & !TOKEN_TOGGLE
    }
}

pub fn token_max_len(raw: u32) -> u16 {
    (((raw >> 21) + 1) & 0x7FF) as u16
}

pub fn token_pid(raw: u32) -> Option<Pid> {
    Pid::from_raw((raw & 0xFF) as u8)
}

/// UHCI Transfer Descriptor as the controller sees it.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct HwTd {
    link: AtomicU32,
    status: AtomicU32,
    token: AtomicU32,
    buffer: AtomicU32,
}

impl Default for HwTd {
    fn default() -> Self {
        Self::new()
    }
}

impl HwTd {
    pub const fn new() -> Self {
        Self {
            link: AtomicU32::new(1), // Terminate
            status: AtomicU32::new(0),
            token: AtomicU32::new(0),
            buffer: AtomicU32::new(0),
        }
    }

    pub fn link(&self) -> LinkPointer {
        LinkPointer::decode(self.link.load(Ordering::Acquire))
    }

    pub fn link_raw(&self) -> u32 {
        self.link.load(Ordering::Acquire)
    }

    pub fn set_link(&self, link: LinkPointer) {
        self.link.store(link.encode(), Ordering::Release);
    }

    pub(crate) fn set_link_raw(&self, raw: u32) {
        self.link.store(raw, Ordering::Release);
    }

    pub fn status(&self) -> TdStatus {
        TdStatus::from_bits_retain(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: TdStatus) {
        self.status.store(status.bits(), Ordering::Release);
    }

    /// Clear ACTIVE and IOC, returning the status seen just before.
    pub fn deactivate(&self) -> TdStatus {
        let clear = !(TdStatus::ACTIVE | TdStatus::IOC).bits();
        TdStatus::from_bits_retain(self.status.fetch_and(clear, Ordering::AcqRel))
    }

    pub fn token(&self) -> u32 {
        self.token.load(Ordering::Acquire)
    }

    pub fn set_token(&self, token: u32) {
        self.token.store(token, Ordering::Release);
    }

    pub fn buffer(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.buffer.load(Ordering::Acquire))
    }

    pub fn set_buffer(&self, buffer: PhysicalAddress) {
        self.buffer.store(buffer.as_u32(), Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.status().contains(TdStatus::ACTIVE)
    }

    /// Return every field to the power-on state.
    pub(crate) fn clear(&self) {
        self.status.store(0, Ordering::Release);
        self.token.store(0, Ordering::Relaxed);
        self.buffer.store(0, Ordering::Relaxed);
        self.link.store(LinkFlags::TERMINATE.bits(), Ordering::Release);
    }
}

/// UHCI Queue Head. Hardware reads 8 bytes; the slot is padded to the
/// 16-byte descriptor alignment.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct HwQh {
    /// Horizontal link (next QH or TD in the frame)
    head_link: AtomicU32,
    /// Element link (first pending TD of this queue)
    element_link: AtomicU32,
}

impl Default for HwQh {
    fn default() -> Self {
        Self::new()
    }
}

impl HwQh {
    pub const fn new() -> Self {
        Self {
            head_link: AtomicU32::new(1),
            element_link: AtomicU32::new(1),
        }
    }

    pub fn head_link(&self) -> LinkPointer {
        LinkPointer::decode(self.head_link.load(Ordering::Acquire))
    }

    pub fn head_link_raw(&self) -> u32 {
        self.head_link.load(Ordering::Acquire)
    }

    pub fn set_head_link(&self, link: LinkPointer) {
        self.head_link.store(link.encode(), Ordering::Release);
    }

    pub(crate) fn set_head_link_raw(&self, raw: u32) {
        self.head_link.store(raw, Ordering::Release);
    }

    pub fn element(&self) -> LinkPointer {
        LinkPointer::decode(self.element_link.load(Ordering::Acquire))
    }

    pub fn set_element(&self, link: LinkPointer) {
        self.element_link.store(link.encode(), Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.element_link
            .store(LinkFlags::TERMINATE.bits(), Ordering::Release);
        self.head_link
            .store(LinkFlags::TERMINATE.bits(), Ordering::Release);
    }
}
