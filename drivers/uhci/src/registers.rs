//! UHCI register interface
//!
//! The scheduler only touches the controller through [`HostControllerOps`].
//! [`UhciRegisters`] implements it on top of raw register access, which is
//! port I/O on x86_64 and memory-mapped elsewhere.

use bitflags::bitflags;

use crate::{
    dma::PhysicalAddress,
    error::{UhciError, UhciResult},
};

/// UHCI register offsets
pub mod offsets {
    pub const USBCMD: u16 = 0x00; // USB Command Register
    pub const USBSTS: u16 = 0x02; // USB Status Register
    pub const USBINTR: u16 = 0x04; // USB Interrupt Enable Register
    pub const FRNUM: u16 = 0x06; // Frame Number Register
    pub const FLBASEADD: u16 = 0x08; // Frame List Base Address Register
    pub const SOFMOD: u16 = 0x0C; // Start of Frame Modify Register
}

bitflags! {
    /// USBCMD
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsbCommand: u16 {
        const RUN = 0x0001;
        const HCRESET = 0x0002;
        const GRESET = 0x0004;
        const EGSM = 0x0008;
        const FGR = 0x0010;
        const SWDBG = 0x0020;
        const CF = 0x0040;
        /// 64-byte max packet for bandwidth reclamation
        const MAXP = 0x0080;
    }
}

bitflags! {
    /// USBSTS, write-one-to-clear
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsbStatus: u16 {
        const USBINT = 0x0001;
        const ERROR = 0x0002;
        const RESUME_DETECT = 0x0004;
        const HOST_SYSTEM_ERROR = 0x0008;
        const PROCESS_ERROR = 0x0010;
        const HALTED = 0x0020;

        const ALL_INTERRUPTS = Self::USBINT.bits()
            | Self::ERROR.bits()
            | Self::RESUME_DETECT.bits()
            | Self::HOST_SYSTEM_ERROR.bits()
            | Self::PROCESS_ERROR.bits();
    }
}

bitflags! {
    /// USBINTR
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsbInterrupt: u16 {
        const TIMEOUT_CRC = 0x0001;
        const RESUME = 0x0002;
        const IOC = 0x0004;
        const SHORT_PACKET = 0x0008;
    }
}

/// Hardware access the scheduler needs.
pub trait HostControllerOps: Send {
    fn read_command(&self) -> UsbCommand;

    fn write_command(&mut self, command: UsbCommand);

    fn read_status(&self) -> UsbStatus;

    /// Clear the given status bits.
    fn ack_interrupts(&mut self, status: UsbStatus);

    fn enable_interrupts(&mut self, mask: UsbInterrupt);

    /// Current frame counter (11 bits on real hardware).
    fn read_frame_number(&self) -> u16;

    fn write_frame_number(&mut self, frame: u16);

    fn write_frame_list_base(&mut self, base: PhysicalAddress);

    /// Busy-wait roughly `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms.saturating_mul(10_000) {
            core::hint::spin_loop();
        }
    }
}

/// Global reset: hold GRESET for the bus reset time, then release.
pub fn global_reset<H: HostControllerOps + ?Sized>(hw: &mut H) {
    hw.write_command(UsbCommand::GRESET);
    hw.delay_ms(10);
    hw.write_command(UsbCommand::empty());
}

/// Host controller reset. Fails if HCRESET does not self-clear.
pub fn reset_controller<H: HostControllerOps + ?Sized>(hw: &mut H) -> UhciResult<()> {
    hw.write_command(UsbCommand::HCRESET);
    for _ in 0..100 {
        hw.delay_ms(1);
        if !hw.read_command().contains(UsbCommand::HCRESET) {
            return Ok(());
        }
    }
    log::error!("[UHCI] Host controller reset did not complete");
    Err(UhciError::HardwareError {
        device: "uhci",
        code: UsbCommand::HCRESET.bits() as u32,
    })
}

/// Start or stop the schedule and wait for HCHALTED to follow.
pub fn set_running<H: HostControllerOps + ?Sized>(hw: &mut H, run: bool) -> UhciResult<()> {
    let mut cmd = hw.read_command();
    cmd.set(UsbCommand::RUN, run);
    hw.write_command(cmd);
    for _ in 0..10 {
        if hw.read_status().contains(UsbStatus::HALTED) != run {
            return Ok(());
        }
        hw.delay_ms(1);
    }
    log::error!(
        "[UHCI] Controller did not {}",
        if run { "start" } else { "halt" }
    );
    Err(UhciError::HardwareError {
        device: "uhci",
        code: UsbStatus::HALTED.bits() as u32,
    })
}

// ============================================================================
// Raw register backends
// ============================================================================

/// Width-specific register access.
pub trait RegisterIo: Send {
    fn read16(&self, offset: u16) -> u16;
    fn write16(&mut self, offset: u16, value: u16);
    fn write32(&mut self, offset: u16, value: u32);
}

/// I/O-port registers (PCI BAR4 on x86).
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct PortIo {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortIo {
    /// # Safety
    ///
    /// `base` must be the I/O base of a UHCI controller owned by the caller,
    /// and the caller must run with I/O privilege.
    pub unsafe fn new(base: u16) -> Self {
        Self { base }
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterIo for PortIo {
    fn read16(&self, offset: u16) -> u16 {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.base.wrapping_add(offset));
        // SAFETY: PortIo::new's contract guarantees base + offset is a UHCI
        // register of a controller we own, accessed with I/O privilege.
        unsafe { port.read() }
    }

    fn write16(&mut self, offset: u16, value: u16) {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.base.wrapping_add(offset));
        // SAFETY: Same invariants as read16.
        unsafe { port.write(value) }
    }

    fn write32(&mut self, offset: u16, value: u32) {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.base.wrapping_add(offset));
        // SAFETY: Same invariants as read16.
        unsafe { port.write(value) }
    }
}

/// Memory-mapped registers.
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must be the mapped register window of a UHCI controller owned
    /// by the caller, valid for volatile access for the lifetime of `Self`.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl RegisterIo for Mmio {
    fn read16(&self, offset: u16) -> u16 {
        let addr = self.base + offset as usize;
        // SAFETY: Mmio::new's contract guarantees the window is mapped;
        // read_volatile keeps the access from being elided or merged.
        unsafe { core::ptr::read_volatile(addr as *const u16) }
    }

    fn write16(&mut self, offset: u16, value: u16) {
        let addr = self.base + offset as usize;
        // SAFETY: Same invariants as read16.
        unsafe { core::ptr::write_volatile(addr as *mut u16, value) }
    }

    fn write32(&mut self, offset: u16, value: u32) {
        let addr = self.base + offset as usize;
        // SAFETY: Same invariants as read16.
        unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
    }
}

/// [`HostControllerOps`] over a raw register window.
#[derive(Debug)]
pub struct UhciRegisters<R: RegisterIo> {
    io: R,
}

impl<R: RegisterIo> UhciRegisters<R> {
    pub fn new(io: R) -> Self {
        Self { io }
    }

    /// Start-of-frame timing adjustment (default 64).
    pub fn write_sof_modify(&mut self, value: u8) {
        self.io.write16(offsets::SOFMOD, value as u16);
    }
}

impl<R: RegisterIo> HostControllerOps for UhciRegisters<R> {
    fn read_command(&self) -> UsbCommand {
        UsbCommand::from_bits_retain(self.io.read16(offsets::USBCMD))
    }

    fn write_command(&mut self, command: UsbCommand) {
        self.io.write16(offsets::USBCMD, command.bits());
    }

    fn read_status(&self) -> UsbStatus {
        UsbStatus::from_bits_retain(self.io.read16(offsets::USBSTS))
    }

    fn ack_interrupts(&mut self, status: UsbStatus) {
        self.io
            .write16(offsets::USBSTS, (status & UsbStatus::ALL_INTERRUPTS).bits());
    }

    fn enable_interrupts(&mut self, mask: UsbInterrupt) {
        self.io.write16(offsets::USBINTR, mask.bits());
    }

    fn read_frame_number(&self) -> u16 {
        self.io.read16(offsets::FRNUM) & 0x7FF
    }

    fn write_frame_number(&mut self, frame: u16) {
        self.io.write16(offsets::FRNUM, frame & 0x7FF);
    }

    fn write_frame_list_base(&mut self, base: PhysicalAddress) {
        self.io.write32(offsets::FLBASEADD, base.as_u32());
    }
}
