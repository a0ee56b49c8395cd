//! Software model of a UHCI controller
//!
//! Used by the unit and integration tests, and usable by anyone who wants to
//! exercise the scheduler without hardware:
//!
//! - [`SequentialMapper`] hands out fake bus addresses for pool pages
//! - [`SimulatedController`] implements the register interface
//! - [`FrameWalker`] executes one frame of the schedule the way the
//!   controller would, following the frame list through TDs and QHs and
//!   retiring TDs according to a per-endpoint script

use alloc::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
    vec::Vec,
};
use core::{
    cell::Cell,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    controller::{ScheduleView, UhciScheduler},
    descriptor::{HwQh, HwTd, LinkPointer, Pid, TdStatus, Token},
    dma::{DmaMapper, PhysicalAddress, PAGE_SIZE},
    error::{UhciError, UhciResult},
    frame_list::UHCI_FRAME_LIST_COUNT,
    registers::{HostControllerOps, UsbCommand, UsbInterrupt, UsbStatus},
};

// ============================================================================
// DMA mapping
// ============================================================================

const SIM_DMA_BASE: u32 = 0x0010_0000;

/// Live mapping count shared with a [`SequentialMapper`].
#[derive(Debug, Clone, Default)]
pub struct MapTracker(Arc<AtomicUsize>);

impl MapTracker {
    pub fn mapped(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Assigns consecutive page-aligned bus addresses, never reusing one.
#[derive(Debug)]
pub struct SequentialMapper {
    next: u32,
    tracker: MapTracker,
}

impl SequentialMapper {
    pub fn new() -> Self {
        Self {
            next: SIM_DMA_BASE,
            tracker: MapTracker::default(),
        }
    }

    pub fn tracker(&self) -> MapTracker {
        self.tracker.clone()
    }
}

impl Default for SequentialMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaMapper for SequentialMapper {
    fn map_page(&mut self, virt: *const u8) -> UhciResult<PhysicalAddress> {
        if virt as usize % PAGE_SIZE != 0 {
            return Err(UhciError::InvalidArgument {
                name: "virt",
                value: "not page aligned",
            });
        }
        let phys = PhysicalAddress::new(self.next);
        self.next = self.next.checked_add(PAGE_SIZE as u32).ok_or(UhciError::OutOfMemory {
            kind: crate::descriptor::DescriptorKind::TransferDescriptor,
            requested: 1,
            available: 0,
        })?;
        self.tracker.0.fetch_add(1, Ordering::AcqRel);
        Ok(phys)
    }

    fn unmap_page(&mut self, _phys: PhysicalAddress) {
        self.tracker.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Register model
// ============================================================================

/// In-memory UHCI register file.
///
/// HCRESET completes immediately, RUN and HCHALTED track each other, and the
/// frame counter only moves when told to (or on every read in free-running
/// mode).
#[derive(Debug)]
pub struct SimulatedController {
    command: UsbCommand,
    status: UsbStatus,
    interrupts: UsbInterrupt,
    frame: Cell<u16>,
    frame_list_base: Option<PhysicalAddress>,
    free_running: bool,
    frozen: bool,
    stuck_reset: bool,
    stuck_run: bool,
    acknowledged: UsbStatus,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self {
            command: UsbCommand::empty(),
            status: UsbStatus::HALTED,
            interrupts: UsbInterrupt::empty(),
            frame: Cell::new(0),
            frame_list_base: None,
            free_running: false,
            frozen: false,
            stuck_reset: false,
            stuck_run: false,
            acknowledged: UsbStatus::empty(),
        }
    }

    /// Advance the frame counter on every FRNUM read while running.
    pub fn with_free_running(mut self) -> Self {
        self.free_running = true;
        self
    }

    /// HCRESET never self-clears.
    pub fn with_stuck_reset(mut self) -> Self {
        self.stuck_reset = true;
        self
    }

    /// Clearing RUN is ignored once the controller has started.
    pub fn with_stuck_run(mut self) -> Self {
        self.stuck_run = true;
        self
    }

    pub fn is_running(&self) -> bool {
        self.command.contains(UsbCommand::RUN) && !self.status.contains(UsbStatus::HALTED)
    }

    pub fn command(&self) -> UsbCommand {
        self.command
    }

    pub fn interrupt_mask(&self) -> UsbInterrupt {
        self.interrupts
    }

    pub fn frame_list_base(&self) -> Option<PhysicalAddress> {
        self.frame_list_base
    }

    pub fn frame(&self) -> u16 {
        self.frame.get()
    }

    /// Status bits software has written back so far.
    pub fn acknowledged(&self) -> UsbStatus {
        self.acknowledged
    }

    /// Stop the frame counter as if the controller had wedged.
    pub fn freeze(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn advance_frame(&mut self) {
        if self.is_running() && !self.frozen {
            self.frame.set(self.frame.get().wrapping_add(1) & 0x7FF);
        }
    }

    pub fn advance_frames(&mut self, frames: u16) {
        for _ in 0..frames {
            self.advance_frame();
        }
    }

    pub fn raise(&mut self, status: UsbStatus) {
        self.status |= status;
    }

    /// Host system error: the controller halts itself.
    pub fn host_system_error(&mut self) {
        self.status |= UsbStatus::HOST_SYSTEM_ERROR | UsbStatus::HALTED;
        self.command.remove(UsbCommand::RUN);
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl HostControllerOps for SimulatedController {
    fn read_command(&self) -> UsbCommand {
        self.command
    }

    fn write_command(&mut self, command: UsbCommand) {
        if command.contains(UsbCommand::HCRESET) {
            if self.stuck_reset {
                self.command = command;
                return;
            }
            self.command = UsbCommand::empty();
            self.status = UsbStatus::HALTED;
            self.interrupts = UsbInterrupt::empty();
            self.frame.set(0);
            self.frame_list_base = None;
            return;
        }
        let mut command = command;
        if self.stuck_run && self.command.contains(UsbCommand::RUN) {
            command.insert(UsbCommand::RUN);
        }
        self.command = command;
        if command.contains(UsbCommand::RUN) {
            self.status.remove(UsbStatus::HALTED);
        } else {
            self.status.insert(UsbStatus::HALTED);
        }
    }

    fn read_status(&self) -> UsbStatus {
        self.status
    }

    fn ack_interrupts(&mut self, status: UsbStatus) {
        let bits = status & UsbStatus::ALL_INTERRUPTS;
        self.status.remove(bits);
        self.acknowledged |= bits;
    }

    fn enable_interrupts(&mut self, mask: UsbInterrupt) {
        self.interrupts = mask;
    }

    fn read_frame_number(&self) -> u16 {
        let frame = self.frame.get();
        if self.free_running && self.is_running() && !self.frozen {
            self.frame.set(frame.wrapping_add(1) & 0x7FF);
        }
        frame
    }

    fn write_frame_number(&mut self, frame: u16) {
        self.frame.set(frame & 0x7FF);
    }

    fn write_frame_list_base(&mut self, base: PhysicalAddress) {
        self.frame_list_base = Some(base);
    }

    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            self.advance_frame();
        }
    }
}

// ============================================================================
// Schedule execution
// ============================================================================

/// What the device does with the next TD addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdOutcome {
    /// Full packet moved.
    Complete,
    /// Only this many bytes moved.
    Short(u16),
    Stall,
    /// Retire with these error bits.
    BusError(TdStatus),
    /// Device not ready; the TD stays active.
    Nak,
}

/// Descriptor reached while walking a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Td(PhysicalAddress),
    Qh(PhysicalAddress),
}

/// Record of one simulated frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameTrace {
    pub frame: u16,
    pub visits: Vec<Visit>,
    /// TDs the controller performed a transaction for, in order.
    pub executed: Vec<PhysicalAddress>,
    pub interrupt: bool,
    pub error: bool,
    /// A link led to a descriptor the pool does not consider allocated.
    pub stale: bool,
}

enum Executed {
    /// TD retired; the queue may continue.
    Advanced,
    /// TD retired and the queue halts (error or short packet).
    Halted,
    /// NAK; the TD is retried next time.
    Retry,
}

const WALK_LIMIT: usize = 16 * 1024;

/// Executes the schedule one frame at a time.
#[derive(Debug, Default)]
pub struct FrameWalker {
    scripts: BTreeMap<(u8, u8), VecDeque<TdOutcome>>,
}

impl FrameWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next TD sent to `address`/`endpoint`.
    /// Unscripted TDs complete in full.
    pub fn script(&mut self, address: u8, endpoint: u8, outcome: TdOutcome) {
        self.scripts
            .entry((address, endpoint))
            .or_default()
            .push_back(outcome);
    }

    pub fn pending_scripts(&self) -> usize {
        self.scripts.values().map(VecDeque::len).sum()
    }

    /// Run the current frame of `scheduler` and advance the counter.
    pub fn step<M: DmaMapper>(
        &mut self,
        scheduler: &UhciScheduler<SimulatedController, M>,
    ) -> FrameTrace {
        scheduler.with_schedule(|hw, view| self.run_frame(hw, view))
    }

    /// Run `frames` frames.
    pub fn run<M: DmaMapper>(
        &mut self,
        scheduler: &UhciScheduler<SimulatedController, M>,
        frames: usize,
    ) -> Vec<FrameTrace> {
        (0..frames).map(|_| self.step(scheduler)).collect()
    }

    pub fn run_frame<M: DmaMapper>(
        &mut self,
        hw: &mut SimulatedController,
        view: &ScheduleView<'_, M>,
    ) -> FrameTrace {
        let mut trace = FrameTrace {
            frame: hw.frame(),
            ..FrameTrace::default()
        };
        if !hw.is_running() {
            return trace;
        }

        let index = trace.frame as usize % UHCI_FRAME_LIST_COUNT;
        let mut link = LinkPointer::decode(view.frame_list_entry(index));
        let mut seen_qhs = BTreeSet::new();
        for _ in 0..WALK_LIMIT {
            match link {
                LinkPointer::Terminate => break,
                LinkPointer::Td { phys, .. } => {
                    let Some(td) = view.td(phys) else {
                        trace.stale = true;
                        break;
                    };
                    trace.visits.push(Visit::Td(phys));
                    if td.is_active() {
                        self.execute(td, phys, &mut trace);
                    }
                    link = td.link();
                }
                LinkPointer::Qh(phys) => {
                    // Reclamation loop: one pass per frame is enough.
                    if !seen_qhs.insert(phys) {
                        break;
                    }
                    let Some(qh) = view.qh(phys) else {
                        trace.stale = true;
                        break;
                    };
                    trace.visits.push(Visit::Qh(phys));
                    self.run_queue(qh, view, &mut trace);
                    link = qh.head_link();
                }
            }
        }

        if trace.interrupt {
            hw.raise(UsbStatus::USBINT);
        }
        if trace.error {
            hw.raise(UsbStatus::ERROR);
        }
        hw.advance_frame();
        trace
    }

    fn run_queue<M: DmaMapper>(
        &mut self,
        qh: &HwQh,
        view: &ScheduleView<'_, M>,
        trace: &mut FrameTrace,
    ) {
        for _ in 0..WALK_LIMIT {
            let LinkPointer::Td { phys, .. } = qh.element() else {
                return;
            };
            let Some(td) = view.td(phys) else {
                trace.stale = true;
                return;
            };
            if !td.is_active() {
                return;
            }
            match self.execute(td, phys, trace) {
                Executed::Advanced => {
                    let next = td.link();
                    qh.set_element(next);
                    if !matches!(next, LinkPointer::Td { depth_first: true, .. }) {
                        return;
                    }
                }
                Executed::Halted | Executed::Retry => return,
            }
        }
    }

    fn execute(&mut self, td: &HwTd, phys: PhysicalAddress, trace: &mut FrameTrace) -> Executed {
        let status = td.status();
        let Some(token) = Token::decode(td.token()) else {
            td.set_status((status - TdStatus::ACTIVE) | TdStatus::STALLED);
            trace.error = true;
            return Executed::Halted;
        };
        trace.executed.push(phys);

        let outcome = self
            .scripts
            .get_mut(&(token.address, token.endpoint))
            .and_then(VecDeque::pop_front)
            .unwrap_or(TdOutcome::Complete);
        let retired = status - TdStatus::ACTIVE;
        let ioc = status.contains(TdStatus::IOC);

        match outcome {
            TdOutcome::Complete => {
                td.set_status(retired.with_actual_length(token.max_len));
                trace.interrupt |= ioc;
                Executed::Advanced
            }
            TdOutcome::Short(len) => {
                let len = len.min(token.max_len);
                td.set_status(retired.with_actual_length(len));
                if len < token.max_len && status.contains(TdStatus::SPD) {
                    trace.interrupt = true;
                    Executed::Halted
                } else {
                    trace.interrupt |= ioc;
                    Executed::Advanced
                }
            }
            TdOutcome::Stall => {
                let mut bits = TdStatus::STALLED;
                if token.pid == Pid::Setup {
                    bits |= TdStatus::CRC_TIMEOUT;
                }
                td.set_status(retired.with_actual_length(0) | bits);
                trace.error = true;
                trace.interrupt |= ioc;
                Executed::Halted
            }
            TdOutcome::BusError(bits) => {
                td.set_status(retired.with_actual_length(0) | bits | TdStatus::STALLED);
                trace.error = true;
                trace.interrupt |= ioc;
                Executed::Halted
            }
            TdOutcome::Nak => {
                td.set_status(status | TdStatus::NAK);
                Executed::Retry
            }
        }
    }
}
