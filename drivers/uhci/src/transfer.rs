//! Transfer requests, completions and TD chains
//!
//! Contains:
//! - The request and completion types callers see
//! - TD chain construction for control, bulk and interrupt transfers
//! - The completion test run against a chain on every poll
//! - Status and actual-length computation for a finished chain

use alloc::{boxed::Box, vec::Vec};

use bitflags::bitflags;

use crate::{
    descriptor::{token_max_len, token_pid, token_toggle, token_with_toggle, Pid, TdStatus, Token},
    dma::{DmaBuffer, DmaMapper, PhysicalAddress},
    endpoint::EndpointId,
    error::{UhciError, UhciResult},
    pool::{DescriptorHandle, DescriptorPool, TdHandle},
};

/// Handle returned by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(pub(crate) u64);

impl TransferId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferKind {
    /// Interrupt and isochronous traffic needs reserved bandwidth.
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Interrupt | Self::Isochronous)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn pid(self) -> Pid {
        match self {
            Self::In => Pid::In,
            Self::Out => Pid::Out,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }
}

/// Bus speeds a UHCI root port can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsbSpeed {
    Low,
    Full,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u8 {
        /// A short packet ends the transfer without error.
        const SHORT_OK = 1 << 0;
        /// Terminate a transfer that fills its last packet with an extra
        /// zero-length packet.
        const FORCE_SHORT = 1 << 1;
    }
}

/// Called once per transfer from the completion path, outside the
/// scheduler lock.
pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send>;

/// A transfer waiting to be submitted.
pub struct TransferRequest {
    pub endpoint: EndpointId,
    /// Data stage direction; only consulted for control transfers.
    pub direction: Direction,
    pub buffer: DmaBuffer,
    /// Bus address of the 8-byte SETUP packet, control transfers only.
    pub setup: Option<PhysicalAddress>,
    /// Per-frame packet sizes, isochronous transfers only.
    pub frame_lengths: Vec<u16>,
    pub flags: TransferFlags,
    pub(crate) callback: Option<CompletionCallback>,
}

impl TransferRequest {
    pub fn bulk(endpoint: EndpointId, buffer: DmaBuffer) -> Self {
        Self {
            endpoint,
            direction: Direction::In,
            buffer,
            setup: None,
            frame_lengths: Vec::new(),
            flags: TransferFlags::empty(),
            callback: None,
        }
    }

    pub fn interrupt(endpoint: EndpointId, buffer: DmaBuffer) -> Self {
        Self::bulk(endpoint, buffer)
    }

    pub fn control(
        endpoint: EndpointId,
        setup: PhysicalAddress,
        direction: Direction,
        data: DmaBuffer,
    ) -> Self {
        Self {
            endpoint,
            direction,
            buffer: data,
            setup: Some(setup),
            frame_lengths: Vec::new(),
            flags: TransferFlags::empty(),
            callback: None,
        }
    }

    pub fn isochronous(endpoint: EndpointId, buffer: DmaBuffer, frame_lengths: Vec<u16>) -> Self {
        Self {
            endpoint,
            direction: Direction::In,
            buffer,
            setup: None,
            frame_lengths,
            flags: TransferFlags::empty(),
            callback: None,
        }
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

/// Final state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// Fewer bytes than requested; not an error.
    ShortPacket,
    Stalled,
    BusError(TdStatus),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: TransferId,
    pub endpoint: EndpointId,
    pub status: CompletionStatus,
    pub actual_length: usize,
    /// Bytes moved in each frame, isochronous transfers only.
    pub frame_lengths: Vec<u16>,
}

impl Completion {
    pub fn result(&self) -> UhciResult<usize> {
        match self.status {
            CompletionStatus::Success | CompletionStatus::ShortPacket => Ok(self.actual_length),
            CompletionStatus::Stalled => Err(UhciError::Stalled),
            CompletionStatus::BusError(status) => Err(UhciError::BusError { status }),
            CompletionStatus::Cancelled => Err(UhciError::InvalidState {
                expected: "completed",
                actual: "cancelled",
            }),
        }
    }
}

/// What `abort` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortStatus {
    /// Descriptors deactivated; the transfer completes as cancelled once
    /// the controller has moved past it.
    Quiescing,
    AlreadyAborting,
    /// The transfer already completed or was cancelled.
    AlreadyFinished,
}

// ============================================================================
// Scheduler-side transfer record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferState {
    /// Chain built, waiting behind another transfer on the endpoint.
    Queued,
    /// Reachable by the controller. `reclaiming` if it holds a reference on
    /// the reclamation loop.
    Armed { reclaiming: bool },
    /// Deactivated at frame `since`, waiting for the quiesce window.
    Aborting {
        since: u16,
        was_armed: bool,
        in_flight: Option<InFlight>,
    },
}

/// First TD that was still active when an abort deactivated its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InFlight {
    pub index: usize,
    /// Status just before deactivation.
    pub before: TdStatus,
}

pub(crate) struct ActiveTransfer {
    pub id: TransferId,
    pub endpoint: EndpointId,
    pub kind: TransferKind,
    /// Isochronous TDs belong to the endpoint and are only borrowed here.
    pub tds: Vec<TdHandle>,
    pub status_td: Option<TdHandle>,
    pub requested: usize,
    pub state: TransferState,
    pub status_redirected: bool,
    pub callback: Option<CompletionCallback>,
}

/// Fixed parameters for every TD of one chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChainParams {
    pub address: u8,
    pub endpoint: u8,
    pub max_packet: u16,
    pub low_speed: bool,
    pub flags: TransferFlags,
}

/// Number of data TDs for `len` bytes.
pub(crate) fn data_td_count(len: usize, max_packet: u16, flags: TransferFlags) -> usize {
    let maxp = max_packet as usize;
    let mut count = len.div_ceil(maxp);
    if flags.contains(TransferFlags::FORCE_SHORT) && len % maxp == 0 {
        count += 1;
    }
    count
}

/// Fill `tds` as consecutive data packets of `buffer`, linked depth-first.
/// Returns the toggle for whatever follows the chain.
pub(crate) fn fill_data_chain<M: DmaMapper>(
    pool: &DescriptorPool<M>,
    tds: &[TdHandle],
    params: &ChainParams,
    direction: Direction,
    buffer: DmaBuffer,
    mut toggle: bool,
) -> bool {
    let maxp = params.max_packet as usize;
    let status = TdStatus::armed(
        params.low_speed,
        params.flags.contains(TransferFlags::SHORT_OK),
    );
    for (i, &td) in tds.iter().enumerate() {
        let offset = i * maxp;
        let len = buffer.len.saturating_sub(offset).min(maxp);
        let token = Token {
            pid: direction.pid(),
            address: params.address,
            endpoint: params.endpoint,
            toggle,
            max_len: len as u16,
        };
        let hw = pool.td(td);
        hw.set_token(token.encode());
        hw.set_buffer(if len == 0 {
            PhysicalAddress::new(0)
        } else {
            buffer.phys.offset(offset as u32)
        });
        hw.set_status(status);
        match tds.get(i + 1) {
            Some(&next) => pool.link_td(td, next),
            None => pool.terminate(DescriptorHandle::Td(td)),
        }
        toggle = !toggle;
    }
    toggle
}

/// Build a bulk or interrupt chain. The last TD interrupts on completion.
pub(crate) fn build_data_chain<M: DmaMapper>(
    pool: &mut DescriptorPool<M>,
    params: &ChainParams,
    direction: Direction,
    buffer: DmaBuffer,
) -> UhciResult<Vec<TdHandle>> {
    let count = data_td_count(buffer.len, params.max_packet, params.flags).max(1);
    let tds = pool.alloc_tds(count)?;
    fill_data_chain(pool, &tds, params, direction, buffer, false);
    if let Some(&last) = tds.last() {
        let hw = pool.td(last);
        hw.set_status(hw.status() | TdStatus::IOC);
    }
    Ok(tds)
}

/// Build SETUP, optional data stage and status stage. Returns the chain and
/// the status TD.
pub(crate) fn build_control_chain<M: DmaMapper>(
    pool: &mut DescriptorPool<M>,
    params: &ChainParams,
    setup: PhysicalAddress,
    direction: Direction,
    data: DmaBuffer,
) -> UhciResult<(Vec<TdHandle>, TdHandle)> {
    let data_count = data_td_count(data.len, params.max_packet, params.flags);
    let tds = pool.alloc_tds(data_count.saturating_add(2))?;
    let setup_td = tds[0];
    let status_td = tds[data_count + 1];

    let setup_hw = pool.td(setup_td);
    setup_hw.set_token(
        Token {
            pid: Pid::Setup,
            address: params.address,
            endpoint: params.endpoint,
            toggle: false,
            max_len: 8,
        }
        .encode(),
    );
    setup_hw.set_buffer(setup);
    setup_hw.set_status(TdStatus::armed(params.low_speed, false));

    // Data stage starts at DATA1.
    fill_data_chain(pool, &tds[1..=data_count], params, direction, data, true);

    let status_dir = if data.len == 0 {
        Direction::In
    } else {
        direction.reverse()
    };
    let status_hw = pool.td(status_td);
    status_hw.set_token(
        Token {
            pid: status_dir.pid(),
            address: params.address,
            endpoint: params.endpoint,
            toggle: true,
            max_len: 0,
        }
        .encode(),
    );
    status_hw.set_buffer(PhysicalAddress::new(0));
    status_hw.set_status(TdStatus::armed(params.low_speed, false) | TdStatus::IOC);
    pool.terminate(DescriptorHandle::Td(status_td));

    for pair in tds.windows(2) {
        pool.link_td(pair[0], pair[1]);
    }
    Ok((tds, status_td))
}

/// Rewrite data toggles starting at `toggle`; returns the next toggle.
pub(crate) fn stamp_toggles<M: DmaMapper>(
    pool: &DescriptorPool<M>,
    tds: &[TdHandle],
    mut toggle: bool,
) -> bool {
    for &td in tds {
        let hw = pool.td(td);
        hw.set_token(token_with_toggle(hw.token(), toggle));
        toggle = !toggle;
    }
    toggle
}

/// Result of looking at a chain during a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Pending,
    Done,
    /// Control data stage ended short; point the QH at the status TD.
    RunStatusStage(TdHandle),
}

pub(crate) fn check_progress<M: DmaMapper>(
    pool: &DescriptorPool<M>,
    transfer: &ActiveTransfer,
) -> Progress {
    let Some((&last, rest)) = transfer.tds.split_last() else {
        return Progress::Done;
    };
    if !pool.is_active(last) {
        return Progress::Done;
    }
    if transfer.kind == TransferKind::Isochronous {
        return Progress::Pending;
    }
    for &td in rest {
        let hw = pool.td(td);
        let status = hw.status();
        if status.contains(TdStatus::ACTIVE) {
            return Progress::Pending;
        }
        if status.contains(TdStatus::STALLED) || !status.error_bits().is_empty() {
            return Progress::Done;
        }
        if status.contains(TdStatus::SPD) && status.actual_length() < token_max_len(hw.token()) {
            return match transfer.status_td {
                Some(_) if transfer.status_redirected => Progress::Pending,
                Some(status_td) => Progress::RunStatusStage(status_td),
                None => Progress::Done,
            };
        }
    }
    Progress::Pending
}

/// Outcome of a finished chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChainResult {
    pub status: CompletionStatus,
    pub actual_length: usize,
    /// Toggle of the first TD the controller never ran.
    pub leftover_toggle: Option<bool>,
    pub frame_lengths: Vec<u16>,
}

pub(crate) fn chain_result<M: DmaMapper>(
    pool: &DescriptorPool<M>,
    transfer: &ActiveTransfer,
) -> ChainResult {
    let iso = transfer.kind == TransferKind::Isochronous;
    let mut actual = 0usize;
    let mut last_status = TdStatus::empty();
    let mut iso_errors = TdStatus::empty();
    let mut leftover_toggle = None;
    let mut frame_lengths = Vec::new();

    for &td in &transfer.tds {
        let hw = pool.td(td);
        let mut status = hw.status();
        if status.contains(TdStatus::ACTIVE) {
            leftover_toggle.get_or_insert(token_toggle(hw.token()));
            if iso {
                frame_lengths.push(0);
            }
            continue;
        }
        if token_pid(hw.token()) == Some(Pid::Setup) {
            // Controllers flag CRC/timeout alongside a STALL or NAK on SETUP.
            if status.intersects(TdStatus::STALLED | TdStatus::NAK) {
                status.remove(TdStatus::CRC_TIMEOUT);
            }
        } else {
            let len = status.actual_length();
            actual += len as usize;
            if iso {
                frame_lengths.push(len);
            }
        }
        iso_errors |= status.error_bits();
        last_status = status;
    }

    let errors = if iso {
        iso_errors
    } else {
        last_status.error_bits()
    };
    let status = if errors.is_empty() {
        if !iso && actual < transfer.requested {
            CompletionStatus::ShortPacket
        } else {
            CompletionStatus::Success
        }
    } else if errors == TdStatus::STALLED {
        CompletionStatus::Stalled
    } else {
        CompletionStatus::BusError(errors)
    };

    ChainResult {
        status,
        actual_length: actual,
        leftover_toggle,
        frame_lengths,
    }
}

/// Toggle the device expects after an aborted chain, or `None` if the
/// controller had already run every TD.
///
/// The in-flight TD may have been retired by the controller after it was
/// deactivated. A clean write-back changes its actual length; the device
/// then acknowledged the packet and expects the opposite toggle.
pub(crate) fn abort_toggle<M: DmaMapper>(
    pool: &DescriptorPool<M>,
    tds: &[TdHandle],
    in_flight: Option<InFlight>,
) -> Option<bool> {
    let InFlight { index, before } = in_flight?;
    let hw = pool.td(*tds.get(index)?);
    let toggle = token_toggle(hw.token());
    let now = hw.status();
    let retired = !now.contains(TdStatus::ACTIVE)
        && now.error_bits().is_empty()
        && (now & TdStatus::ACTUAL_LENGTH) != (before & TdStatus::ACTUAL_LENGTH);
    Some(toggle ^ retired)
}
