//! UHCI transfer scheduler
//!
//! [`UhciScheduler`] owns the frame list, the descriptor pool, the class
//! chains and every endpoint behind a single spin lock. All schedule
//! mutation happens under that lock; completion callbacks run after it has
//! been released.
//!
//! Descriptors the controller may still be reading are never freed on the
//! spot. Aborted transfers and closed endpoints are first made unreachable,
//! then reclaimed from [`UhciScheduler::poll_completions`] once the frame
//! counter shows the controller has moved on.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};

use spin::Mutex;

use crate::{
    bandwidth::{Admission, AdmissionControl, BandwidthEstimator, BitTimeEstimator},
    config::SchedulerConfig,
    descriptor::{HwQh, HwTd, TdStatus, Token},
    dma::{DmaMapper, PhysicalAddress},
    endpoint::{Endpoint, EndpointDescriptor, EndpointId, IsoFrame, QueueState, Reservation},
    error::{UhciError, UhciResult},
    frame_list::{normalize_interval, FrameList, SlotSet},
    pool::{DescriptorHandle, DescriptorPool, PoolStats, QhHandle, TdHandle},
    registers::{
        global_reset, reset_controller, set_running, HostControllerOps, UsbCommand,
        UsbInterrupt, UsbStatus,
    },
    schedule::{ClassChains, ScheduleClass},
    transfer::{
        abort_toggle, build_control_chain, build_data_chain, chain_result, check_progress,
        stamp_toggles, AbortStatus, ActiveTransfer, ChainParams, Completion, CompletionCallback,
        CompletionStatus, InFlight, Progress, TransferId, TransferKind, TransferRequest,
        TransferState, UsbSpeed,
    },
};

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    /// Stopped by `shutdown`.
    Halted,
    /// Stopped after a host controller error or schedule corruption.
    Failed,
}

/// What `handle_interrupt` found in USBSTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptSummary {
    /// Interrupt bits that were pending (and are now acknowledged).
    pub status: UsbStatus,
    /// A transfer finished or failed; call `poll_completions`.
    pub completions_pending: bool,
}

/// Read-only view of the hardware schedule, for tooling and simulation.
pub struct ScheduleView<'a, M: DmaMapper> {
    pool: &'a DescriptorPool<M>,
    frames: &'a FrameList,
}

impl<'a, M: DmaMapper> ScheduleView<'a, M> {
    /// Bus address programmed into FLBASEADD.
    pub fn frame_list_base(&self) -> PhysicalAddress {
        self.frames.physical_address()
    }

    /// Raw frame list entry, as the controller fetches it.
    pub fn frame_list_entry(&self, index: usize) -> u32 {
        self.frames.entry(index)
    }

    /// The TD at `phys`, if it is a live pool descriptor.
    pub fn td(&self, phys: PhysicalAddress) -> Option<&'a HwTd> {
        let pool = self.pool;
        let handle = pool.resolve_td(phys)?;
        pool.td_allocated(handle).then(|| pool.td(handle))
    }

    /// The QH at `phys`, if it is a live pool descriptor.
    pub fn qh(&self, phys: PhysicalAddress) -> Option<&'a HwQh> {
        let pool = self.pool;
        let handle = pool.resolve_qh(phys)?;
        pool.qh_allocated(handle).then(|| pool.qh(handle))
    }
}

/// Descriptors waiting out the quiesce window before going back to the pool.
struct PendingRelease {
    since: u16,
    tds: Vec<TdHandle>,
    qhs: Vec<QhHandle>,
}

impl PendingRelease {
    fn is_empty(&self) -> bool {
        self.tds.is_empty() && self.qhs.is_empty()
    }
}

/// A finished transfer and the callback still to run for it.
type Finished = (Completion, Option<CompletionCallback>);

struct SchedulerState<H: HostControllerOps, M: DmaMapper> {
    hw: H,
    config: SchedulerConfig,
    pool: DescriptorPool<M>,
    frames: FrameList,
    chains: ClassChains,
    admission: AdmissionControl,
    estimator: Box<dyn BandwidthEstimator>,
    endpoints: BTreeMap<EndpointId, Endpoint>,
    transfers: BTreeMap<TransferId, ActiveTransfer>,
    releases: Vec<PendingRelease>,
    /// Completions produced outside `poll_completions`, reported by its next
    /// call.
    stash: Vec<Completion>,
    next_transfer: u64,
    next_endpoint: u32,
    state: ControllerState,
}

/// UHCI frame-list scheduler.
pub struct UhciScheduler<H: HostControllerOps, M: DmaMapper> {
    inner: Mutex<SchedulerState<H, M>>,
}

impl<H: HostControllerOps, M: DmaMapper> UhciScheduler<H, M> {
    /// Reset the controller, build an empty schedule and start it.
    pub fn new(hw: H, mapper: M, config: SchedulerConfig) -> UhciResult<Self> {
        Self::with_estimator(hw, mapper, config, Box::new(BitTimeEstimator))
    }

    /// Like [`UhciScheduler::new`] with a custom bandwidth estimator.
    pub fn with_estimator(
        mut hw: H,
        mapper: M,
        config: SchedulerConfig,
        estimator: Box<dyn BandwidthEstimator>,
    ) -> UhciResult<Self> {
        config.validate()?;

        hw.enable_interrupts(UsbInterrupt::empty());
        global_reset(&mut hw);
        reset_controller(&mut hw)?;

        let mut pool = DescriptorPool::new(mapper, config.max_td_pages, config.max_qh_pages);
        let chains = ClassChains::new(&mut pool, config.reclamation)?;
        let frames = FrameList::new(&mut pool, config.virtual_frames, chains.entry())?;
        let admission = AdmissionControl::new(config.virtual_frames, config.admission_limit());

        let mut state = SchedulerState {
            hw,
            config,
            pool,
            frames,
            chains,
            admission,
            estimator,
            endpoints: BTreeMap::new(),
            transfers: BTreeMap::new(),
            releases: Vec::new(),
            stash: Vec::new(),
            next_transfer: 1,
            next_endpoint: 1,
            state: ControllerState::Running,
        };

        state.hw.write_frame_number(0);
        state
            .hw
            .write_frame_list_base(state.frames.physical_address());
        state.hw.write_command(UsbCommand::MAXP);
        set_running(&mut state.hw, true)?;
        state.hw.enable_interrupts(
            UsbInterrupt::TIMEOUT_CRC
                | UsbInterrupt::RESUME
                | UsbInterrupt::IOC
                | UsbInterrupt::SHORT_PACKET,
        );

        log::info!(
            "[UHCI] Controller running: {} virtual frames, frame list at {:#x}",
            config.virtual_frames,
            state.frames.physical_address().as_u32()
        );

        Ok(Self {
            inner: Mutex::new(state),
        })
    }

    /// Run `f` under the lock with local interrupts masked.
    fn with_state<R>(&self, f: impl FnOnce(&mut SchedulerState<H, M>) -> R) -> R {
        without_interrupts(|| f(&mut self.inner.lock()))
    }

    /// Run `op` under the lock; fatal errors halt the controller.
    fn locked<R>(
        &self,
        op: impl FnOnce(&mut SchedulerState<H, M>) -> UhciResult<R>,
    ) -> UhciResult<R> {
        self.with_state(|state| op(&mut *state).map_err(|err| state.escalate(err)))
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    /// Create an endpoint. Control and bulk endpoints are linked into their
    /// class chain immediately; periodic endpoints reserve bandwidth on
    /// their first transfer.
    pub fn open_endpoint(&self, desc: EndpointDescriptor) -> UhciResult<EndpointId> {
        self.locked(|s| s.open_endpoint(desc))
    }

    /// Unlink an idle endpoint. Its descriptors return to the pool after the
    /// quiesce window.
    pub fn close_endpoint(&self, endpoint: EndpointId) -> UhciResult<()> {
        self.locked(|s| s.close_endpoint(endpoint))
    }

    /// Give back the periodic bandwidth of an idle endpoint. The next submit
    /// reserves it again.
    pub fn release_bandwidth(&self, endpoint: EndpointId) -> UhciResult<()> {
        self.locked(|s| s.release_bandwidth(endpoint))
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Queue a transfer. It becomes visible to the controller when every
    /// earlier transfer on the endpoint has finished.
    pub fn submit(&self, request: TransferRequest) -> UhciResult<TransferId> {
        self.locked(|s| s.submit(request))
    }

    /// Start cancelling a transfer. The cancelled completion is reported by
    /// `poll_completions` once the controller can no longer touch it.
    pub fn abort(&self, id: TransferId) -> UhciResult<AbortStatus> {
        self.locked(|s| s.abort(id))
    }

    /// Abort and spin until the transfer has been reclaimed. The cancelled
    /// completion is still reported by the next `poll_completions`.
    pub fn abort_and_wait(&self, id: TransferId, spin_budget: u32) -> UhciResult<()> {
        if self.abort(id)? == AbortStatus::AlreadyFinished {
            return Ok(());
        }
        let start = self.with_state(|s| s.hw.read_frame_number());

        for _ in 0..spin_budget {
            let mut finished = Vec::new();
            let done = self.locked(|s| {
                s.scan(false, &mut finished)?;
                s.service_releases()?;
                s.stash
                    .extend(finished.iter().map(|(completion, _)| completion.clone()));
                Ok(!s.transfers.contains_key(&id))
            })?;
            deliver(finished);
            if done {
                return Ok(());
            }
            core::hint::spin_loop();
        }

        self.with_state(|state| {
            let now = state.hw.read_frame_number();
            let halted = state.hw.read_status().contains(UsbStatus::HALTED);
            let frames = (now.wrapping_sub(start) & state.config.frame_number_mask) as u32;
            if frames == 0 && !halted {
                log::error!("[UHCI] Frame counter stuck at {} while aborting", now);
                return Err(UhciError::HardwareError {
                    device: "uhci",
                    code: now as u32,
                });
            }
            Err(UhciError::Timeout {
                operation: "abort",
                frames,
            })
        })
    }

    /// Reap finished transfers, finish aborts past their quiesce window and
    /// arm whatever is queued behind them. Callbacks run before this returns,
    /// outside the lock.
    pub fn poll_completions(&self) -> Vec<Completion> {
        let mut finished = Vec::new();
        let completions = self.with_state(|state| {
            if let Err(err) = state.scan(true, &mut finished) {
                state.escalate(err);
            }
            if let Err(err) = state.service_releases() {
                state.escalate(err);
            }
            let mut out = core::mem::take(&mut state.stash);
            out.extend(finished.iter().map(|(completion, _)| completion.clone()));
            out
        });
        deliver(finished);
        completions
    }

    // ========================================================================
    // Interrupts and maintenance
    // ========================================================================

    /// Read and acknowledge USBSTS. A host system or process error halts
    /// the controller and is returned as `HardwareError`.
    ///
    /// Safe to call from the controller's interrupt handler: task-context
    /// entry points hold the scheduler lock only with interrupts masked.
    pub fn handle_interrupt(&self) -> UhciResult<InterruptSummary> {
        self.with_state(|state| {
            let status = state.hw.read_status();
            let pending = status & UsbStatus::ALL_INTERRUPTS;
            if !pending.is_empty() {
                state.hw.ack_interrupts(pending);
            }

            if pending.intersects(UsbStatus::HOST_SYSTEM_ERROR | UsbStatus::PROCESS_ERROR) {
                log::error!(
                    "[UHCI] Host controller error, status {:#06x}",
                    status.bits()
                );
                if set_running(&mut state.hw, false).is_err() {
                    log::error!("[UHCI] Controller did not halt after a fatal error");
                }
                state.state = ControllerState::Failed;
                return Err(UhciError::HardwareError {
                    device: "uhci",
                    code: status.bits() as u32,
                });
            }
            if pending.contains(UsbStatus::RESUME_DETECT) {
                log::info!("[UHCI] Resume detected");
            }

            Ok(InterruptSummary {
                status: pending,
                completions_pending: pending.intersects(UsbStatus::USBINT | UsbStatus::ERROR),
            })
        })
    }

    /// Audit the whole schedule. Corruption halts the controller.
    pub fn verify_schedule(&self) -> UhciResult<()> {
        self.locked(|s| s.verify())
    }

    /// Halt the controller and cancel everything in flight.
    ///
    /// If the controller does not confirm the halt it may still be reading
    /// the schedule. The scheduler then moves to `Failed` and leaves the
    /// cancelled transfers quiescing; `poll_completions` reports them once
    /// the frame counter has moved past them.
    pub fn shutdown(&self) -> Vec<Completion> {
        let mut finished = Vec::new();
        let completions = self.with_state(|state| {
            state.hw.enable_interrupts(UsbInterrupt::empty());
            let halted = set_running(&mut state.hw, false).is_ok();
            if !halted {
                log::error!("[UHCI] Controller did not halt on shutdown; descriptors held");
                state.state = ControllerState::Failed;
            } else if state.state == ControllerState::Running {
                state.state = ControllerState::Halted;
            }
            if let Err(err) = state.cancel_all(halted, &mut finished) {
                state.escalate(err);
            }
            if let Err(err) = state.service_releases() {
                state.escalate(err);
            }
            let mut out = core::mem::take(&mut state.stash);
            out.extend(finished.iter().map(|(completion, _)| completion.clone()));
            log::info!(
                "[UHCI] Controller shut down, {} transfers cancelled, {} still quiescing",
                finished.len(),
                state.transfers.len()
            );
            out
        });
        deliver(finished);
        completions
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current lifecycle state.
    pub fn controller_state(&self) -> ControllerState {
        self.with_state(|s| s.state)
    }

    /// Configuration the scheduler was built with.
    pub fn config(&self) -> SchedulerConfig {
        self.with_state(|s| s.config)
    }

    /// FRNUM as the controller reports it.
    pub fn frame_number(&self) -> u16 {
        self.with_state(|s| s.hw.read_frame_number())
    }

    /// Bandwidth reserved in one virtual slot.
    pub fn slot_bandwidth(&self, slot: usize) -> u32 {
        self.with_state(|s| {
            if slot < s.frames.slot_count() {
                s.admission.reserved(slot)
            } else {
                0
            }
        })
    }

    /// Bandwidth reserved across all slots, in bit times.
    pub fn bandwidth_in_use(&self) -> u64 {
        self.with_state(|s| {
            (0..s.frames.slot_count())
                .map(|slot| s.admission.reserved(slot) as u64)
                .sum()
        })
    }

    /// Per-slot admission limit in bit times.
    pub fn admission_limit(&self) -> u32 {
        self.with_state(|s| s.admission.limit())
    }

    /// Slots a periodic endpoint currently occupies.
    pub fn endpoint_slots(&self, endpoint: EndpointId) -> UhciResult<Vec<usize>> {
        self.with_state(|s| Ok(s.endpoint(endpoint)?.slots()))
    }

    /// Whether the endpoint has a transfer in front of the controller.
    pub fn queue_state(&self, endpoint: EndpointId) -> UhciResult<QueueState> {
        self.with_state(|s| Ok(s.endpoint(endpoint)?.queue_state()))
    }

    /// Data toggle the next bulk or interrupt transfer will start with.
    pub fn endpoint_toggle(&self, endpoint: EndpointId) -> UhciResult<bool> {
        self.with_state(|s| Ok(s.endpoint(endpoint)?.toggle))
    }

    /// Bus addresses of the QHs an endpoint keeps in the schedule.
    pub fn endpoint_queue_heads(&self, endpoint: EndpointId) -> UhciResult<Vec<PhysicalAddress>> {
        self.with_state(|s| {
            let ep = s.endpoint(endpoint)?;
            Ok(ep
                .qh
                .iter()
                .chain(ep.intr_qhs.iter().map(|(_, qh)| qh))
                .map(|&qh| s.pool.qh_phys(qh))
                .collect())
        })
    }

    /// Descriptor pool usage.
    pub fn pool_stats(&self) -> PoolStats {
        self.with_state(|s| s.pool.stats())
    }

    /// Transfers not yet reported as complete.
    pub fn active_transfers(&self) -> Vec<TransferId> {
        self.with_state(|s| s.transfers.keys().copied().collect())
    }

    /// Bus addresses of a live transfer's TDs.
    pub fn transfer_descriptors(&self, id: TransferId) -> Option<Vec<PhysicalAddress>> {
        self.with_state(|s| {
            let transfer = s.transfers.get(&id)?;
            Some(transfer.tds.iter().map(|&td| s.pool.td_phys(td)).collect())
        })
    }

    /// Descriptors unlinked but still inside their quiesce window.
    pub fn pending_releases(&self) -> usize {
        self.with_state(|s| s.releases.len())
    }

    /// Armed transfers holding the reclamation loop open.
    pub fn reclamation_users(&self) -> u32 {
        self.with_state(|s| s.chains.reclamation_users())
    }

    /// Run `f` with the register interface and a view of the schedule.
    pub fn with_schedule<R>(&self, f: impl FnOnce(&mut H, &ScheduleView<'_, M>) -> R) -> R {
        self.with_state(|state| {
            let view = ScheduleView {
                pool: &state.pool,
                frames: &state.frames,
            };
            f(&mut state.hw, &view)
        })
    }
}

/// Masks local interrupts on bare-metal x86_64. Hosted builds have no
/// interrupt context to race with.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}

fn deliver(finished: Vec<Finished>) {
    for (completion, callback) in finished {
        if let Some(callback) = callback {
            callback(&completion);
        }
    }
}

fn not_found(resource: &'static str, id: u64) -> UhciError {
    UhciError::NotFound { resource, id }
}

fn corruption(reason: &'static str) -> UhciError {
    UhciError::ScheduleCorruption { reason }
}

impl<H: HostControllerOps, M: DmaMapper> SchedulerState<H, M> {
    fn ensure_running(&self) -> UhciResult<()> {
        match self.state {
            ControllerState::Running => Ok(()),
            ControllerState::Halted => Err(UhciError::InvalidState {
                expected: "running",
                actual: "halted",
            }),
            ControllerState::Failed => Err(UhciError::InvalidState {
                expected: "running",
                actual: "failed",
            }),
        }
    }

    /// Halt on errors that leave the schedule untrustworthy.
    fn escalate(&mut self, err: UhciError) -> UhciError {
        if err.is_fatal() && self.state != ControllerState::Failed {
            log::error!("[UHCI] {}; halting controller", err);
            if set_running(&mut self.hw, false).is_err() {
                log::error!("[UHCI] Controller did not halt after schedule corruption");
            }
            self.state = ControllerState::Failed;
        }
        err
    }

    fn endpoint(&self, id: EndpointId) -> UhciResult<&Endpoint> {
        self.endpoints
            .get(&id)
            .ok_or(not_found("endpoint", id.0 as u64))
    }

    fn frames_since(&self, since: u16) -> u16 {
        self.hw.read_frame_number().wrapping_sub(since) & self.config.frame_number_mask
    }

    // -- Endpoints ----------------------------------------------------------

    fn open_endpoint(&mut self, desc: EndpointDescriptor) -> UhciResult<EndpointId> {
        self.ensure_running()?;
        desc.validate()?;

        let id = EndpointId(self.next_endpoint);
        let mut ep = Endpoint::new(desc);
        if let Some(class) = desc.class() {
            let qh = self.pool.alloc_qh()?;
            self.chains.add(&self.pool, class, qh);
            ep.qh = Some(qh);
        }
        self.next_endpoint += 1;
        self.endpoints.insert(id, ep);

        log::info!(
            "[UHCI] Opened {:?} endpoint {} (device {}, endpoint {})",
            desc.kind,
            id.0,
            desc.address,
            desc.endpoint
        );
        Ok(id)
    }

    fn close_endpoint(&mut self, id: EndpointId) -> UhciResult<()> {
        let ep = self.endpoint(id)?;
        if !ep.is_idle() || self.transfers.values().any(|t| t.endpoint == id) {
            return Err(UhciError::Busy {
                resource: "endpoint",
                id: id.0 as u64,
            });
        }
        let mut ep = self
            .endpoints
            .remove(&id)
            .ok_or(not_found("endpoint", id.0 as u64))?;

        let mut release = PendingRelease {
            since: self.hw.read_frame_number(),
            tds: Vec::new(),
            qhs: Vec::new(),
        };
        if let (Some(class), Some(qh)) = (ep.desc.class(), ep.qh.take()) {
            self.chains.remove(&self.pool, class, qh)?;
            release.qhs.push(qh);
        }
        self.unlink_periodic(&mut ep, &mut release)?;
        if !release.is_empty() {
            self.releases.push(release);
        }

        log::info!("[UHCI] Closed endpoint {}", id.0);
        Ok(())
    }

    fn release_bandwidth(&mut self, id: EndpointId) -> UhciResult<()> {
        let ep = self.endpoint(id)?;
        if ep.reservation.is_none() {
            return Ok(());
        }
        if !ep.is_idle() || self.transfers.values().any(|t| t.endpoint == id) {
            return Err(UhciError::Busy {
                resource: "endpoint",
                id: id.0 as u64,
            });
        }
        self.drop_reservation(id)
    }

    /// Unlink an endpoint's periodic descriptors and return its bandwidth.
    /// The descriptors wait out the quiesce window.
    fn drop_reservation(&mut self, id: EndpointId) -> UhciResult<()> {
        let mut ep = self
            .endpoints
            .remove(&id)
            .ok_or(not_found("endpoint", id.0 as u64))?;
        let mut release = PendingRelease {
            since: self.hw.read_frame_number(),
            tds: Vec::new(),
            qhs: Vec::new(),
        };
        let result = self.unlink_periodic(&mut ep, &mut release);
        self.endpoints.insert(id, ep);
        if !release.is_empty() {
            self.releases.push(release);
        }
        result
    }

    /// Take a periodic endpoint out of every slot and return its bandwidth.
    fn unlink_periodic(
        &mut self,
        ep: &mut Endpoint,
        release: &mut PendingRelease,
    ) -> UhciResult<()> {
        for (slot, qh) in ep.intr_qhs.drain(..) {
            self.frames.remove_interrupt_qh(&self.pool, slot, qh)?;
            release.qhs.push(qh);
        }
        for frame in ep.iso_frames.drain(..) {
            self.pool.td(frame.td).deactivate();
            self.frames.remove_iso_td(&self.pool, frame.slot, frame.td)?;
            release.tds.push(frame.td);
        }
        ep.iso_next = 0;
        if let Some(reservation) = ep.reservation.take() {
            self.admission
                .release(&reservation.slots, reservation.bandwidth)?;
            log::debug!(
                "[UHCI] Released {} bit times in {} slots",
                reservation.bandwidth,
                reservation.slots.len()
            );
        }
        Ok(())
    }

    /// Admit a periodic endpoint and link its per-slot descriptors.
    fn reserve(&mut self, ep: &mut Endpoint) -> UhciResult<()> {
        let desc = ep.desc;
        let slot_count = self.frames.slot_count();
        let interval = normalize_interval(desc.interval, slot_count)?;
        let estimate =
            self.estimator
                .estimate(desc.kind, desc.speed, desc.direction, desc.max_packet);

        let offset = match desc.phase {
            Some(phase) => phase % interval,
            None => match self.admission.best_offset(interval, estimate) {
                Some(offset) => offset,
                None => {
                    let available = (0..interval)
                        .map(|o| {
                            self.admission
                                .available(&self.frames.schedule_interval(o, interval))
                        })
                        .max()
                        .unwrap_or(0);
                    log::warn!(
                        "[UHCI] No phase of interval {} has {} bit times free",
                        interval,
                        estimate
                    );
                    return Err(UhciError::AdmissionFailure {
                        requested: estimate,
                        available,
                    });
                }
            },
        };

        let slots = self.frames.schedule_interval(offset, interval);
        let admission = self.admission.try_reserve(&slots, estimate);
        if let Admission::Rejected { slot, available } = admission {
            log::warn!(
                "[UHCI] Admission refused: {} bit times needed, slot {} has {}",
                estimate,
                slot,
                available
            );
            return Err(UhciError::AdmissionFailure {
                requested: estimate,
                available,
            });
        }

        let linked = match desc.kind {
            TransferKind::Interrupt => self.link_interrupt_qhs(ep, &slots),
            _ => self.link_iso_tds(ep, &slots),
        };
        if let Err(err) = linked {
            self.admission.release(&slots, estimate)?;
            return Err(err);
        }

        ep.reservation = Some(Reservation {
            slots,
            bandwidth: estimate,
        });
        log::debug!(
            "[UHCI] Reserved {} bit times at phase {} every {} frames",
            estimate,
            offset,
            interval
        );
        Ok(())
    }

    fn link_interrupt_qhs(&mut self, ep: &mut Endpoint, slots: &SlotSet) -> UhciResult<()> {
        let mut qhs = Vec::with_capacity(slots.len());
        for slot in slots.iter() {
            match self.pool.alloc_qh() {
                Ok(qh) => qhs.push((slot, qh)),
                Err(err) => {
                    for (_, qh) in qhs {
                        self.pool.free_qh(qh)?;
                    }
                    return Err(err);
                }
            }
        }
        for &(slot, qh) in &qhs {
            self.frames.insert_interrupt_qh(&self.pool, slot, qh);
        }
        ep.intr_qhs = qhs;
        Ok(())
    }

    fn link_iso_tds(&mut self, ep: &mut Endpoint, slots: &SlotSet) -> UhciResult<()> {
        let tds = self.pool.alloc_tds(slots.len())?;
        for (slot, td) in slots.iter().zip(tds) {
            self.frames.insert_iso_td(&self.pool, slot, td);
            ep.iso_frames.push(IsoFrame {
                slot,
                td,
                busy: false,
            });
        }
        ep.iso_next = 0;
        Ok(())
    }

    // -- Transfers ----------------------------------------------------------

    fn submit(&mut self, request: TransferRequest) -> UhciResult<TransferId> {
        self.ensure_running()?;
        let ep_id = request.endpoint;
        let ep = self.endpoint(ep_id)?;
        let desc = ep.desc;
        let needs_reservation = desc.kind.is_periodic() && ep.reservation.is_none();

        // Nothing is reserved or allocated for a request that cannot run.
        self.check_request(&desc, &request)?;

        if needs_reservation {
            let mut ep = self
                .endpoints
                .remove(&ep_id)
                .ok_or(not_found("endpoint", ep_id.0 as u64))?;
            let reserved = self.reserve(&mut ep);
            self.endpoints.insert(ep_id, ep);
            reserved?;
        }

        let id = TransferId(self.next_transfer);
        let len = request.buffer.len;
        let queued = if desc.kind == TransferKind::Isochronous {
            self.submit_isochronous(id, request)
        } else {
            self.submit_chain(id, &desc, request)
        };
        let recorded = self.transfers.contains_key(&id);
        if recorded {
            self.next_transfer += 1;
        }
        if let Err(err) = queued {
            if needs_reservation && !recorded {
                self.drop_reservation(ep_id)?;
            }
            return Err(err);
        }

        log::debug!(
            "[UHCI] Submitted transfer {} on endpoint {} ({} bytes)",
            id.0,
            ep_id.0,
            len
        );
        Ok(id)
    }

    /// Reject requests the endpoint can never carry out.
    fn check_request(
        &self,
        desc: &EndpointDescriptor,
        request: &TransferRequest,
    ) -> UhciResult<()> {
        match (desc.kind, request.setup) {
            (TransferKind::Control, None) => {
                return Err(UhciError::InvalidArgument {
                    name: "setup",
                    value: "control transfer without a SETUP packet",
                })
            }
            (TransferKind::Control, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                return Err(UhciError::InvalidArgument {
                    name: "setup",
                    value: "SETUP packet on a non-control endpoint",
                })
            }
        }
        if !request.buffer.fits_bus() {
            return Err(UhciError::InvalidArgument {
                name: "buffer",
                value: "extends past the 32-bit bus address space",
            });
        }
        if desc.kind != TransferKind::Isochronous {
            return Ok(());
        }

        let slot_count = self.frames.slot_count();
        let ring = slot_count / normalize_interval(desc.interval, slot_count)?;
        let count = request.frame_lengths.len();
        if count == 0 {
            return Err(UhciError::InvalidArgument {
                name: "frame_lengths",
                value: "empty",
            });
        }
        if count > ring {
            return Err(UhciError::InvalidArgument {
                name: "frame_lengths",
                value: "more frames than the endpoint is polled in",
            });
        }
        if request.frame_lengths.iter().any(|&len| len > desc.max_packet) {
            return Err(UhciError::InvalidArgument {
                name: "frame_lengths",
                value: "frame longer than max packet",
            });
        }
        let total: usize = request.frame_lengths.iter().map(|&len| len as usize).sum();
        if total > request.buffer.len {
            return Err(UhciError::InvalidArgument {
                name: "buffer",
                value: "shorter than the frame lengths",
            });
        }
        Ok(())
    }

    /// Build a control, bulk or interrupt chain and queue it on the endpoint.
    fn submit_chain(
        &mut self,
        id: TransferId,
        desc: &EndpointDescriptor,
        request: TransferRequest,
    ) -> UhciResult<()> {
        let ep_id = request.endpoint;
        let params = ChainParams {
            address: desc.address,
            endpoint: desc.endpoint,
            max_packet: desc.max_packet,
            low_speed: desc.speed == UsbSpeed::Low,
            flags: request.flags,
        };
        let (tds, status_td) = match request.setup {
            Some(setup) => {
                let (tds, status_td) = build_control_chain(
                    &mut self.pool,
                    &params,
                    setup,
                    request.direction,
                    request.buffer,
                )?;
                (tds, Some(status_td))
            }
            None => (
                build_data_chain(&mut self.pool, &params, desc.direction, request.buffer)?,
                None,
            ),
        };

        self.transfers.insert(
            id,
            ActiveTransfer {
                id,
                endpoint: ep_id,
                kind: desc.kind,
                tds,
                status_td,
                requested: request.buffer.len,
                state: TransferState::Queued,
                status_redirected: false,
                callback: request.callback,
            },
        );
        if let Some(ep) = self.endpoints.get_mut(&ep_id) {
            ep.queue.push_back(id);
        }
        self.arm_next(ep_id)
    }

    /// Fill the endpoint's permanent TDs, one per frame, continuing where the
    /// previous transfer left off.
    fn submit_isochronous(&mut self, id: TransferId, request: TransferRequest) -> UhciResult<()> {
        let now = self.hw.read_frame_number() as usize;
        let slot_count = self.frames.slot_count();
        let lead = self.config.isoc_start_lead as usize;
        let ep = self
            .endpoints
            .get_mut(&request.endpoint)
            .ok_or(not_found("endpoint", request.endpoint.0 as u64))?;
        let desc = ep.desc;
        let count = request.frame_lengths.len();
        let ring = ep.iso_frames.len();
        if count == 0 || count > ring {
            return Err(corruption("isochronous ring does not match reservation"));
        }
        let total: usize = request.frame_lengths.iter().map(|&len| len as usize).sum();

        if ep.iso_in_use() == 0 {
            let target = (now + lead) % slot_count;
            ep.iso_next = ep
                .iso_frames
                .iter()
                .position(|frame| frame.slot >= target)
                .unwrap_or(0);
        }
        let picks: Vec<usize> = (0..count).map(|k| (ep.iso_next + k) % ring).collect();
        if picks.iter().any(|&i| ep.iso_frames[i].busy) {
            return Err(UhciError::Busy {
                resource: "isochronous ring",
                id: request.endpoint.0 as u64,
            });
        }

        let mut tds = Vec::with_capacity(count);
        let mut offset = 0u32;
        for (k, (&i, &len)) in picks.iter().zip(&request.frame_lengths).enumerate() {
            let frame = &mut ep.iso_frames[i];
            let hw = self.pool.td(frame.td);
            hw.set_token(
                Token {
                    pid: desc.direction.pid(),
                    address: desc.address,
                    endpoint: desc.endpoint,
                    toggle: false,
                    max_len: len,
                }
                .encode(),
            );
            hw.set_buffer(if len == 0 {
                PhysicalAddress::new(0)
            } else {
                request.buffer.phys.offset(offset)
            });
            let mut status = TdStatus::ACTIVE | TdStatus::ISO | TdStatus::ACTUAL_LENGTH;
            if k + 1 == count {
                status |= TdStatus::IOC;
            }
            // Status last: ACTIVE publishes token and buffer.
            hw.set_status(status);
            frame.busy = true;
            offset += len as u32;
            tds.push(frame.td);
        }
        ep.iso_next = (ep.iso_next + count) % ring;
        ep.queue.push_back(id);

        self.transfers.insert(
            id,
            ActiveTransfer {
                id,
                endpoint: request.endpoint,
                kind: TransferKind::Isochronous,
                tds,
                status_td: None,
                requested: total,
                state: TransferState::Armed { reclaiming: false },
                status_redirected: false,
                callback: request.callback,
            },
        );
        log::debug!(
            "[UHCI] Isochronous transfer {}: {} frames, {} bytes",
            id.0,
            count,
            total
        );
        Ok(())
    }

    /// Make the oldest queued transfer of an idle endpoint visible to the
    /// controller.
    fn arm_next(&mut self, ep_id: EndpointId) -> UhciResult<()> {
        let Some(ep) = self.endpoints.get_mut(&ep_id) else {
            return Ok(());
        };
        if ep.desc.kind == TransferKind::Isochronous || ep.armed.is_some() {
            return Ok(());
        }
        let Some(id) = ep.queue.pop_front() else {
            return Ok(());
        };
        let transfer = self
            .transfers
            .get_mut(&id)
            .ok_or(corruption("queued transfer has no record"))?;

        if ep.desc.kind != TransferKind::Control {
            ep.toggle = stamp_toggles(&self.pool, &transfer.tds, ep.toggle);
        }
        let first = transfer.tds.first().copied();
        if ep.desc.kind == TransferKind::Interrupt {
            for &(_, qh) in &ep.intr_qhs {
                self.pool.set_qh_element(qh, first);
            }
        } else if let Some(qh) = ep.qh {
            self.pool.set_qh_element(qh, first);
        }

        let reclaiming = match ep.desc.class() {
            Some(ScheduleClass::Bulk) => self.chains.add_loop(&self.pool),
            Some(ScheduleClass::FullSpeedControl) if self.config.control_reclamation => {
                self.chains.add_loop(&self.pool)
            }
            _ => false,
        };
        transfer.state = TransferState::Armed { reclaiming };
        ep.armed = Some(id);
        Ok(())
    }

    /// Walk live transfers. With `completions` unset only aborts are
    /// finished.
    fn scan(&mut self, completions: bool, out: &mut Vec<Finished>) -> UhciResult<()> {
        let now = self.hw.read_frame_number();
        let halted = self.hw.read_status().contains(UsbStatus::HALTED);
        let ids: Vec<TransferId> = self.transfers.keys().copied().collect();

        for id in ids {
            let Some(transfer) = self.transfers.get_mut(&id) else {
                continue;
            };
            let state = transfer.state;
            match state {
                TransferState::Queued => {}
                TransferState::Armed { .. } if completions => {
                    match check_progress(&self.pool, transfer) {
                        Progress::Pending => {}
                        Progress::RunStatusStage(status_td) => {
                            transfer.status_redirected = true;
                            let qh = self.endpoints.get(&transfer.endpoint).and_then(|ep| ep.qh);
                            if let Some(qh) = qh {
                                self.pool.set_qh_element(qh, Some(status_td));
                            }
                        }
                        Progress::Done => self.complete(id, out)?,
                    }
                }
                TransferState::Armed { .. } => {}
                TransferState::Aborting { since, .. } => {
                    let elapsed = now.wrapping_sub(since) & self.config.frame_number_mask;
                    if halted || elapsed >= self.config.quiesce_frames {
                        self.finish_abort(id, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Detach a finished chain, settle the toggle and hand back its TDs.
    fn complete(&mut self, id: TransferId, out: &mut Vec<Finished>) -> UhciResult<()> {
        let Some(transfer) = self.transfers.remove(&id) else {
            return Ok(());
        };
        let result = chain_result(&self.pool, &transfer);
        let ep_id = transfer.endpoint;
        let ep = self
            .endpoints
            .get_mut(&ep_id)
            .ok_or(corruption("transfer on a closed endpoint"))?;

        for &td in &transfer.tds {
            self.pool.td(td).deactivate();
        }
        if transfer.kind == TransferKind::Isochronous {
            ep.release_iso_tds(&transfer.tds);
            ep.queue.retain(|&queued| queued != id);
        } else {
            if ep.desc.kind == TransferKind::Interrupt {
                for &(_, qh) in &ep.intr_qhs {
                    self.pool.terminate(DescriptorHandle::Qh(qh));
                }
            } else if let Some(qh) = ep.qh {
                self.pool.terminate(DescriptorHandle::Qh(qh));
            }
            if transfer.state == (TransferState::Armed { reclaiming: true }) {
                self.chains.remove_loop(&self.pool)?;
            }
            if transfer.kind != TransferKind::Control {
                if let Some(toggle) = result.leftover_toggle {
                    ep.toggle = toggle;
                }
            }
            if ep.armed == Some(id) {
                ep.armed = None;
            }
            for &td in &transfer.tds {
                self.pool.free_td(td)?;
            }
        }

        match result.status {
            CompletionStatus::BusError(bits) => log::error!(
                "[UHCI] Transfer {} failed: status {:#010x}",
                id.0,
                bits.bits()
            ),
            CompletionStatus::Stalled => log::warn!("[UHCI] Transfer {} stalled", id.0),
            _ => log::debug!(
                "[UHCI] Transfer {} complete, {} bytes",
                id.0,
                result.actual_length
            ),
        }

        out.push((
            Completion {
                id,
                endpoint: ep_id,
                status: result.status,
                actual_length: result.actual_length,
                frame_lengths: result.frame_lengths,
            },
            transfer.callback,
        ));
        self.arm_next(ep_id)
    }

    fn abort(&mut self, id: TransferId) -> UhciResult<AbortStatus> {
        if id.0 == 0 || id.0 >= self.next_transfer {
            return Err(not_found("transfer", id.0));
        }
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return Ok(AbortStatus::AlreadyFinished);
        };
        let was_armed = match transfer.state {
            TransferState::Aborting { .. } => return Ok(AbortStatus::AlreadyAborting),
            TransferState::Armed { .. } => true,
            TransferState::Queued => false,
        };
        let ep = self
            .endpoints
            .get_mut(&transfer.endpoint)
            .ok_or(corruption("transfer on a closed endpoint"))?;

        // Remember the first TD still in front of the controller; its fate
        // decides the toggle once the chain is quiescent.
        let mut in_flight = None;
        for (index, &td) in transfer.tds.iter().enumerate() {
            let before = self.pool.td(td).deactivate();
            if before.contains(TdStatus::ACTIVE) && in_flight.is_none() {
                in_flight = Some(InFlight { index, before });
            }
        }

        if transfer.kind != TransferKind::Isochronous {
            for &td in &transfer.tds {
                self.pool.terminate(DescriptorHandle::Td(td));
            }
            if was_armed {
                if ep.desc.kind == TransferKind::Interrupt {
                    for &(_, qh) in &ep.intr_qhs {
                        self.pool.terminate(DescriptorHandle::Qh(qh));
                    }
                } else if let Some(qh) = ep.qh {
                    self.pool.terminate(DescriptorHandle::Qh(qh));
                }
                if transfer.state == (TransferState::Armed { reclaiming: true }) {
                    self.chains.remove_loop(&self.pool)?;
                }
            } else {
                ep.queue.retain(|&queued| queued != id);
            }
        }

        let since = self.hw.read_frame_number();
        transfer.state = TransferState::Aborting {
            since,
            was_armed,
            in_flight,
        };
        log::warn!(
            "[UHCI] Aborting transfer {} on endpoint {}",
            id.0,
            transfer.endpoint.0
        );
        Ok(AbortStatus::Quiescing)
    }

    /// Second abort phase: the controller has moved past the chain.
    fn finish_abort(&mut self, id: TransferId, out: &mut Vec<Finished>) -> UhciResult<()> {
        let Some(transfer) = self.transfers.remove(&id) else {
            return Ok(());
        };
        let ep_id = transfer.endpoint;
        let ep = self
            .endpoints
            .get_mut(&ep_id)
            .ok_or(corruption("transfer on a closed endpoint"))?;

        // The controller is past the chain, so a transaction that was in
        // flight during phase one has been written back by now.
        if let TransferState::Aborting {
            was_armed: true,
            in_flight,
            ..
        } = transfer.state
        {
            let carries_toggle =
                matches!(ep.desc.kind, TransferKind::Bulk | TransferKind::Interrupt);
            if carries_toggle {
                if let Some(toggle) = abort_toggle(&self.pool, &transfer.tds, in_flight) {
                    ep.toggle = toggle;
                }
            }
        }

        // A NAK written back after phase one can set ACTIVE again.
        for &td in &transfer.tds {
            self.pool.td(td).deactivate();
        }
        let result = chain_result(&self.pool, &transfer);

        if transfer.kind == TransferKind::Isochronous {
            ep.release_iso_tds(&transfer.tds);
            ep.queue.retain(|&queued| queued != id);
        } else {
            if ep.armed == Some(id) {
                ep.armed = None;
            }
            for &td in &transfer.tds {
                self.pool.free_td(td)?;
            }
        }

        log::debug!("[UHCI] Transfer {} cancelled", id.0);
        out.push((
            Completion {
                id,
                endpoint: ep_id,
                status: CompletionStatus::Cancelled,
                actual_length: result.actual_length,
                frame_lengths: result.frame_lengths,
            },
            transfer.callback,
        ));
        self.arm_next(ep_id)
    }

    /// Return descriptors whose quiesce window has passed.
    fn service_releases(&mut self) -> UhciResult<()> {
        if self.releases.is_empty() {
            return Ok(());
        }
        let halted = self.hw.read_status().contains(UsbStatus::HALTED);
        let quiesce = self.config.quiesce_frames;
        let pending = core::mem::take(&mut self.releases);
        let (ready, waiting): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|release| halted || self.frames_since(release.since) >= quiesce);
        self.releases = waiting;

        for release in ready {
            for td in release.tds {
                self.pool.td(td).deactivate();
                self.pool.free_td(td)?;
            }
            for qh in release.qhs {
                self.pool.free_qh(qh)?;
            }
        }
        Ok(())
    }

    /// Abort every live transfer. Reclaim them on the spot only if the
    /// controller has confirmed the halt.
    fn cancel_all(&mut self, halted: bool, out: &mut Vec<Finished>) -> UhciResult<()> {
        let ids: Vec<TransferId> = self.transfers.keys().copied().collect();
        for id in ids {
            let Some(transfer) = self.transfers.get(&id) else {
                continue;
            };
            if !matches!(transfer.state, TransferState::Aborting { .. }) {
                self.abort(id)?;
            }
            if halted {
                self.finish_abort(id, out)?;
            }
        }
        Ok(())
    }

    // -- Audit --------------------------------------------------------------

    fn verify(&self) -> UhciResult<()> {
        self.chains.verify(&self.pool)?;
        self.frames.verify(&self.pool)?;
        self.admission.verify()?;

        let mut expected = alloc::vec![0u32; self.frames.slot_count()];
        for ep in self.endpoints.values() {
            if let Some(reservation) = ep.reservation {
                for slot in reservation.slots.iter() {
                    expected[slot] += reservation.bandwidth;
                }
                let linked = match ep.desc.kind {
                    TransferKind::Interrupt => ep.intr_qhs.len(),
                    _ => ep.iso_frames.len(),
                };
                if linked != reservation.slots.len() {
                    return Err(corruption("periodic descriptors do not match reservation"));
                }
            }
            if let Some(id) = ep.armed {
                if !self.transfers.contains_key(&id) {
                    return Err(corruption("endpoint armed with a finished transfer"));
                }
            }
            if let Some(qh) = ep.qh {
                if !self.pool.qh_allocated(qh) {
                    return Err(corruption("endpoint QH freed while open"));
                }
            }
        }
        if expected
            .iter()
            .enumerate()
            .any(|(slot, &bw)| self.admission.reserved(slot) != bw)
        {
            return Err(corruption("slot bandwidth does not match reservations"));
        }

        for transfer in self.transfers.values() {
            if transfer.tds.iter().any(|&td| !self.pool.td_allocated(td)) {
                return Err(corruption("live transfer holds a freed TD"));
            }
            if !self.endpoints.contains_key(&transfer.endpoint) {
                return Err(corruption("transfer on a closed endpoint"));
            }
        }
        Ok(())
    }
}

impl<H: HostControllerOps, M: DmaMapper> Drop for SchedulerState<H, M> {
    fn drop(&mut self) {
        self.hw.enable_interrupts(UsbInterrupt::empty());
        if set_running(&mut self.hw, false).is_err() {
            log::warn!("[UHCI] Controller still running while the schedule is torn down");
        }
        let phys = self.frames.physical_address();
        self.pool.unmap_page(phys);
    }
}
