//! Shared helpers for the scheduler integration tests

#![allow(dead_code)]

use std::collections::BTreeSet;

use veridian_uhci::{
    descriptor::LinkPointer,
    frame_list::UHCI_FRAME_LIST_COUNT,
    sim::{FrameWalker, SequentialMapper, SimulatedController},
    Completion, DmaBuffer, PhysicalAddress, SchedulerConfig, UhciScheduler,
};

pub type Sim = UhciScheduler<SimulatedController, SequentialMapper>;

/// Data buffers live well above anything the mapper hands out.
const BUFFER_BASE: u32 = 0x0400_0000;
const SETUP_PACKET: u32 = 0x03F0_0000;

pub fn scheduler() -> Sim {
    scheduler_with(SchedulerConfig::default())
}

pub fn scheduler_with(config: SchedulerConfig) -> Sim {
    UhciScheduler::new(SimulatedController::new(), SequentialMapper::new(), config)
        .expect("scheduler bring-up")
}

/// Scheduler on a specially configured simulated controller.
pub fn scheduler_on(hw: SimulatedController) -> Sim {
    UhciScheduler::new(hw, SequentialMapper::new(), SchedulerConfig::default())
        .expect("scheduler bring-up")
}

/// Scheduler whose frame counter advances on every read.
pub fn free_running_scheduler() -> Sim {
    scheduler_on(SimulatedController::new().with_free_running())
}

pub fn buffer(len: usize) -> DmaBuffer {
    DmaBuffer::new(PhysicalAddress::new(BUFFER_BASE), len)
}

pub fn setup_packet() -> PhysicalAddress {
    PhysicalAddress::new(SETUP_PACKET)
}

/// Step frames and poll until nothing is in flight or `max_frames` ran out.
pub fn run_until_idle(sched: &Sim, walker: &mut FrameWalker, max_frames: usize) -> Vec<Completion> {
    let mut done = Vec::new();
    for _ in 0..max_frames {
        done.extend(sched.poll_completions());
        if sched.active_transfers().is_empty() {
            return done;
        }
        walker.step(sched);
    }
    done.extend(sched.poll_completions());
    done
}

/// Count links in the hardware-visible schedule that lead to descriptors the
/// pool no longer considers allocated.
pub fn stale_links(sched: &Sim) -> usize {
    sched.with_schedule(|_, view| {
        let mut stale = 0;
        for index in 0..UHCI_FRAME_LIST_COUNT {
            let mut link = LinkPointer::decode(view.frame_list_entry(index));
            let mut seen = BTreeSet::new();
            loop {
                match link {
                    LinkPointer::Terminate => break,
                    LinkPointer::Td { phys, .. } => match view.td(phys) {
                        Some(td) => link = td.link(),
                        None => {
                            stale += 1;
                            break;
                        }
                    },
                    LinkPointer::Qh(phys) => {
                        if !seen.insert(phys) {
                            break;
                        }
                        let Some(qh) = view.qh(phys) else {
                            stale += 1;
                            break;
                        };
                        // Follow the element down the queue while the
                        // controller would.
                        let mut element = qh.element();
                        let mut depth = 0;
                        while let LinkPointer::Td { phys: td_phys, .. } = element {
                            let Some(td) = view.td(td_phys) else {
                                stale += 1;
                                break;
                            };
                            if !td.is_active() || depth > 4096 {
                                break;
                            }
                            element = td.link();
                            depth += 1;
                        }
                        link = qh.head_link();
                    }
                }
            }
        }
        stale
    })
}

/// Every reserved slot is within the admission limit.
pub fn bandwidth_within_limit(sched: &Sim) -> bool {
    let limit = sched.admission_limit();
    let slots = sched.config().virtual_frames;
    (0..slots).all(|slot| sched.slot_bandwidth(slot) <= limit)
}
