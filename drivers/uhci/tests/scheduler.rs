//! End-to-end scheduler behaviour against the simulated controller

mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use common::{
    bandwidth_within_limit, buffer, free_running_scheduler, run_until_idle, scheduler,
    scheduler_on, scheduler_with, setup_packet, stale_links,
};
use veridian_uhci::{
    descriptor::TdStatus,
    sim::{FrameWalker, SimulatedController, TdOutcome},
    AbortStatus, BandwidthEstimator, BitTimeEstimator, CompletionStatus, ControllerState,
    Direction, DmaBuffer, EndpointDescriptor, PhysicalAddress, QueueState, SchedulerConfig,
    TransferFlags, TransferKind, TransferRequest, UhciError, UsbSpeed,
};

// -- Ordering ---------------------------------------------------------------

#[test]
fn test_bulk_completions_arrive_in_submission_order() {
    let sched = scheduler();
    let a = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let b = sched
        .open_endpoint(EndpointDescriptor::bulk(3, 2, Direction::Out, 64))
        .unwrap();

    let mut walker = FrameWalker::new();
    // First transfer on `a` takes two packets, the second ends short on its
    // first packet, the third stalls.
    walker.script(2, 1, TdOutcome::Complete);
    walker.script(2, 1, TdOutcome::Complete);
    walker.script(2, 1, TdOutcome::Short(10));
    walker.script(2, 1, TdOutcome::Stall);

    let a1 = sched.submit(TransferRequest::bulk(a, buffer(128))).unwrap();
    let a2 = sched
        .submit(TransferRequest::bulk(a, buffer(192)).with_flags(TransferFlags::SHORT_OK))
        .unwrap();
    let a3 = sched.submit(TransferRequest::bulk(a, buffer(64))).unwrap();
    let b1 = sched.submit(TransferRequest::bulk(b, buffer(32))).unwrap();
    let b2 = sched.submit(TransferRequest::bulk(b, buffer(0))).unwrap();
    assert_eq!(sched.queue_state(a).unwrap(), QueueState::Active);

    let done = run_until_idle(&sched, &mut walker, 32);
    assert_eq!(done.len(), 5);
    assert_eq!(walker.pending_scripts(), 0);

    let on_a: Vec<_> = done.iter().filter(|c| c.endpoint == a).collect();
    let on_b: Vec<_> = done.iter().filter(|c| c.endpoint == b).collect();
    assert_eq!(
        on_a.iter().map(|c| c.id).collect::<Vec<_>>(),
        vec![a1, a2, a3]
    );
    assert_eq!(on_b.iter().map(|c| c.id).collect::<Vec<_>>(), vec![b1, b2]);

    assert_eq!(on_a[0].status, CompletionStatus::Success);
    assert_eq!(on_a[0].actual_length, 128);
    assert_eq!(on_a[1].status, CompletionStatus::ShortPacket);
    assert_eq!(on_a[1].actual_length, 10);
    assert_eq!(on_a[2].status, CompletionStatus::Stalled);
    assert!(matches!(on_a[2].result(), Err(UhciError::Stalled)));
    assert_eq!(on_b[0].actual_length, 32);
    assert_eq!(on_b[1].status, CompletionStatus::Success);
    assert_eq!(on_b[1].actual_length, 0);

    assert_eq!(sched.queue_state(a).unwrap(), QueueState::Empty);
    assert_eq!(sched.reclamation_users(), 0);
    sched.verify_schedule().unwrap();
}

#[test]
fn test_periodic_runs_before_control_before_bulk() {
    let sched = scheduler();
    let bulk = sched
        .open_endpoint(EndpointDescriptor::bulk(6, 2, Direction::Out, 64))
        .unwrap();
    let control = sched
        .open_endpoint(EndpointDescriptor::control(5, 8, UsbSpeed::Full))
        .unwrap();
    let intr = sched
        .open_endpoint(EndpointDescriptor::interrupt(
            4,
            1,
            Direction::In,
            UsbSpeed::Full,
            8,
            1,
        ))
        .unwrap();

    // Submitted in reverse priority order.
    let b = sched.submit(TransferRequest::bulk(bulk, buffer(64))).unwrap();
    let c = sched
        .submit(TransferRequest::control(
            control,
            setup_packet(),
            Direction::In,
            buffer(8),
        ))
        .unwrap();
    let i = sched
        .submit(TransferRequest::interrupt(intr, buffer(8)))
        .unwrap();

    let bulk_tds = sched.transfer_descriptors(b).unwrap();
    let control_tds = sched.transfer_descriptors(c).unwrap();
    let intr_tds = sched.transfer_descriptors(i).unwrap();
    assert_eq!(control_tds.len(), 3);

    let trace = FrameWalker::new().step(&sched);
    let position = |phys: PhysicalAddress| {
        trace
            .executed
            .iter()
            .position(|&p| p == phys)
            .unwrap()
    };
    let last_intr = intr_tds.iter().map(|&p| position(p)).max().unwrap();
    let first_control = control_tds.iter().map(|&p| position(p)).min().unwrap();
    let last_control = control_tds.iter().map(|&p| position(p)).max().unwrap();
    let first_bulk = bulk_tds.iter().map(|&p| position(p)).min().unwrap();
    assert!(last_intr < first_control);
    assert!(last_control < first_bulk);
    assert!(!trace.stale);

    let done = sched.poll_completions();
    assert_eq!(done.len(), 3);
    assert!(done.iter().all(|c| c.status == CompletionStatus::Success));
}

// -- Toggles ----------------------------------------------------------------

#[test]
fn test_toggle_alternates_across_transfers() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::Out, 64))
        .unwrap();
    let mut walker = FrameWalker::new();

    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    run_until_idle(&sched, &mut walker, 8);
    assert!(sched.endpoint_toggle(ep).unwrap());

    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    run_until_idle(&sched, &mut walker, 8);
    assert!(!sched.endpoint_toggle(ep).unwrap());
}

#[test]
fn test_short_packet_hands_unused_toggle_back() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let mut walker = FrameWalker::new();
    walker.script(2, 1, TdOutcome::Short(5));

    // Four packets stamped DATA0..DATA1; the chain ends after the first.
    sched
        .submit(TransferRequest::bulk(ep, buffer(256)).with_flags(TransferFlags::SHORT_OK))
        .unwrap();
    assert!(!sched.endpoint_toggle(ep).unwrap());

    let done = run_until_idle(&sched, &mut walker, 8);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, CompletionStatus::ShortPacket);
    assert_eq!(done[0].actual_length, 5);
    assert!(sched.endpoint_toggle(ep).unwrap());
}

#[test]
fn test_abort_settles_toggle_after_quiesce() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let mut walker = FrameWalker::new();

    // First packet NAKed and never retried: the device still expects DATA0.
    walker.script(2, 1, TdOutcome::Nak);
    let id = sched.submit(TransferRequest::bulk(ep, buffer(192))).unwrap();
    walker.step(&sched);
    sched.abort(id).unwrap();
    walker.run(&sched, 2);
    let done = sched.poll_completions();
    assert_eq!(done[0].status, CompletionStatus::Cancelled);
    assert!(!sched.endpoint_toggle(ep).unwrap());

    // The controller finishes the packet it was already moving after the
    // chain is deactivated; the device has now seen DATA0.
    walker.script(2, 1, TdOutcome::Nak);
    let id = sched.submit(TransferRequest::bulk(ep, buffer(192))).unwrap();
    walker.step(&sched);
    let tds = sched.transfer_descriptors(id).unwrap();
    sched.abort(id).unwrap();
    sched.with_schedule(|_, view| {
        let td = view.td(tds[0]).unwrap();
        td.set_status((td.status() - TdStatus::ACTIVE).with_actual_length(64));
    });
    walker.run(&sched, 2);
    let done = sched.poll_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, CompletionStatus::Cancelled);
    assert_eq!(done[0].actual_length, 64);
    assert!(sched.endpoint_toggle(ep).unwrap());
}

// -- Control ----------------------------------------------------------------

#[test]
fn test_control_short_data_stage_still_runs_status() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::control(1, 8, UsbSpeed::Full))
        .unwrap();
    let mut walker = FrameWalker::new();
    walker.script(1, 0, TdOutcome::Complete);
    walker.script(1, 0, TdOutcome::Short(4));

    let id = sched
        .submit(
            TransferRequest::control(ep, setup_packet(), Direction::In, buffer(64))
                .with_flags(TransferFlags::SHORT_OK),
        )
        .unwrap();
    let tds = sched.transfer_descriptors(id).unwrap();
    let status_td = *tds.last().unwrap();
    // SETUP, eight data packets, status.
    assert_eq!(tds.len(), 10);

    walker.step(&sched);
    assert!(sched.poll_completions().is_empty());

    let trace = walker.step(&sched);
    assert_eq!(trace.executed, vec![status_td]);
    let done = sched.poll_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].status, CompletionStatus::ShortPacket);
    assert_eq!(done[0].actual_length, 4);
    assert_eq!(stale_links(&sched), 0);
    sched.verify_schedule().unwrap();
}

#[test]
fn test_setup_stall_reports_stalled() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::control(1, 8, UsbSpeed::Low))
        .unwrap();
    let mut walker = FrameWalker::new();
    walker.script(1, 0, TdOutcome::Stall);

    sched
        .submit(TransferRequest::control(
            ep,
            setup_packet(),
            Direction::Out,
            veridian_uhci::DmaBuffer::empty(),
        ))
        .unwrap();
    let done = run_until_idle(&sched, &mut walker, 4);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, CompletionStatus::Stalled);
}

#[test]
fn test_bus_error_carries_error_bits() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let mut walker = FrameWalker::new();
    walker.script(2, 1, TdOutcome::BusError(TdStatus::CRC_TIMEOUT));

    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    let done = run_until_idle(&sched, &mut walker, 4);
    match done[0].status {
        CompletionStatus::BusError(bits) => assert!(bits.contains(TdStatus::CRC_TIMEOUT)),
        other => panic!("unexpected status {:?}", other),
    }
}

// -- Cancellation -----------------------------------------------------------

#[test]
fn test_abort_reclaims_chain_after_quiesce() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let baseline = sched.pool_stats().tds_in_use();
    let mut walker = FrameWalker::new();
    for _ in 0..4 {
        walker.script(2, 1, TdOutcome::Nak);
    }

    let id = sched.submit(TransferRequest::bulk(ep, buffer(192))).unwrap();
    let tds = sched.transfer_descriptors(id).unwrap();
    assert_eq!(tds.len(), 3);
    walker.step(&sched);

    assert_eq!(sched.abort(id).unwrap(), AbortStatus::Quiescing);
    sched.with_schedule(|_, view| {
        for &phys in &tds {
            let td = view.td(phys).expect("still allocated while quiescing");
            assert!(!td.is_active());
        }
    });
    assert!(sched.poll_completions().is_empty());
    assert!(sched.active_transfers().contains(&id));

    walker.run(&sched, 2);
    let done = sched.poll_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, CompletionStatus::Cancelled);
    assert!(!sched.active_transfers().contains(&id));
    assert!(sched.transfer_descriptors(id).is_none());
    sched.with_schedule(|_, view| {
        assert!(tds.iter().all(|&phys| view.td(phys).is_none()));
    });
    assert_eq!(sched.pool_stats().tds_in_use(), baseline);
    assert_eq!(stale_links(&sched), 0);
}

#[test]
fn test_double_abort_frees_once() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::Out, 64))
        .unwrap();
    let baseline = sched.pool_stats();
    let mut walker = FrameWalker::new();
    walker.script(2, 1, TdOutcome::Nak);

    let id = sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    assert_eq!(sched.abort(id).unwrap(), AbortStatus::Quiescing);
    assert_eq!(sched.abort(id).unwrap(), AbortStatus::AlreadyAborting);

    let done = run_until_idle(&sched, &mut walker, 8);
    assert_eq!(done.len(), 1);
    assert_eq!(sched.abort(id).unwrap(), AbortStatus::AlreadyFinished);
    assert!(sched.poll_completions().is_empty());

    let after = sched.pool_stats();
    assert_eq!(after.tds_in_use(), baseline.tds_in_use());
    assert_eq!(
        after.allocations - baseline.allocations,
        after.deallocations - baseline.deallocations
    );
    assert_eq!(sched.controller_state(), ControllerState::Running);
}

#[test]
fn test_abort_queued_transfer_keeps_order() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let first = sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    let second = sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    let third = sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    assert_eq!(sched.abort(second).unwrap(), AbortStatus::Quiescing);

    let mut walker = FrameWalker::new();
    let done = run_until_idle(&sched, &mut walker, 16);
    assert_eq!(done.len(), 3);
    let status = |id| done.iter().find(|c| c.id == id).unwrap().status;
    assert_eq!(status(first), CompletionStatus::Success);
    assert_eq!(status(second), CompletionStatus::Cancelled);
    assert_eq!(status(third), CompletionStatus::Success);
    let successes: Vec<_> = done
        .iter()
        .filter(|c| c.status == CompletionStatus::Success)
        .map(|c| c.id)
        .collect();
    assert_eq!(successes, vec![first, third]);
}

#[test]
fn test_abort_and_wait_with_running_frame_counter() {
    let sched = free_running_scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let id = sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();

    sched.abort_and_wait(id, 100).unwrap();
    assert!(!sched.active_transfers().contains(&id));
    let done = sched.poll_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, CompletionStatus::Cancelled);
}

#[test]
fn test_abort_and_wait_detects_stuck_frame_counter() {
    let sched = free_running_scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let id = sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    sched.with_schedule(|hw, _| hw.freeze(true));

    assert!(matches!(
        sched.abort_and_wait(id, 16),
        Err(UhciError::HardwareError { .. })
    ));
    assert!(sched.active_transfers().contains(&id));
}

// -- Periodic scheduling ----------------------------------------------------

#[test]
fn test_isochronous_interval_two_occupies_every_other_slot() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::isochronous(7, 1, Direction::In, 256, 2).with_phase(1))
        .unwrap();
    assert!(sched.endpoint_slots(ep).unwrap().is_empty());

    sched
        .submit(TransferRequest::isochronous(ep, buffer(256), vec![256]))
        .unwrap();
    let expected: Vec<usize> = (1..128).step_by(2).collect();
    assert_eq!(sched.endpoint_slots(ep).unwrap(), expected);

    let cost =
        BitTimeEstimator.estimate(TransferKind::Isochronous, UsbSpeed::Full, Direction::In, 256);
    for slot in 0..128 {
        let want = if slot % 2 == 1 { cost } else { 0 };
        assert_eq!(sched.slot_bandwidth(slot), want);
    }

    let mut walker = FrameWalker::new();
    run_until_idle(&sched, &mut walker, 16);
    sched.release_bandwidth(ep).unwrap();
    assert!((0..128).all(|slot| sched.slot_bandwidth(slot) == 0));
    assert!(sched.endpoint_slots(ep).unwrap().is_empty());
    assert_eq!(sched.pending_releases(), 1);

    walker.run(&sched, 2);
    sched.poll_completions();
    assert_eq!(sched.pending_releases(), 0);
    assert_eq!(stale_links(&sched), 0);
    sched.verify_schedule().unwrap();
}

#[test]
fn test_isochronous_frame_lengths_reported_per_frame() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::isochronous(7, 2, Direction::In, 192, 1))
        .unwrap();
    let mut walker = FrameWalker::new();
    walker.script(7, 2, TdOutcome::Complete);
    walker.script(7, 2, TdOutcome::Short(80));
    walker.script(7, 2, TdOutcome::Complete);
    walker.script(7, 2, TdOutcome::Complete);

    let id = sched
        .submit(TransferRequest::isochronous(
            ep,
            buffer(342),
            vec![192, 100, 0, 50],
        ))
        .unwrap();
    assert_eq!(sched.queue_state(ep).unwrap(), QueueState::Active);

    let done = run_until_idle(&sched, &mut walker, 16);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].status, CompletionStatus::Success);
    assert_eq!(done[0].frame_lengths, vec![192, 80, 0, 50]);
    assert_eq!(done[0].actual_length, 322);
    assert_eq!(sched.queue_state(ep).unwrap(), QueueState::Empty);
}

#[test]
fn test_isochronous_rejects_bad_requests() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::isochronous(7, 1, Direction::Out, 64, 64))
        .unwrap();

    let empty = sched.submit(TransferRequest::isochronous(ep, buffer(64), vec![]));
    assert!(matches!(empty, Err(UhciError::InvalidArgument { .. })));
    let oversized = sched.submit(TransferRequest::isochronous(ep, buffer(128), vec![128]));
    assert!(matches!(oversized, Err(UhciError::InvalidArgument { .. })));
    let short_buffer = sched.submit(TransferRequest::isochronous(ep, buffer(32), vec![64]));
    assert!(matches!(short_buffer, Err(UhciError::InvalidArgument { .. })));

    // Interval 64 polls two slots; both are now in flight.
    sched
        .submit(TransferRequest::isochronous(ep, buffer(128), vec![64, 64]))
        .unwrap();
    let busy = sched.submit(TransferRequest::isochronous(ep, buffer(64), vec![64]));
    assert!(matches!(busy, Err(UhciError::Busy { .. })));
}

#[test]
fn test_rejected_isochronous_submit_reserves_nothing() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::isochronous(7, 1, Direction::In, 64, 4))
        .unwrap();
    let tds = sched.pool_stats().tds_in_use();

    // Interval 4 polls 32 of the 128 slots.
    let rejected = vec![
        TransferRequest::isochronous(ep, buffer(64), vec![]),
        TransferRequest::isochronous(ep, buffer(128), vec![128]),
        TransferRequest::isochronous(ep, buffer(32), vec![64]),
        TransferRequest::isochronous(ep, buffer(64 * 40), vec![64; 40]),
    ];
    for request in rejected {
        let err = sched.submit(request).unwrap_err();
        assert!(matches!(err, UhciError::InvalidArgument { .. }));
        assert_eq!(sched.bandwidth_in_use(), 0);
        assert!(sched.endpoint_slots(ep).unwrap().is_empty());
        assert_eq!(sched.pool_stats().tds_in_use(), tds);
        assert_eq!(sched.pending_releases(), 0);
    }

    sched
        .submit(TransferRequest::isochronous(ep, buffer(64), vec![64]))
        .unwrap();
    assert_eq!(sched.endpoint_slots(ep).unwrap().len(), 32);
    assert!(sched.bandwidth_in_use() > 0);
    sched.verify_schedule().unwrap();
}

#[test]
fn test_failed_first_interrupt_submit_gives_bandwidth_back() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::interrupt(
            5,
            1,
            Direction::In,
            UsbSpeed::Full,
            8,
            8,
        ))
        .unwrap();

    // 5000 eight-byte packets need more TDs than the pool may map.
    let err = sched
        .submit(TransferRequest::interrupt(ep, buffer(8 * 5000)))
        .unwrap_err();
    assert!(matches!(err, UhciError::OutOfMemory { .. }));
    assert_eq!(sched.bandwidth_in_use(), 0);
    assert!(sched.endpoint_slots(ep).unwrap().is_empty());
    // Its QHs were already linked into the frame list.
    assert_eq!(sched.pending_releases(), 1);
    assert_eq!(stale_links(&sched), 0);

    FrameWalker::new().run(&sched, 2);
    sched.poll_completions();
    assert_eq!(sched.pending_releases(), 0);

    sched
        .submit(TransferRequest::interrupt(ep, buffer(8)))
        .unwrap();
    assert_eq!(sched.endpoint_slots(ep).unwrap().len(), 16);
    sched.verify_schedule().unwrap();
}

#[test]
fn test_interrupt_endpoints_spread_over_phases() {
    let sched = scheduler();
    let mut phases = Vec::new();
    for address in 1..=5 {
        let ep = sched
            .open_endpoint(EndpointDescriptor::interrupt(
                address,
                1,
                Direction::In,
                UsbSpeed::Full,
                8,
                4,
            ))
            .unwrap();
        sched
            .submit(TransferRequest::interrupt(ep, buffer(8)))
            .unwrap();
        let slots = sched.endpoint_slots(ep).unwrap();
        assert_eq!(slots.len(), 32);
        phases.push(slots[0]);
    }
    assert_eq!(phases, vec![0, 1, 2, 3, 0]);
    assert!(bandwidth_within_limit(&sched));
    sched.verify_schedule().unwrap();
}

#[test]
fn test_admission_refuses_without_partial_reservation() {
    let sched = scheduler();
    let limit = sched.admission_limit();
    assert_eq!(limit, 10_800);

    let big = EndpointDescriptor::isochronous(7, 1, Direction::In, 1023, 1);
    let first = sched.open_endpoint(big).unwrap();
    sched
        .submit(TransferRequest::isochronous(first, buffer(1023), vec![1023]))
        .unwrap();
    let cost =
        BitTimeEstimator.estimate(TransferKind::Isochronous, UsbSpeed::Full, Direction::In, 1023);
    assert!((0..128).all(|slot| sched.slot_bandwidth(slot) == cost));

    let second = sched
        .open_endpoint(EndpointDescriptor::isochronous(8, 1, Direction::In, 1023, 1))
        .unwrap();
    let err = sched
        .submit(TransferRequest::isochronous(second, buffer(1023), vec![1023]))
        .unwrap_err();
    assert!(matches!(err, UhciError::AdmissionFailure { .. }));
    assert!(err.is_recoverable());
    assert!((0..128).all(|slot| sched.slot_bandwidth(slot) == cost));
    assert!(sched.endpoint_slots(second).unwrap().is_empty());

    let intr = sched
        .open_endpoint(EndpointDescriptor::interrupt(
            9,
            1,
            Direction::In,
            UsbSpeed::Full,
            64,
            1,
        ))
        .unwrap();
    let intr_cost =
        BitTimeEstimator.estimate(TransferKind::Interrupt, UsbSpeed::Full, Direction::In, 64);
    let result = sched.submit(TransferRequest::interrupt(intr, buffer(64)));
    assert_eq!(result.is_ok(), cost + intr_cost <= limit);
    assert!(bandwidth_within_limit(&sched));
    assert_eq!(sched.controller_state(), ControllerState::Running);
    sched.verify_schedule().unwrap();
}

// -- Request limits ---------------------------------------------------------

#[test]
fn test_buffers_beyond_bus_or_pool_are_refused() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let tds = sched.pool_stats().tds_in_use();

    let past_bus = DmaBuffer::new(PhysicalAddress::new(0xFFFF_0000), 0x2_0000);
    let err = sched
        .submit(TransferRequest::bulk(ep, past_bus))
        .unwrap_err();
    assert!(matches!(err, UhciError::InvalidArgument { name: "buffer", .. }));

    // 64 MiB in 64-byte packets.
    let huge = DmaBuffer::new(PhysicalAddress::new(0x1000_0000), 64 << 20);
    let err = sched.submit(TransferRequest::bulk(ep, huge)).unwrap_err();
    assert!(matches!(
        err,
        UhciError::OutOfMemory {
            requested: 1_048_576,
            ..
        }
    ));
    assert!(err.is_recoverable());

    assert_eq!(sched.pool_stats().tds_in_use(), tds);
    assert!(sched.active_transfers().is_empty());
    assert_eq!(sched.queue_state(ep).unwrap(), QueueState::Empty);
    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
}

// -- Endpoint lifetime ------------------------------------------------------

#[test]
fn test_close_and_reopen_reuses_queue_head() {
    let sched = scheduler();
    let desc = EndpointDescriptor::bulk(2, 1, Direction::In, 64);
    let ep = sched.open_endpoint(desc).unwrap();
    let qh = sched.endpoint_queue_heads(ep).unwrap();
    assert_eq!(qh.len(), 1);
    let baseline = sched.pool_stats().qhs_in_use();

    let mut walker = FrameWalker::new();
    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    run_until_idle(&sched, &mut walker, 8);

    sched.close_endpoint(ep).unwrap();
    assert!(matches!(
        sched.queue_state(ep),
        Err(UhciError::NotFound { .. })
    ));
    assert_eq!(sched.pending_releases(), 1);
    // Unlinked, but the controller may still hold it.
    assert_eq!(sched.pool_stats().qhs_in_use(), baseline);

    walker.run(&sched, 2);
    sched.poll_completions();
    assert_eq!(sched.pending_releases(), 0);
    assert_eq!(sched.pool_stats().qhs_in_use(), baseline - 1);

    let reopened = sched.open_endpoint(desc).unwrap();
    assert_ne!(reopened, ep);
    assert_eq!(sched.endpoint_queue_heads(reopened).unwrap(), qh);
    assert_eq!(stale_links(&sched), 0);
    sched.verify_schedule().unwrap();
}

#[test]
fn test_close_interrupt_endpoint_returns_bandwidth() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::interrupt(
            3,
            1,
            Direction::In,
            UsbSpeed::Low,
            8,
            8,
        ))
        .unwrap();
    sched.submit(TransferRequest::interrupt(ep, buffer(8))).unwrap();
    assert!(matches!(sched.close_endpoint(ep), Err(UhciError::Busy { .. })));

    let mut walker = FrameWalker::new();
    run_until_idle(&sched, &mut walker, 16);
    sched.close_endpoint(ep).unwrap();
    assert!((0..128).all(|slot| sched.slot_bandwidth(slot) == 0));

    walker.run(&sched, 2);
    sched.poll_completions();
    assert_eq!(sched.pending_releases(), 0);
    assert_eq!(stale_links(&sched), 0);
    sched.verify_schedule().unwrap();
}

// -- Controller lifecycle ---------------------------------------------------

#[test]
fn test_host_system_error_fails_scheduler() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let id = sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();

    sched.with_schedule(|hw, _| hw.host_system_error());
    assert!(matches!(
        sched.handle_interrupt(),
        Err(UhciError::HardwareError { .. })
    ));
    assert_eq!(sched.controller_state(), ControllerState::Failed);
    assert!(matches!(
        sched.submit(TransferRequest::bulk(ep, buffer(64))),
        Err(UhciError::InvalidState { .. })
    ));

    let done = sched.shutdown();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].status, CompletionStatus::Cancelled);
    assert_eq!(sched.controller_state(), ControllerState::Failed);
}

#[test]
fn test_interrupt_reports_completions() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();

    let summary = sched.handle_interrupt().unwrap();
    assert!(!summary.completions_pending);

    let trace = FrameWalker::new().step(&sched);
    assert!(trace.interrupt);
    let summary = sched.handle_interrupt().unwrap();
    assert!(summary.completions_pending);
    sched.with_schedule(|hw, _| {
        assert!(hw.acknowledged().contains(veridian_uhci::registers::UsbStatus::USBINT));
    });
    assert_eq!(sched.poll_completions().len(), 1);
}

#[test]
fn test_shutdown_cancels_in_flight_work() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();

    let done = sched.shutdown();
    assert_eq!(done.len(), 2);
    assert!(done.iter().all(|c| c.status == CompletionStatus::Cancelled));
    assert_eq!(sched.controller_state(), ControllerState::Halted);
    assert!(sched.active_transfers().is_empty());
    assert!(matches!(
        sched.open_endpoint(EndpointDescriptor::bulk(3, 1, Direction::In, 64)),
        Err(UhciError::InvalidState { .. })
    ));
}

#[test]
fn test_shutdown_holds_descriptors_while_controller_runs() {
    let sched = scheduler_on(SimulatedController::new().with_stuck_run());
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let baseline = sched.pool_stats().tds_in_use();
    let mut walker = FrameWalker::new();
    walker.script(2, 1, TdOutcome::Nak);
    let id = sched.submit(TransferRequest::bulk(ep, buffer(192))).unwrap();
    walker.step(&sched);
    let tds = sched.transfer_descriptors(id).unwrap();

    assert!(sched.shutdown().is_empty());
    assert_eq!(sched.controller_state(), ControllerState::Failed);
    assert_eq!(sched.active_transfers(), vec![id]);
    sched.with_schedule(|hw, view| {
        assert!(hw.is_running());
        for &phys in &tds {
            let td = view.td(phys).expect("TD returned to pool while controller runs");
            assert!(!td.is_active());
        }
    });

    // Reclaimed once the frame counter shows the controller moved on.
    walker.run(&sched, 2);
    let done = sched.poll_completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].status, CompletionStatus::Cancelled);
    assert_eq!(sched.pool_stats().tds_in_use(), baseline);
}

#[test]
fn test_callback_runs_exactly_once() {
    let sched = scheduler();
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    sched
        .submit(TransferRequest::bulk(ep, buffer(64)).with_callback(move |completion| {
            assert_eq!(completion.status, CompletionStatus::Success);
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let mut walker = FrameWalker::new();
    run_until_idle(&sched, &mut walker, 4);
    sched.poll_completions();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reclamation_can_be_disabled() {
    let sched = scheduler_with(SchedulerConfig::default().with_reclamation(None));
    let ep = sched
        .open_endpoint(EndpointDescriptor::bulk(2, 1, Direction::In, 64))
        .unwrap();
    sched.submit(TransferRequest::bulk(ep, buffer(64))).unwrap();
    assert_eq!(sched.reclamation_users(), 0);

    let mut walker = FrameWalker::new();
    let done = run_until_idle(&sched, &mut walker, 4);
    assert_eq!(done.len(), 1);
    sched.verify_schedule().unwrap();
}
