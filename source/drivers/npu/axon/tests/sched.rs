// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for submission scheduling and completion.
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 15 integration tests
//!
//! TEST_SCOPE:
//!   - Priority, round-robin and FIFO pick order on the register log
//!   - Low-latency staging, promotion and backpressure
//!   - Watchdog and fault rollback, retry limits, external attribution
//!   - Multi-part passes, hash checking, fences, stale and coalesced kicks
//!   - Session close and context teardown with work in flight
//!
//! TEST_SCENARIOS:
//!   - priority_order_beats_queue_order(): high level preempts FIFO
//!   - sessions_at_one_level_round_robin(): fair alternation
//!   - low_latency_stages_one_submission_ahead(): stage, promote, Busy
//!   - cancel_stops_hardware_and_restarts_survivor(): stop plus requeue
//!   - watchdog_rolls_back_then_fails_repeat_offenders(): retry then Timeout
//!   - external_faults_spare_the_running_pass(): no rollback, stats only
//!   - translation_fault_retries_once_then_fails(): retry limit, leftovers
//!   - multi_part_passes_rearm_the_watchdog(): budget and kick per pass
//!   - hash_check_reports_mismatch(): notes only on disagreement
//!   - submissions_wait_for_input_producers(): fill gating
//!   - default_budgets_and_stale_kicks(): policy values, stale counting
//!   - coalesced_kicks_retire_in_one_service(): counter delta across wrap
//!   - fences_fire_when_outputs_come_back(): completion hand-back
//!   - closed_sessions_reject_everything(): cancel-on-close semantics
//!   - context_teardown_stops_running_work(): stop, reclaim, invalidate
//!
//! DEPENDENCIES:
//!   - common: register/memory/clock stubs around the driver
//!   - npu_axon::Device: driver under test
//!
//! ADR: docs/architecture/07-npu-axon.md

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use npu_axon::mm::heap::BufferAttrs;
use npu_axon::mmu::{MapFlags, MmuConfig};
use npu_axon::pdump::VecSink;
use npu_axon::regs::{
    slot_lo, IrqBits, CTRL_START, CTRL_STOP, REG_CORE_CTRL, REG_KICK, REG_KICK_COUNT,
    REG_WDT_BUDGET_LO,
};
use npu_axon::sched::{
    BufferRef, CommandKind, CompletionNote, CompletionStatus, SubmitFlags, SubmitRequest,
};
use npu_axon::types::{
    BufferId, CtxHandle, DeviceVirt, HeapHandle, MmuHandle, Priority, SessionId, SubmitId,
};
use npu_axon::{Device, DeviceConfig, Error, Fault, FaultEvent};

/// One device with a carveout-backed context and an open session.
struct Bench {
    rig: Rig,
    ctx: CtxHandle,
    mmu: MmuHandle,
    heap: HeapHandle,
    session: SessionId,
}

fn bench() -> Bench {
    bench_with(DeviceConfig::default())
}

fn low_latency() -> DeviceConfig {
    DeviceConfig {
        low_latency: true,
        ..DeviceConfig::default()
    }
}

fn bench_with(config: DeviceConfig) -> Bench {
    let rig = rig_with(config);
    let heap = carveout_heap(&rig.dev, 64);
    let ctx = rig.dev.create_context().unwrap();
    let mmu = rig
        .dev
        .create_mmu_context(ctx, MmuConfig::default(), heap, None, None)
        .unwrap();
    let session = rig.dev.open_session(ctx, mmu).unwrap();
    Bench {
        rig,
        ctx,
        mmu,
        heap,
        session,
    }
}

impl Bench {
    /// Page buffer mapped at `virt` whose producer has not written yet.
    fn empty_input(&self, virt: u64) -> BufferId {
        let buf = self
            .rig
            .dev
            .allocate(self.ctx, self.heap, 4096, BufferAttrs::empty())
            .unwrap();
        self.rig
            .dev
            .mmu_map(self.ctx, self.mmu, buf, DeviceVirt::new(virt), MapFlags::empty())
            .unwrap();
        buf
    }

    /// Page buffer mapped at `virt`, ready for dispatch.
    fn input(&self, virt: u64) -> BufferId {
        let buf = self.empty_input(virt);
        self.rig.dev.mark_filled(self.ctx, buf).unwrap();
        buf
    }

    fn submit(&self, id: u32, priority: Priority, buf: BufferId) {
        self.rig.dev.submit(self.session, req(id, priority, buf)).unwrap();
    }

    fn drain(&self) -> Vec<CompletionNote> {
        self.rig.dev.drain_completions(self.session).unwrap()
    }
}

/// Single-part notify-on-done submission reading `buf` through slot 0.
fn req(id: u32, priority: Priority, buf: BufferId) -> SubmitRequest {
    SubmitRequest {
        id: SubmitId::from_raw(id),
        kind: CommandKind::Inference,
        priority,
        flags: SubmitFlags::NOTIFY_DONE,
        parts: 1,
        cycle_estimate: 0,
        expected_hash: 0,
        inputs: vec![BufferRef {
            buffer: buf,
            offset: 0,
            len: 4096,
            slot: 0,
        }],
        outputs: Vec::new(),
    }
}

fn done(id: u32, cycles: u64, elapsed_us: u64) -> CompletionNote {
    CompletionNote {
        id: SubmitId::from_raw(id),
        status: CompletionStatus::Done,
        cycles,
        elapsed_us,
    }
}

#[test]
fn priority_order_beats_queue_order() {
    let b = bench();
    // Occupy the hardware so the rest stays queued.
    b.submit(1, Priority::Normal, b.input(0x1000_0000));
    b.submit(0x0a, Priority::Low, b.input(0x2000_0000));
    b.submit(0x0b, Priority::Low, b.input(0x3000_0000));
    b.submit(0x0c, Priority::High, b.input(0x4000_0000));

    b.rig.bus.take_writes();
    for cycles in [10, 20, 30, 40] {
        b.rig.complete_and_service(cycles, 0);
    }

    // The high submission jumps both earlier low ones; those keep FIFO.
    assert_eq!(
        b.rig.bus.writes_to(slot_lo(0)),
        vec![0x4000_0000, 0x2000_0000, 0x3000_0000]
    );
    assert_eq!(
        b.drain(),
        vec![done(1, 10, 0), done(0x0c, 20, 0), done(0x0a, 30, 0), done(0x0b, 40, 0)]
    );
}

#[test]
fn sessions_at_one_level_round_robin() {
    let b = bench();
    let second = b.rig.dev.open_session(b.ctx, b.mmu).unwrap();
    b.submit(1, Priority::Normal, b.input(0x1000_0000));
    b.submit(2, Priority::Normal, b.input(0x2000_0000));
    b.submit(3, Priority::Normal, b.input(0x3000_0000));
    for (id, virt) in [(4u32, 0x4000_0000u64), (5, 0x5000_0000)] {
        b.rig
            .dev
            .submit(second, req(id, Priority::Normal, b.input(virt)))
            .unwrap();
    }

    b.rig.bus.take_writes();
    for cycles in [10, 20, 30, 40, 50] {
        b.rig.complete_and_service(cycles, 0);
    }

    // Sessions alternate; each keeps its own FIFO order.
    assert_eq!(
        b.rig.bus.writes_to(slot_lo(0)),
        vec![0x2000_0000, 0x4000_0000, 0x3000_0000, 0x5000_0000]
    );
    assert_eq!(b.drain(), vec![done(1, 10, 0), done(2, 20, 0), done(3, 40, 0)]);
    assert_eq!(
        b.rig.dev.drain_completions(second).unwrap(),
        vec![done(4, 30, 0), done(5, 50, 0)]
    );
}

#[test]
fn low_latency_stages_one_submission_ahead() {
    let b = bench_with(low_latency());
    let x = b.input(0x2000_0000);
    let y = b.input(0x3000_0000);
    let z = b.input(0x4000_0000);

    b.rig.bus.take_writes();
    b.submit(0x11, Priority::Normal, x);
    // The second lands in the ahead slot unprogrammed; the third has
    // nowhere to go.
    b.submit(0x22, Priority::Normal, y);
    assert_eq!(
        b.rig.dev.submit(b.session, req(0x33, Priority::Normal, z)).unwrap_err(),
        Error::Busy
    );
    assert_eq!(b.rig.bus.writes_to(REG_KICK).len(), 1);

    // Completion promotes the staged submission and kicks it; its clock
    // starts at promotion, not at submit.
    b.rig.clock.advance(50);
    b.rig.complete_and_service(100, 0);
    assert_eq!(b.rig.bus.writes_to(REG_KICK).len(), 2);
    b.rig.dev.submit(b.session, req(0x33, Priority::Normal, z)).unwrap();

    b.rig.clock.advance(7);
    b.rig.complete_and_service(200, 0);
    b.rig.complete_and_service(300, 0);

    assert_eq!(
        b.rig.bus.writes_to(slot_lo(0)),
        vec![0x2000_0000, 0x3000_0000, 0x4000_0000]
    );
    assert_eq!(b.rig.bus.writes_to(REG_KICK).len(), 3);
    assert_eq!(
        b.drain(),
        vec![done(0x11, 100, 50), done(0x22, 200, 7), done(0x33, 300, 0)]
    );
}

#[test]
fn cancel_stops_hardware_and_restarts_survivor() {
    let b = bench_with(low_latency());
    let x = b.input(0x2000_0000);
    let y = b.input(0x3000_0000);
    b.submit(0x10, Priority::Normal, x);
    b.submit(0x20, Priority::Normal, y);

    b.rig.bus.take_writes();
    let matched = b.rig.dev.cancel(b.session, 0x10, 0xffff_ffff, true).unwrap();
    assert_eq!(matched, 1);

    // The core was stopped, then the staged survivor took its place.
    assert_eq!(b.rig.bus.writes_to(REG_CORE_CTRL), vec![CTRL_STOP, CTRL_START]);
    assert_eq!(b.rig.bus.writes_to(slot_lo(0)), vec![0x3000_0000]);

    b.rig.complete_and_service(75, 0);
    // The canceled submission gets no note of its own, only the ack.
    assert_eq!(
        b.drain(),
        vec![
            CompletionNote {
                id: SubmitId::from_raw(0x10),
                status: CompletionStatus::CancelAck { matched: 1 },
                cycles: 0,
                elapsed_us: 0,
            },
            done(0x20, 75, 0),
        ]
    );
    // Nothing holds the canceled buffer anymore.
    b.rig.dev.free(b.ctx, x).unwrap();
}

#[test]
fn watchdog_rolls_back_then_fails_repeat_offenders() {
    let b = bench_with(low_latency());
    let events: Arc<Mutex<Vec<FaultEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    b.rig
        .dev
        .set_fault_observer(Some(Box::new(move |event| sink.lock().unwrap().push(event))));

    // A finished baseline pins the counters the rollback must not touch.
    b.submit(9, Priority::Normal, b.input(0x1000_0000));
    b.rig.complete_and_service(777, 0);
    b.drain();

    b.submit(1, Priority::Normal, b.input(0x2000_0000));
    b.submit(2, Priority::Normal, b.input(0x3000_0000));
    b.rig.bus.take_writes();
    b.rig.fault_and_service(IrqBits::WATCHDOG, 0, false);

    // Both in-flight submissions went back to the queue and the former
    // running one was restarted first; the staged one stays unprogrammed.
    assert_eq!(b.rig.bus.writes_to(REG_CORE_CTRL), vec![CTRL_STOP, CTRL_START]);
    assert_eq!(b.rig.bus.writes_to(slot_lo(0)), vec![0x2000_0000]);
    let stats = b.rig.dev.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cycles, 777);
    assert_eq!(stats.watchdog_expiries, 1);
    assert_eq!(stats.rollbacks, 2);
    assert_eq!(stats.faults, 0);
    assert!(b.drain().is_empty());

    // Second expiry: both already used their retry, both fail. The staged
    // submission reports first.
    b.rig.fault_and_service(IrqBits::WATCHDOG, 0, false);
    assert_eq!(b.rig.dev.stats().watchdog_expiries, 2);
    assert_eq!(b.rig.dev.stats().rollbacks, 2);
    let notes = b.drain();
    assert_eq!(
        notes.iter().map(|n| (n.id.as_raw(), n.status)).collect::<Vec<_>>(),
        vec![
            (2, CompletionStatus::Timeout),
            (1, CompletionStatus::Timeout)
        ]
    );
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[FaultEvent::Watchdog, FaultEvent::Watchdog]
    );
}

#[test]
fn external_faults_spare_the_running_pass() {
    let b = bench();
    let events: Arc<Mutex<Vec<FaultEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    b.rig
        .dev
        .set_fault_observer(Some(Box::new(move |event| sink.lock().unwrap().push(event))));
    b.submit(1, Priority::Normal, b.input(0x2000_0000));

    b.rig.bus.take_writes();
    b.rig.fault_and_service(IrqBits::MMU_FAULT, 0xdead_b000, true);

    // Attributed to another bus user: counted and reported, nothing
    // stopped or rolled back.
    assert!(b.rig.bus.writes_to(REG_CORE_CTRL).is_empty());
    let stats = b.rig.dev.stats();
    assert_eq!(stats.faults, 1);
    assert_eq!(stats.rollbacks, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[FaultEvent::Hardware {
            fault: Fault::Translation,
            address: 0xdead_b000,
            external: true,
        }]
    );

    // The pass in hardware still completes normally.
    b.rig.complete_and_service(55, 0);
    assert_eq!(b.drain(), vec![done(1, 55, 0)]);
    assert_eq!(b.rig.dev.stats().completed, 1);
}

#[test]
fn translation_fault_retries_once_then_fails() {
    let b = bench();
    b.submit(1, Priority::Normal, b.input(0x2000_0000));

    b.rig.bus.take_writes();
    b.rig.fault_and_service(IrqBits::MMU_FAULT, 0xbad0_0000, false);
    b.rig.fault_and_service(IrqBits::MMU_FAULT, 0xbad0_0000, false);

    // Stopped and restarted once, then stopped for good.
    assert_eq!(
        b.rig.bus.writes_to(REG_CORE_CTRL),
        vec![CTRL_STOP, CTRL_START, CTRL_STOP]
    );
    let stats = b.rig.dev.stats();
    assert_eq!(stats.faults, 2);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.completed, 0);
    let notes = b.drain();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].id, SubmitId::from_raw(1));
    assert_eq!(notes[0].status, CompletionStatus::Fault(Fault::Translation));

    // A fault with nothing in flight is a logged leftover, not an event.
    b.rig.fault_and_service(IrqBits::BUS_ERROR, 0, false);
    assert_eq!(b.rig.dev.stats().faults, 2);
    assert!(b.drain().is_empty());
}

#[test]
fn multi_part_passes_rearm_the_watchdog() {
    let b = bench();
    let buf = b.input(0x2000_0000);
    let mut request = req(0x42, Priority::Normal, buf);
    request.parts = 3;
    request.flags |= SubmitFlags::CYCLE_BUDGET;
    request.cycle_estimate = 1000;

    b.rig.bus.take_writes();
    b.rig.dev.submit(b.session, request).unwrap();
    for cycles in [10, 20, 30] {
        b.rig.complete_and_service(cycles, 0);
    }

    // One kick and one armed budget per pass; the estimate plus the 25%
    // margin is reused unchanged on every re-arm.
    assert_eq!(b.rig.bus.writes_to(REG_KICK), vec![1, 1, 1]);
    assert_eq!(b.rig.bus.writes_to(REG_WDT_BUDGET_LO), vec![1250, 1250, 1250]);
    assert_eq!(b.drain(), vec![done(0x42, 30, 0)]);
    let stats = b.rig.dev.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cycles, 30);
}

#[test]
fn hash_check_reports_mismatch() {
    let b = bench();
    let mut bad = req(0x77, Priority::Normal, b.input(0x2000_0000));
    bad.flags = SubmitFlags::CHECK_HASH;
    bad.expected_hash = 0xabcd;
    b.rig.dev.submit(b.session, bad).unwrap();
    b.rig.complete_and_service(5, 0x1234);

    let mut good = req(0x78, Priority::Normal, b.input(0x3000_0000));
    good.flags = SubmitFlags::CHECK_HASH;
    good.expected_hash = 0x5555;
    b.rig.dev.submit(b.session, good).unwrap();
    b.rig.complete_and_service(6, 0x5555);

    // Disagreement always surfaces; a silent match stays silent.
    assert_eq!(
        b.drain(),
        vec![CompletionNote {
            id: SubmitId::from_raw(0x77),
            status: CompletionStatus::HashMismatch,
            cycles: 5,
            elapsed_us: 0,
        }]
    );
    assert_eq!(b.rig.dev.stats().completed, 2);
}

#[test]
fn submissions_wait_for_input_producers() {
    let b = bench();
    let buf = b.empty_input(0x2000_0000);
    b.rig.bus.take_writes();
    b.submit(1, Priority::Normal, buf);

    // Queued but not started: the input has no producer yet.
    assert!(b.rig.bus.writes_to(REG_KICK).is_empty());

    b.rig.dev.mark_filled(b.ctx, buf).unwrap();
    assert_eq!(b.rig.bus.writes_to(REG_KICK), vec![1]);
    assert_eq!(b.rig.bus.writes_to(slot_lo(0)), vec![0x2000_0000]);

    b.rig.complete_and_service(10, 0);
    assert_eq!(b.drain(), vec![done(1, 10, 0)]);
}

#[test]
fn default_budgets_and_stale_kicks() {
    let b = bench();
    b.rig.bus.take_writes();
    b.submit(1, Priority::Normal, b.input(0x2000_0000));
    b.rig.complete_and_service(10, 0);

    // A kick with nothing in hardware is counted, never acted on.
    b.rig.complete_and_service(11, 0);
    assert_eq!(b.rig.dev.stats().stale_kicks, 1);

    let mut request = req(2, Priority::Normal, b.input(0x3000_0000));
    request.parts = 2;
    b.rig.dev.submit(b.session, request).unwrap();
    b.rig.complete_and_service(12, 0);
    b.rig.complete_and_service(13, 0);

    // Single-part and per-pass policy defaults, both with the margin.
    assert_eq!(
        b.rig.bus.writes_to(REG_WDT_BUDGET_LO),
        vec![12_500_000, 1_250_000, 1_250_000]
    );
    assert_eq!(b.drain(), vec![done(1, 10, 0), done(2, 13, 0)]);
}

#[test]
fn coalesced_kicks_retire_in_one_service() {
    // Bring the device up with the kick counter near wrap.
    let bus = TestBus::new();
    bus.set(REG_KICK_COUNT, 0xfe);
    let mem = TestMemory::new();
    let clock = TestClock::new();
    let dev: TestDevice =
        Device::new(bus.clone(), mem.clone(), clock.clone(), VecSink::new(), low_latency())
            .unwrap();
    let heap = carveout_heap(&dev, 64);
    let ctx = dev.create_context().unwrap();
    let mmu = dev
        .create_mmu_context(ctx, MmuConfig::default(), heap, None, None)
        .unwrap();
    let session = dev.open_session(ctx, mmu).unwrap();
    for (id, virt) in [(0xaau32, 0x2000_0000u64), (0xbb, 0x3000_0000)] {
        let buf = dev.allocate(ctx, heap, 4096, BufferAttrs::empty()).unwrap();
        dev.mmu_map(ctx, mmu, buf, DeviceVirt::new(virt), MapFlags::empty())
            .unwrap();
        dev.mark_filled(ctx, buf).unwrap();
        dev.submit(session, req(id, Priority::Normal, buf)).unwrap();
    }

    // Two passes land before the interrupt is serviced; the counter wraps
    // through 0xff -> 0x00 on the way.
    bus.take_writes();
    bus.complete_pass(100, 0);
    bus.complete_pass(300, 0);
    assert!(dev.irq_fast());
    dev.process_completions();

    assert_eq!(
        dev.drain_completions(session).unwrap(),
        vec![done(0xaa, 300, 0), done(0xbb, 300, 0)]
    );
    // The promoted second submission got its own kick during the drain.
    assert_eq!(bus.writes_to(REG_KICK), vec![1]);
    let stats = dev.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.stale_kicks, 0);
    assert!(!dev.irq_fast());
}

#[test]
fn fences_fire_when_outputs_come_back() {
    let b = bench();
    let input = b.input(0x2000_0000);
    let output = b.empty_input(0x3000_0000);
    let fired = Arc::new(AtomicBool::new(false));
    b.rig
        .dev
        .attach_fence(b.ctx, output, Box::new(TestFence(fired.clone())))
        .unwrap();

    let mut request = req(1, Priority::Normal, input);
    request.outputs = vec![BufferRef {
        buffer: output,
        offset: 0,
        len: 4096,
        slot: 1,
    }];
    b.rig.bus.take_writes();
    b.rig.dev.submit(b.session, request).unwrap();
    assert_eq!(b.rig.bus.writes_to(slot_lo(1)), vec![0x3000_0000]);
    assert!(!fired.load(Ordering::SeqCst));

    b.rig.complete_and_service(10, 0);
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(b.drain(), vec![done(1, 10, 0)]);
}

#[test]
fn closed_sessions_reject_everything() {
    let b = bench();
    let x = b.input(0x2000_0000);
    let y = b.input(0x3000_0000);
    b.submit(1, Priority::Normal, x);
    b.submit(2, Priority::Normal, y);

    b.rig.bus.take_writes();
    b.rig.dev.close_session(b.session).unwrap();

    // Closing cancels the running submission and the queued one; with
    // nothing left there is no restart.
    assert_eq!(b.rig.bus.writes_to(REG_CORE_CTRL), vec![CTRL_STOP]);
    assert_eq!(
        b.rig.dev.submit(b.session, req(3, Priority::Normal, x)).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        b.rig.dev.drain_completions(b.session).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        b.rig.dev.cancel(b.session, 0, 0, false).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(b.rig.dev.stats().completed, 0);
}

#[test]
fn context_teardown_stops_running_work() {
    let b = bench();
    let unified = unified_heap(&b.rig.dev);
    let buf = b
        .rig
        .dev
        .allocate(b.ctx, unified, 8192, BufferAttrs::empty())
        .unwrap();
    b.rig
        .dev
        .mmu_map(b.ctx, b.mmu, buf, DeviceVirt::new(0x2000_0000), MapFlags::empty())
        .unwrap();
    b.rig.dev.mark_filled(b.ctx, buf).unwrap();
    b.rig.dev.submit(b.session, req(1, Priority::Normal, buf)).unwrap();

    b.rig.bus.take_writes();
    b.rig.dev.destroy_context(b.ctx).unwrap();

    // The core stopped, the session vanished, and every byte the context
    // held came back: granules, node mappings, the lot.
    assert!(b.rig.bus.writes_to(REG_CORE_CTRL).contains(&CTRL_STOP));
    assert_eq!(b.rig.mem.outstanding_granules(), 0);
    assert_eq!(b.rig.mem.outstanding_kernel_maps(), 0);
    assert_eq!(b.rig.dev.usage(b.ctx).unwrap_err(), Error::InvalidArgument);
    assert_eq!(
        b.rig.dev.submit(b.session, req(2, Priority::Normal, buf)).unwrap_err(),
        Error::InvalidArgument
    );
}
