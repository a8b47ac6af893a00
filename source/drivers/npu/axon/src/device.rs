// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Device front-end.
//!
//! One [`Device`] owns the register window and the three ranked state locks
//! (memory outermost, then scheduler, then the interrupt latch; the trace
//! sink nests under all of them). Every public operation is a thin shell:
//! validate, take the locks in order, delegate to the subsystem, drop the
//! locks before anything that can call back out (fence signalling, the
//! fault observer).
//!
//! Dispatch is the one path that spans subsystems. Addresses are resolved
//! under the memory lock *before* the submission is installed, so the
//! scheduler never reaches back into memory state and the lock order stays
//! acyclic. The resolved plan travels with the submission; a staged
//! submission is programmed and kicked the moment the running slot frees.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axon_hal::{Bus, Clock, Fence, MemoryBackend, PhysSegment};

use crate::error::{Error, Fault, Result};
use crate::irq::IrqLatch;
use crate::mm::heap::{BufferAttrs, HeapConfig};
use crate::mm::{MemoryState, UsageSnapshot};
use crate::mmu::{EventCallback, MapFlags, MmuConfig};
use crate::pdump::TraceSink;
use crate::regs::{
    read64, slot_hi, slot_lo, IrqBits, AXON_IDENTITY, CTRL_RESET, CTRL_START, CTRL_STOP,
    FAULT_EXTERNAL, MMU_CTRL_BYPASS, MMU_CTRL_FLUSH, REG_CORE_CTRL, REG_CYCLES_HI, REG_CYCLES_LO,
    REG_FAULT_ADDR_HI, REG_FAULT_ADDR_LO, REG_FAULT_STATUS, REG_IDENTITY, REG_IRQ_MASK,
    REG_IRQ_STATUS, REG_KICK, REG_KICK_COUNT, REG_MMU_ROOT_HI, REG_MMU_ROOT_LO, REG_MMU_CTRL,
    REG_RESULT_HASH, REG_REVISION, REG_WDT_BUDGET_HI, REG_WDT_BUDGET_LO,
};
use crate::sched::{
    Acceptance, CompletionNote, CompletionStatus, DispatchPlan, HwSlot, KickOutcome,
    RollbackReason, SchedStats, SchedulerState, SubmitRequest, WatchdogPolicy,
};
use crate::sync::{LockLedger, OrderedMutex, RANK_IRQ, RANK_MM, RANK_SCHED, RANK_TRACE};
use crate::types::{
    BufferId, CtxHandle, DeviceVirt, HeapHandle, MappingId, MmuHandle, SessionId,
};

/// Construction-time knobs; everything else is per-heap or per-context.
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    /// Host MMU page size; granule for heaps that allocate host memory.
    pub host_page_size: usize,
    /// Cap the queue at two in-flight submissions and stage the second
    /// ahead, trading throughput under load for kick latency.
    pub low_latency: bool,
    pub watchdog: WatchdogPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host_page_size: 4096,
            low_latency: false,
            watchdog: WatchdogPolicy::default(),
        }
    }
}

/// A hardware failure as reported to the registered observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultEvent {
    /// The armed cycle budget ran out.
    Watchdog,
    /// Translation or interconnect failure at `address`. `external` marks
    /// faults the hardware attributes to another user of the shared bus;
    /// those do not disturb the running submission.
    Hardware {
        fault: Fault,
        address: u64,
        external: bool,
    },
}

pub type FaultObserver = Box<dyn FnMut(FaultEvent) + Send>;

pub struct Device<B, M, C, S> {
    bus: B,
    clock: C,
    mm: OrderedMutex<MemoryState<M>>,
    sched: OrderedMutex<SchedulerState>,
    irq: OrderedMutex<IrqLatch>,
    trace: OrderedMutex<S>,
    // Unranked: only ever taken with no ordered lock held.
    observer: spin::Mutex<Option<FaultObserver>>,
}

impl<B, M, C, S> Device<B, M, C, S>
where
    B: Bus,
    M: MemoryBackend,
    C: Clock,
    S: TraceSink,
{
    /// Probes, resets and unmasks the device behind `bus`. Fails without
    /// touching anything further when the identity register does not read
    /// back as Axon silicon.
    pub fn new(bus: B, backend: M, clock: C, mut trace: S, config: DeviceConfig) -> Result<Self> {
        let identity = bus.read(REG_IDENTITY);
        trace.append(format_args!("RDW {:#05x} {:#010x}", REG_IDENTITY, identity));
        if identity != AXON_IDENTITY {
            log::error!(target: "axon", "identity {:#010x}, want {:#010x}", identity, AXON_IDENTITY);
            return Err(Error::InvalidArgument);
        }
        let revision = bus.read(REG_REVISION);
        trace.append(format_args!("WRW {:#05x} {:#010x}", REG_CORE_CTRL, CTRL_RESET));
        bus.write(REG_CORE_CTRL, CTRL_RESET);
        let mask = IrqBits::all().bits();
        trace.append(format_args!("WRW {:#05x} {:#010x}", REG_IRQ_MASK, mask));
        bus.write(REG_IRQ_MASK, mask);
        let kick_count = bus.read(REG_KICK_COUNT) as u8;
        let memory = MemoryState::new(backend, config.host_page_size)?;
        let ledger = Arc::new(LockLedger::new());
        log::info!(target: "axon", "device up, revision {:#x}", revision);
        Ok(Self {
            bus,
            clock,
            mm: OrderedMutex::new("mm", RANK_MM, ledger.clone(), memory),
            sched: OrderedMutex::new(
                "sched",
                RANK_SCHED,
                ledger.clone(),
                SchedulerState::new(config.low_latency, config.watchdog),
            ),
            irq: OrderedMutex::new("irq", RANK_IRQ, ledger.clone(), IrqLatch::new(kick_count)),
            trace: OrderedMutex::new("trace", RANK_TRACE, ledger, trace),
            observer: spin::Mutex::new(None),
        })
    }

    /// Stops the core, masks interrupts and force-destroys every surviving
    /// context. Anything still mapped or queued is torn down with
    /// diagnostics, never leaked.
    pub fn shutdown(&self) {
        {
            let mut trace = self.trace.lock();
            self.wrw(&mut trace, REG_CORE_CTRL, CTRL_STOP);
            self.wrw(&mut trace, REG_IRQ_MASK, 0);
        }
        let contexts = { self.mm.lock().contexts.handles() };
        for ctx in contexts {
            if let Err(err) = self.destroy_context(ctx) {
                log::error!(target: "axon", "shutdown: ctx {} teardown failed: {}", ctx, err);
            }
        }
        log::info!(target: "axon", "device down");
    }

    // ---- heaps ----

    pub fn create_heap(&self, config: HeapConfig) -> Result<HeapHandle> {
        self.mm.lock().register_heap(config)
    }

    /// Refused with `Busy` while any context still holds memory from it.
    pub fn destroy_heap(&self, heap: HeapHandle) -> Result<()> {
        self.mm.lock().unregister_heap(heap)
    }

    /// Rebases a relocatable carveout; refused while the heap has users.
    pub fn set_heap_offset(&self, heap: HeapHandle, offset: u64) -> Result<()> {
        self.mm.lock().set_heap_offset(heap, offset)
    }

    // ---- contexts and buffers ----

    pub fn create_context(&self) -> Result<CtxHandle> {
        self.mm.lock().create_context()
    }

    /// Force-teardown: sessions are cancelled and closed first, then the
    /// context's translation state and buffers go.
    pub fn destroy_context(&self, ctx: CtxHandle) -> Result<()> {
        let sessions = { self.sched.lock().sessions_of_ctx(ctx) };
        for session in sessions {
            // Mask 0 matches every submission id.
            if let Err(err) = self.cancel(session, 0, 0, false) {
                log::warn!(target: "axon", "ctx {}: cancel on session {} failed: {}", ctx, session, err);
            }
            let mut sched = self.sched.lock();
            if let Err(err) = sched.remove_session(session) {
                log::error!(target: "axon", "ctx {}: session {} not removable: {}", ctx, session, err);
            }
        }
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.destroy_context(ctx, &mut *trace)
    }

    pub fn allocate(
        &self,
        ctx: CtxHandle,
        heap: HeapHandle,
        size: usize,
        attrs: BufferAttrs,
    ) -> Result<BufferId> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.allocate(ctx, heap, size, attrs, &mut *trace)
    }

    /// Wraps externally owned memory named by `token` in a buffer.
    pub fn import(
        &self,
        ctx: CtxHandle,
        heap: HeapHandle,
        size: usize,
        attrs: BufferAttrs,
        token: u64,
    ) -> Result<BufferId> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.import(ctx, heap, size, attrs, token, &mut *trace)
    }

    /// Hands the buffer's backing memory out under a new token.
    pub fn export(&self, ctx: CtxHandle, buf: BufferId) -> Result<u64> {
        self.mm.lock().export(ctx, buf)
    }

    pub fn free(&self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.free(ctx, buf, &mut *trace)
    }

    /// Maps the buffer into the kernel address space; idempotent.
    pub fn map_kernel(&self, ctx: CtxHandle, buf: BufferId) -> Result<usize> {
        self.mm.lock().map_kernel(ctx, buf)
    }

    pub fn unmap_kernel(&self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.mm.lock().unmap_kernel(ctx, buf)
    }

    /// Records a user-space window over the buffer. The platform drives the
    /// fault-side hooks below.
    pub fn map_user(&self, ctx: CtxHandle, buf: BufferId, base: usize, len: usize) -> Result<()> {
        self.mm.lock().map_user(ctx, buf, base, len)
    }

    pub fn unmap_user(&self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.mm.lock().note_user_unmap(ctx, buf)
    }

    /// First-touch hook: invalidates host caches once per window so the
    /// client reads what the device last wrote.
    pub fn on_user_fault(&self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.mm.lock().note_user_fault(ctx, buf)
    }

    /// Teardown hook driven by the platform's VMA close path. Repeats are
    /// benign; the window may already be gone.
    pub fn on_user_unmap(&self, ctx: CtxHandle, buf: BufferId) {
        if let Err(err) = self.mm.lock().note_user_unmap(ctx, buf) {
            log::debug!(target: "axon", "ctx {}: user unmap without window: {}", ctx, err);
        }
    }

    pub fn sync_to_device(&self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.mm.lock().sync_to_device(ctx, buf)
    }

    pub fn sync_to_host(&self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.mm.lock().sync_to_host(ctx, buf)
    }

    /// Producer hand-off. Submissions waiting on this buffer become
    /// eligible, so dispatch runs again.
    pub fn mark_filled(&self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.mm.lock().mark_filled(ctx, buf)?;
        self.dispatch();
        Ok(())
    }

    /// Arms `fence` to fire when the device next hands `buf` back as an
    /// output.
    pub fn attach_fence(
        &self,
        ctx: CtxHandle,
        buf: BufferId,
        fence: Box<dyn Fence + Send>,
    ) -> Result<()> {
        self.mm.lock().attach_fence(ctx, buf, fence)
    }

    pub fn usage(&self, ctx: CtxHandle) -> Result<UsageSnapshot> {
        self.mm.lock().usage(ctx)
    }

    // ---- translation ----

    pub fn create_mmu_context(
        &self,
        ctx: CtxHandle,
        config: MmuConfig,
        node_heap: HeapHandle,
        window: Option<PhysSegment>,
        events: Option<EventCallback>,
    ) -> Result<MmuHandle> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.create_mmu_context(ctx, config, node_heap, window, events, &mut *trace)
    }

    pub fn destroy_mmu_context(&self, ctx: CtxHandle, handle: MmuHandle) -> Result<()> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.destroy_mmu_context(ctx, handle, &mut *trace)
    }

    pub fn mmu_map(
        &self,
        ctx: CtxHandle,
        handle: MmuHandle,
        buf: BufferId,
        virt: DeviceVirt,
        flags: MapFlags,
    ) -> Result<MappingId> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.map_device(ctx, handle, buf, virt, flags, &mut *trace)
    }

    pub fn mmu_unmap(&self, ctx: CtxHandle, handle: MmuHandle, buf: BufferId) -> Result<()> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.unmap_device(ctx, handle, buf, &mut *trace)
    }

    /// Physical base of the context's page catalogue, as programmed into
    /// the hardware root register. Bypass contexts have none.
    pub fn page_catalogue_address(&self, ctx: CtxHandle, handle: MmuHandle) -> Result<u64> {
        let (root, bypass) = self.mm.lock().catalogue_root(ctx, handle)?;
        if bypass {
            return Err(Error::InvalidArgument);
        }
        Ok(root)
    }

    /// Walks the live tree. `Ok(None)` is an unmapped address; a parity or
    /// encoding failure surfaces as [`Fault::CorruptEntry`].
    pub fn physical_for_virtual(
        &self,
        ctx: CtxHandle,
        handle: MmuHandle,
        virt: u64,
    ) -> Result<Option<u64>> {
        self.mm.lock().physical_for_virtual(ctx, handle, virt)
    }

    /// Redirects one mapped page into the on-chip cache window at
    /// `window_offset`, undoing any previous promotion in the context.
    pub fn promote_to_cache_window(
        &self,
        ctx: CtxHandle,
        handle: MmuHandle,
        buf: BufferId,
        page_index: usize,
        window_offset: u64,
    ) -> Result<()> {
        let mut mm = self.mm.lock();
        let mut trace = self.trace.lock();
        mm.promote_to_window(ctx, handle, buf, page_index, window_offset, &mut *trace)
    }

    // ---- execution ----

    /// Opens a session bound to one context and one of its translation
    /// contexts. Every submission on the session resolves against that pair.
    pub fn open_session(&self, ctx: CtxHandle, mmu: MmuHandle) -> Result<SessionId> {
        {
            let mm = self.mm.lock();
            let ctx_ref = mm.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            if !ctx_ref.mmu.contains(mmu) {
                return Err(Error::InvalidArgument);
            }
        }
        self.sched.lock().open_session(ctx, mmu)
    }

    /// Cancels everything the session still owns, then closes it.
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        self.cancel(session, 0, 0, false)?;
        self.sched.lock().remove_session(session)
    }

    /// Queues a submission and starts it immediately when the hardware has
    /// room. `Busy` reports saturation in low-latency mode.
    pub fn submit(&self, session: SessionId, req: SubmitRequest) -> Result<()> {
        let (ctx, _mmu) = { self.sched.lock().session_target(session)? };
        {
            let mm = self.mm.lock();
            for reference in req.inputs.iter().chain(req.outputs.iter()) {
                mm.validate_ref(ctx, reference.buffer, reference.offset, reference.len)?;
            }
        }
        self.sched.lock().enqueue(session, req)?;
        self.dispatch();
        Ok(())
    }

    /// Removes the session's submissions whose id matches `pattern` under
    /// `mask`. An in-hardware match stops the core before this returns; the
    /// canceled submission gets no completion note. Returns the match count.
    pub fn cancel(&self, session: SessionId, pattern: u32, mask: u32, respond: bool) -> Result<u32> {
        let outcome = {
            let mut sched = self.sched.lock();
            let outcome = sched.cancel(session, pattern, mask, respond)?;
            if outcome.stop_hardware {
                let mut trace = self.trace.lock();
                self.wrw(&mut trace, REG_CORE_CTRL, CTRL_STOP);
            }
            outcome
        };
        if outcome.stop_hardware {
            // The hardware is idle again; restart whatever survived.
            self.dispatch();
        }
        Ok(outcome.matched)
    }

    pub fn drain_completions(&self, session: SessionId) -> Result<Vec<CompletionNote>> {
        self.sched.lock().drain_completions(session)
    }

    pub fn set_fault_observer(&self, observer: Option<FaultObserver>) {
        *self.observer.lock() = observer;
    }

    pub fn stats(&self) -> SchedStats {
        self.sched.lock().stats()
    }

    // ---- interrupt path ----

    /// Fast stage, safe in interrupt context: read and clear the status,
    /// fold it into the latch, return whether the deferred stage has work.
    pub fn irq_fast(&self) -> bool {
        let mut latch = self.irq.lock();
        let mut trace = self.trace.lock();
        let status = IrqBits::from_bits_truncate(self.rdw(&mut trace, REG_IRQ_STATUS));
        if status.is_empty() {
            return false;
        }
        self.wrw(&mut trace, REG_IRQ_STATUS, status.bits());
        // Counter after status: a completion that set the bit has already
        // advanced it.
        let count = self.rdw(&mut trace, REG_KICK_COUNT) as u8;
        latch.record(status, count);
        true
    }

    /// Deferred stage: drains the latch, retires one submission per
    /// recorded kick, handles faults, then redispatches.
    pub fn process_completions(&self) {
        loop {
            let snapshot = { self.irq.lock().drain() };
            if snapshot.is_empty() {
                break;
            }
            for _ in 0..snapshot.kicks {
                self.finish_one_kick();
            }
            if !snapshot.faults.is_empty() {
                self.handle_fault(snapshot.faults);
            }
        }
        self.dispatch();
    }

    // ---- internals ----

    fn wrw(&self, trace: &mut S, offset: usize, value: u32) {
        trace.append(format_args!("WRW {:#05x} {:#010x}", offset, value));
        self.bus.write(offset, value);
    }

    fn rdw(&self, trace: &mut S, offset: usize) -> u32 {
        let value = self.bus.read(offset);
        trace.append(format_args!("RDW {:#05x} {:#010x}", offset, value));
        value
    }

    fn wrw64(&self, trace: &mut S, lo: usize, hi: usize, value: u64) {
        self.wrw(trace, lo, value as u32);
        self.wrw(trace, hi, (value >> 32) as u32);
    }

    /// Starts as much queued work as the hardware will take. Each round
    /// resolves addresses under the memory lock, then installs under the
    /// scheduler lock; the locks nest outermost-first throughout.
    fn dispatch(&self) {
        loop {
            let mm = self.mm.lock();
            let mut sched = self.sched.lock();
            let ahead = match sched.acceptance() {
                Acceptance::Idle => false,
                Acceptance::StageAhead => true,
                Acceptance::Full => return,
            };
            let mm_ref = &*mm;
            let Some(picked) = sched.pick(|ctx, _mmu, submission| {
                submission
                    .req
                    .inputs
                    .iter()
                    .all(|r| mm_ref.buffer_filled(ctx, r.buffer).unwrap_or(false))
            }) else {
                return;
            };
            let budget = sched.watchdog().budget_for(&picked.submission.req);
            match resolve_plan(&mm, picked.ctx, picked.mmu, &picked.submission.req, budget) {
                Ok(plan) => {
                    let slot = HwSlot {
                        session: picked.session,
                        ctx: picked.ctx,
                        mmu: picked.mmu,
                        submission: picked.submission,
                        plan,
                        started_us: self.clock.now_us(),
                    };
                    if !ahead {
                        self.program_and_start(&slot);
                    }
                    sched.install(slot, ahead);
                }
                Err(err) => {
                    log::warn!(
                        target: "sched",
                        "session {}: submission {} undispatchable: {}",
                        picked.session,
                        picked.submission.req.id,
                        err
                    );
                    sched.fail_submission(picked.session, picked.submission, rejection_status(err));
                }
            }
        }
    }

    /// Programs the resolved plan into the register file and kicks.
    fn program_and_start(&self, slot: &HwSlot) {
        let mut trace = self.trace.lock();
        if slot.plan.bypass {
            self.wrw(&mut trace, REG_MMU_CTRL, MMU_CTRL_BYPASS);
        } else {
            self.wrw64(&mut trace, REG_MMU_ROOT_LO, REG_MMU_ROOT_HI, slot.plan.root);
            self.wrw(&mut trace, REG_MMU_CTRL, MMU_CTRL_FLUSH);
        }
        for (index, addr) in &slot.plan.addrs {
            self.wrw64(
                &mut trace,
                slot_lo(*index as usize),
                slot_hi(*index as usize),
                *addr,
            );
        }
        self.wrw64(
            &mut trace,
            REG_WDT_BUDGET_LO,
            REG_WDT_BUDGET_HI,
            slot.plan.budget,
        );
        self.wrw(&mut trace, REG_CORE_CTRL, CTRL_START);
        self.wrw(&mut trace, REG_KICK, 1);
    }

    fn finish_one_kick(&self) {
        let now = self.clock.now_us();
        let mut fences: Vec<Box<dyn Fence + Send>> = Vec::new();
        {
            let mut mm = self.mm.lock();
            let mut sched = self.sched.lock();
            let (cycles, hash) = {
                let mut trace = self.trace.lock();
                let cycles = read64(&self.bus, REG_CYCLES_LO, REG_CYCLES_HI);
                trace.append(format_args!("RDW {:#05x} {:#010x}", REG_CYCLES_LO, cycles as u32));
                trace.append(format_args!(
                    "RDW {:#05x} {:#010x}",
                    REG_CYCLES_HI,
                    (cycles >> 32) as u32
                ));
                (cycles, self.rdw(&mut trace, REG_RESULT_HASH))
            };
            match sched.complete_kick(cycles, hash, now) {
                KickOutcome::Stale => {
                    log::debug!(target: "irq", "stale kick");
                }
                KickOutcome::Rearm { budget } => {
                    let mut trace = self.trace.lock();
                    self.wrw64(&mut trace, REG_WDT_BUDGET_LO, REG_WDT_BUDGET_HI, budget);
                    self.wrw(&mut trace, REG_KICK, 1);
                }
                KickOutcome::Finished {
                    session,
                    ctx,
                    outputs,
                    promoted,
                } => {
                    for output in outputs {
                        match mm.post_output(ctx, output.buffer) {
                            Ok(Some(fence)) => fences.push(fence),
                            Ok(None) => {}
                            Err(err) => {
                                // Freed while in flight; the memory itself
                                // was held by the heap until release.
                                log::warn!(
                                    target: "irq",
                                    "session {}: output {} gone at completion: {}",
                                    session,
                                    output.buffer,
                                    err
                                );
                            }
                        }
                    }
                    if promoted {
                        sched.mark_started(now);
                        if let Some(next) = sched.running.as_ref() {
                            self.program_and_start(next);
                        }
                    }
                }
            }
        }
        for fence in fences {
            fence.signal();
        }
    }

    fn handle_fault(&self, faults: IrqBits) {
        let (fault_status, address) = {
            let mut trace = self.trace.lock();
            let status = self.rdw(&mut trace, REG_FAULT_STATUS);
            let address = read64(&self.bus, REG_FAULT_ADDR_LO, REG_FAULT_ADDR_HI);
            trace.append(format_args!(
                "RDW {:#05x} {:#010x}",
                REG_FAULT_ADDR_LO,
                address as u32
            ));
            trace.append(format_args!(
                "RDW {:#05x} {:#010x}",
                REG_FAULT_ADDR_HI,
                (address >> 32) as u32
            ));
            (status, address)
        };
        let reason = if faults.contains(IrqBits::WATCHDOG) {
            RollbackReason::Watchdog
        } else if faults.contains(IrqBits::MMU_FAULT) {
            RollbackReason::Fault(Fault::Translation)
        } else {
            RollbackReason::Fault(Fault::BusError)
        };
        // The watchdog is the driver's own timer; the external bit only
        // qualifies translation and bus faults.
        let external =
            fault_status & FAULT_EXTERNAL != 0 && !faults.contains(IrqBits::WATCHDOG);
        if external {
            let fault = match reason {
                RollbackReason::Fault(fault) => fault,
                RollbackReason::Watchdog => Fault::BusError,
            };
            log::warn!(
                target: "irq",
                "external {:?} at {:#x}; running submission kept",
                fault,
                address
            );
            self.sched.lock().note_external_fault();
            self.notify_observer(FaultEvent::Hardware {
                fault,
                address,
                external: true,
            });
            return;
        }
        {
            let mut sched = self.sched.lock();
            if sched.running.is_none() && sched.staged.is_none() {
                // Leftover of a pass already rolled back or cancelled.
                log::debug!(target: "irq", "fault {:?} with no work in flight", faults);
                return;
            }
            let mut trace = self.trace.lock();
            self.wrw(&mut trace, REG_CORE_CTRL, CTRL_STOP);
            sched.rollback(reason);
        }
        let event = match reason {
            RollbackReason::Watchdog => FaultEvent::Watchdog,
            RollbackReason::Fault(fault) => FaultEvent::Hardware {
                fault,
                address,
                external: false,
            },
        };
        log::warn!(target: "irq", "{:?}; in-flight work rolled back", event);
        self.notify_observer(event);
    }

    fn notify_observer(&self, event: FaultEvent) {
        let mut slot = self.observer.lock();
        if let Some(observer) = slot.as_mut() {
            observer(event);
        }
    }

    /// Test access to the trace sink.
    pub fn with_trace<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut trace = self.trace.lock();
        f(&mut *trace)
    }
}

/// Resolves a submission's buffer references against its session's
/// translation context. Runs under the memory lock, before the scheduler
/// sees the plan.
fn resolve_plan<M: MemoryBackend>(
    mm: &MemoryState<M>,
    ctx: CtxHandle,
    mmu: MmuHandle,
    req: &SubmitRequest,
    budget: u64,
) -> Result<DispatchPlan> {
    let (root, bypass) = mm.catalogue_root(ctx, mmu)?;
    let mut addrs = Vec::with_capacity(req.inputs.len() + req.outputs.len());
    for reference in req.inputs.iter().chain(req.outputs.iter()) {
        let addr = mm.device_address(ctx, mmu, reference.buffer, reference.offset, reference.len)?;
        addrs.push((reference.slot, addr));
    }
    Ok(DispatchPlan {
        addrs,
        root,
        bypass,
        budget,
    })
}

fn rejection_status(err: Error) -> CompletionStatus {
    match err {
        Error::HardwareFault(fault) => CompletionStatus::Fault(fault),
        Error::Timeout => CompletionStatus::Timeout,
        _ => CompletionStatus::Rejected,
    }
}
