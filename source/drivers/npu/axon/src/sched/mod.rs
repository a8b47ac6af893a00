// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Command scheduler.
//!
//! CONTEXT: Sessions feed per-priority FIFO queues; the scheduler services
//! the highest level with eligible work and rotates between sessions of
//! that level. The hardware executes one submission at a time; in
//! low-latency mode a second one is staged with its addresses and budget
//! already resolved, so the kick after a completion costs no memory-side
//! work. Everything here is pure state: the device front-end owns the
//! registers, asks this module what to run next and reports what the
//! hardware said.
//!
//! A submission that faults or trips the watchdog is rolled back to the
//! front of its queue exactly once; the second failure finalizes it with
//! the failure status so a poisoned workload cannot wedge the queue
//! forever. Faults the hardware attributes to an unrelated bus user leave
//! driver state untouched.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{Error, Fault, Result};
use crate::regs::NUM_ADDR_SLOTS;
use crate::table::SlotTable;
use crate::types::{BufferId, CtxHandle, MmuHandle, Priority, SessionId, SubmitId, PRIORITY_COUNT};

use bitflags::bitflags;

/// Sessions per device.
pub(crate) const SESSION_LIMIT: usize = 64;
/// Queued submissions per session and priority level.
pub(crate) const QUEUE_DEPTH: usize = 64;
/// Times a submission is requeued after a fault before it is failed.
const MAX_REQUEUES: u8 = 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// Deliver a completion note on success.
        const NOTIFY_DONE = 1 << 0;
        /// Compare the hardware result signature against `expected_hash`.
        const CHECK_HASH = 1 << 1;
        /// Use `cycle_estimate` as the watchdog budget base.
        const CYCLE_BUDGET = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// A compute pass through the core.
    Inference,
    /// A device-driven memory move.
    Transfer,
}

/// One hardware address-slot binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRef {
    pub buffer: BufferId,
    pub offset: u64,
    pub len: u64,
    /// Hardware register slot, below [`NUM_ADDR_SLOTS`].
    pub slot: u8,
}

/// Client-supplied description of one submission.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub id: SubmitId,
    pub kind: CommandKind,
    pub priority: Priority,
    pub flags: SubmitFlags,
    /// Hardware passes this submission needs; at least one.
    pub parts: u8,
    pub cycle_estimate: u64,
    pub expected_hash: u32,
    pub inputs: Vec<BufferRef>,
    pub outputs: Vec<BufferRef>,
}

/// Watchdog budgets, explicit and overridable at device construction.
#[derive(Clone, Copy, Debug)]
pub struct WatchdogPolicy {
    /// Budget for one pass of a multi-part submission.
    pub default_pass_cycles: u64,
    /// Budget for a single-part submission.
    pub default_command_cycles: u64,
    /// Safety margin added on top of the base budget.
    pub margin_percent: u32,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            default_pass_cycles: 1_000_000,
            default_command_cycles: 10_000_000,
            margin_percent: 25,
        }
    }
}

impl WatchdogPolicy {
    pub fn budget_for(&self, req: &SubmitRequest) -> u64 {
        let base = if req.flags.contains(SubmitFlags::CYCLE_BUDGET) && req.cycle_estimate > 0 {
            req.cycle_estimate
        } else if req.parts > 1 {
            self.default_pass_cycles
        } else {
            self.default_command_cycles
        };
        base + base / 100 * self.margin_percent as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Done,
    /// Finished, but the result signature disagreed with the expectation.
    HashMismatch,
    Timeout,
    Fault(Fault),
    /// Never reached the hardware; its addresses could not be resolved at
    /// dispatch time (a referenced buffer was freed or unmapped meanwhile).
    Rejected,
    /// Acknowledges a cancel request; `matched` counts removed submissions.
    CancelAck { matched: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionNote {
    pub id: SubmitId,
    pub status: CompletionStatus,
    pub cycles: u64,
    pub elapsed_us: u64,
}

/// Rolling totals since device bring-up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedStats {
    pub completed: u64,
    pub cycles: u64,
    pub busy_us: u64,
    pub watchdog_expiries: u64,
    pub rollbacks: u64,
    pub faults: u64,
    pub stale_kicks: u64,
}

/// A queued submission plus its execution bookkeeping.
pub(crate) struct Submission {
    pub req: SubmitRequest,
    /// Parts already completed by the hardware.
    pub progress: u8,
    pub requeues: u8,
}

impl Submission {
    fn new(req: SubmitRequest) -> Self {
        Self {
            req,
            progress: 0,
            requeues: 0,
        }
    }

    fn remaining(&self) -> u32 {
        (self.req.parts - self.progress) as u32
    }
}

/// Everything the device needs to program a pass, resolved ahead of time.
pub(crate) struct DispatchPlan {
    pub addrs: Vec<(u8, u64)>,
    pub root: u64,
    pub bypass: bool,
    pub budget: u64,
}

/// One dequeued submission together with where its addresses resolve.
pub(crate) struct Picked {
    pub session: SessionId,
    pub ctx: CtxHandle,
    pub mmu: MmuHandle,
    pub submission: Submission,
}

/// A submission occupying a hardware slot. The context and MMU handles are
/// the ones the plan was resolved against; they stay valid here even if the
/// session is torn down mid-flight.
pub(crate) struct HwSlot {
    pub session: SessionId,
    pub ctx: CtxHandle,
    pub mmu: MmuHandle,
    pub submission: Submission,
    pub plan: DispatchPlan,
    pub started_us: u64,
}

struct Session {
    ctx: CtxHandle,
    mmu: MmuHandle,
    queues: [VecDeque<Submission>; PRIORITY_COUNT],
    notes: VecDeque<CompletionNote>,
}

impl Session {
    fn new(ctx: CtxHandle, mmu: MmuHandle) -> Self {
        Self {
            ctx,
            mmu,
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            notes: VecDeque::new(),
        }
    }

    fn has_work(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }
}

/// What the front-end may start right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Acceptance {
    /// Hardware idle: program, start, kick.
    Idle,
    /// Hardware busy, the ahead slot is open (low-latency only).
    StageAhead,
    Full,
}

/// Consequence of one completed kick.
pub(crate) enum KickOutcome {
    /// No submission was in hardware; a benign leftover wakeup.
    Stale,
    /// More parts to run; re-arm the watchdog and kick again.
    Rearm { budget: u64 },
    /// The submission finished. `promoted` reports that the staged
    /// submission moved into the hardware slot and wants its kick.
    Finished {
        session: SessionId,
        ctx: CtxHandle,
        outputs: Vec<BufferRef>,
        promoted: bool,
    },
}

/// Why the in-flight submissions are being torn off the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RollbackReason {
    Watchdog,
    Fault(Fault),
}

pub(crate) struct SchedulerState {
    sessions: SlotTable<SessionId, Session>,
    rotation: [VecDeque<SessionId>; PRIORITY_COUNT],
    /// Queued-but-undispatched workload units per level.
    outstanding: [u32; PRIORITY_COUNT],
    pub(crate) running: Option<HwSlot>,
    pub(crate) staged: Option<HwSlot>,
    low_latency: bool,
    watchdog: WatchdogPolicy,
    stats: SchedStats,
}

impl SchedulerState {
    pub(crate) fn new(low_latency: bool, watchdog: WatchdogPolicy) -> Self {
        Self {
            sessions: SlotTable::bounded(SESSION_LIMIT),
            rotation: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            outstanding: [0; PRIORITY_COUNT],
            running: None,
            staged: None,
            low_latency,
            watchdog,
            stats: SchedStats::default(),
        }
    }

    pub(crate) fn watchdog(&self) -> WatchdogPolicy {
        self.watchdog
    }

    pub(crate) fn open_session(&mut self, ctx: CtxHandle, mmu: MmuHandle) -> Result<SessionId> {
        match self.sessions.insert(Session::new(ctx, mmu)) {
            Ok(id) => {
                log::debug!(target: "sched", "session {} opened (ctx {})", id, ctx);
                Ok(id)
            }
            Err(_) => Err(Error::OutOfMemory),
        }
    }

    /// Removes an emptied session. Callers cancel its work first.
    pub(crate) fn remove_session(&mut self, session: SessionId) -> Result<()> {
        {
            let session_ref = self.sessions.get(session).ok_or(Error::InvalidArgument)?;
            if session_ref.has_work() || self.slot_holds(session) {
                return Err(Error::Busy);
            }
        }
        self.sessions.remove(session);
        for level in &mut self.rotation {
            level.retain(|s| *s != session);
        }
        log::debug!(target: "sched", "session {} closed", session);
        Ok(())
    }

    pub(crate) fn session_target(&self, session: SessionId) -> Result<(CtxHandle, MmuHandle)> {
        let session_ref = self.sessions.get(session).ok_or(Error::InvalidArgument)?;
        Ok((session_ref.ctx, session_ref.mmu))
    }

    pub(crate) fn sessions_of_ctx(&self, ctx: CtxHandle) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.ctx == ctx)
            .map(|(id, _)| id)
            .collect()
    }

    /// Accepts a submission into its session queue.
    pub(crate) fn enqueue(&mut self, session: SessionId, req: SubmitRequest) -> Result<()> {
        validate_request(&req)?;
        if self.low_latency && self.running.is_some() && self.staged.is_some() {
            // Low latency means no depth: two in flight is the ceiling.
            return Err(Error::Busy);
        }
        let session_ref = self.sessions.get_mut(session).ok_or(Error::InvalidArgument)?;
        let level = req.priority.as_index();
        if session_ref.queues[level].len() >= QUEUE_DEPTH {
            return Err(Error::Busy);
        }
        let units = req.parts as u32;
        let id = req.id;
        session_ref.queues[level].push_back(Submission::new(req));
        self.outstanding[level] += units;
        if !self.rotation[level].contains(&session) {
            self.rotation[level].push_back(session);
        }
        log::trace!(target: "sched", "session {}: submission {} queued at level {}", session, id, level);
        Ok(())
    }

    pub(crate) fn acceptance(&self) -> Acceptance {
        match (&self.running, &self.staged) {
            (None, _) => Acceptance::Idle,
            (Some(_), None) if self.low_latency => Acceptance::StageAhead,
            _ => Acceptance::Full,
        }
    }

    /// Picks the next submission to run: highest level with eligible work,
    /// round-robin between that level's sessions, FIFO within a session.
    /// `ready` reports whether a submission's inputs are in place.
    pub(crate) fn pick<F>(&mut self, mut ready: F) -> Option<Picked>
    where
        F: FnMut(CtxHandle, MmuHandle, &Submission) -> bool,
    {
        for priority in Priority::descending() {
            let level = priority.as_index();
            if self.outstanding[level] == 0 {
                continue;
            }
            for _ in 0..self.rotation[level].len() {
                let Some(&session) = self.rotation[level].front() else {
                    break;
                };
                let eligible = {
                    let Some(session_ref) = self.sessions.get(session) else {
                        self.rotation[level].pop_front();
                        continue;
                    };
                    match session_ref.queues[level].front() {
                        Some(head) => ready(session_ref.ctx, session_ref.mmu, head),
                        None => {
                            // Rotation entry with nothing at this level;
                            // spin it to the back and move on.
                            false
                        }
                    }
                };
                if !eligible {
                    let moved = self.rotation[level].pop_front();
                    if let Some(moved) = moved {
                        self.rotation[level].push_back(moved);
                    }
                    continue;
                }
                let session_ref = self.sessions.get_mut(session)?;
                let (ctx, mmu) = (session_ref.ctx, session_ref.mmu);
                let submission = session_ref.queues[level].pop_front()?;
                self.outstanding[level] -= submission.remaining();
                // Served sessions go to the back of the ring.
                if let Some(served) = self.rotation[level].pop_front() {
                    if self
                        .sessions
                        .get(served)
                        .map(|s| s.has_work())
                        .unwrap_or(false)
                    {
                        self.rotation[level].push_back(served);
                    }
                }
                return Some(Picked {
                    session,
                    ctx,
                    mmu,
                    submission,
                });
            }
        }
        None
    }

    /// Installs a dispatched submission into a hardware slot.
    pub(crate) fn install(&mut self, slot: HwSlot, ahead: bool) {
        if ahead {
            debug_assert!(self.staged.is_none());
            self.staged = Some(slot);
        } else {
            debug_assert!(self.running.is_none());
            self.running = Some(slot);
        }
    }

    /// Finalizes a submission that could not be dispatched at all.
    pub(crate) fn fail_submission(
        &mut self,
        session: SessionId,
        submission: Submission,
        status: CompletionStatus,
    ) {
        self.stats.faults += 1;
        log::warn!(
            target: "sched",
            "session {}: submission {} failed without dispatch: {:?}",
            session,
            submission.req.id,
            status
        );
        self.push_note(
            session,
            CompletionNote {
                id: submission.req.id,
                status,
                cycles: 0,
                elapsed_us: 0,
            },
        );
    }

    /// Folds one completed hardware kick into the running submission.
    pub(crate) fn complete_kick(&mut self, cycles: u64, hash: u32, now_us: u64) -> KickOutcome {
        let Some(slot) = self.running.as_mut() else {
            self.stats.stale_kicks += 1;
            return KickOutcome::Stale;
        };
        slot.submission.progress += 1;
        if slot.submission.progress < slot.submission.req.parts {
            return KickOutcome::Rearm {
                budget: slot.plan.budget,
            };
        }
        let slot = self.running.take().unwrap_or_else(|| unreachable!());
        let elapsed_us = now_us.saturating_sub(slot.started_us);
        self.stats.completed += 1;
        self.stats.cycles += cycles;
        self.stats.busy_us += elapsed_us;
        let hash_ok = !slot.submission.req.flags.contains(SubmitFlags::CHECK_HASH)
            || slot.submission.req.expected_hash == hash;
        let status = if hash_ok {
            CompletionStatus::Done
        } else {
            CompletionStatus::HashMismatch
        };
        if !hash_ok || slot.submission.req.flags.contains(SubmitFlags::NOTIFY_DONE) {
            self.push_note(
                slot.session,
                CompletionNote {
                    id: slot.submission.req.id,
                    status,
                    cycles,
                    elapsed_us,
                },
            );
        }
        let promoted = match self.staged.take() {
            Some(next) => {
                self.running = Some(next);
                true
            }
            None => false,
        };
        KickOutcome::Finished {
            session: slot.session,
            ctx: slot.ctx,
            outputs: slot.submission.req.outputs,
            promoted,
        }
    }

    /// Stamps the running submission's start time; called when a staged
    /// submission is actually kicked off.
    pub(crate) fn mark_started(&mut self, now_us: u64) {
        if let Some(slot) = self.running.as_mut() {
            slot.started_us = now_us;
        }
    }

    /// Tears both slots off the hardware. First-time offenders go back to
    /// the front of their queue with their progress kept; repeat offenders
    /// are failed with the reason's status.
    pub(crate) fn rollback(&mut self, reason: RollbackReason) {
        if reason == RollbackReason::Watchdog {
            self.stats.watchdog_expiries += 1;
        } else {
            self.stats.faults += 1;
        }
        // Staged first so the running submission lands ahead of it.
        let staged = self.staged.take();
        let running = self.running.take();
        for slot in [staged, running].into_iter().flatten() {
            self.rollback_slot(slot, reason);
        }
    }

    fn rollback_slot(&mut self, mut slot: HwSlot, reason: RollbackReason) {
        let level = slot.submission.req.priority.as_index();
        if slot.submission.requeues >= MAX_REQUEUES {
            let status = match reason {
                RollbackReason::Watchdog => CompletionStatus::Timeout,
                RollbackReason::Fault(fault) => CompletionStatus::Fault(fault),
            };
            log::warn!(
                target: "sched",
                "session {}: submission {} failed after retry: {:?}",
                slot.session,
                slot.submission.req.id,
                status
            );
            self.push_note(
                slot.session,
                CompletionNote {
                    id: slot.submission.req.id,
                    status,
                    cycles: 0,
                    elapsed_us: 0,
                },
            );
            return;
        }
        slot.submission.requeues += 1;
        self.stats.rollbacks += 1;
        let units = slot.submission.remaining();
        let session = slot.session;
        let Some(session_ref) = self.sessions.get_mut(session) else {
            log::error!(target: "sched", "rollback into vanished session {}", session);
            return;
        };
        session_ref.queues[level].push_front(slot.submission);
        self.outstanding[level] += units;
        if !self.rotation[level].contains(&session) {
            self.rotation[level].push_front(session);
        }
    }

    /// Removes matching submissions. In-hardware matches report
    /// `stop_hardware`; a surviving staged submission is requeued so the
    /// front-end can restart cleanly.
    pub(crate) fn cancel(
        &mut self,
        session: SessionId,
        pattern: u32,
        mask: u32,
        respond: bool,
    ) -> Result<CancelOutcome> {
        if !self.sessions.contains(session) {
            return Err(Error::InvalidArgument);
        }
        let mut matched = 0u32;
        {
            let Some(session_ref) = self.sessions.get_mut(session) else {
                return Err(Error::InvalidArgument);
            };
            for level in 0..PRIORITY_COUNT {
                let before = session_ref.queues[level].len();
                let mut kept = VecDeque::with_capacity(before);
                while let Some(sub) = session_ref.queues[level].pop_front() {
                    if sub.req.id.matches(pattern, mask) {
                        matched += 1;
                        self.outstanding[level] -= sub.remaining();
                    } else {
                        kept.push_back(sub);
                    }
                }
                session_ref.queues[level] = kept;
            }
        }
        // The ahead slot: discard on match (its units left the ledger at
        // dispatch and the work never started).
        if let Some(staged) = &self.staged {
            if staged.session == session && staged.submission.req.id.matches(pattern, mask) {
                matched += 1;
                self.staged = None;
            }
        }
        let mut stop_hardware = false;
        if let Some(running) = &self.running {
            if running.session == session && running.submission.req.id.matches(pattern, mask) {
                matched += 1;
                stop_hardware = true;
                self.running = None;
                // Canceled in-hardware work gets no completion note.
                if let Some(survivor) = self.staged.take() {
                    self.rollback_slot_quiet(survivor);
                }
            }
        }
        if respond {
            self.push_note(
                session,
                CompletionNote {
                    id: SubmitId::from_raw(pattern),
                    status: CompletionStatus::CancelAck { matched },
                    cycles: 0,
                    elapsed_us: 0,
                },
            );
        }
        log::debug!(
            target: "sched",
            "session {}: cancel {:#x}/{:#x} matched {}",
            session,
            pattern,
            mask,
            matched
        );
        Ok(CancelOutcome {
            matched,
            stop_hardware,
        })
    }

    /// Requeue without charging a failure: the submission did nothing
    /// wrong, the hardware underneath it is being restarted.
    fn rollback_slot_quiet(&mut self, slot: HwSlot) {
        let level = slot.submission.req.priority.as_index();
        let units = slot.submission.remaining();
        let session = slot.session;
        if let Some(session_ref) = self.sessions.get_mut(session) {
            session_ref.queues[level].push_front(slot.submission);
            self.outstanding[level] += units;
            if !self.rotation[level].contains(&session) {
                self.rotation[level].push_front(session);
            }
        }
    }

    pub(crate) fn drain_completions(&mut self, session: SessionId) -> Result<Vec<CompletionNote>> {
        let session_ref = self.sessions.get_mut(session).ok_or(Error::InvalidArgument)?;
        Ok(session_ref.notes.drain(..).collect())
    }

    pub(crate) fn push_note(&mut self, session: SessionId, note: CompletionNote) {
        if let Some(session_ref) = self.sessions.get_mut(session) {
            if session_ref.notes.len() >= QUEUE_DEPTH * PRIORITY_COUNT {
                // An unread backlog this deep means the client is gone.
                session_ref.notes.pop_front();
            }
            session_ref.notes.push_back(note);
        }
    }

    pub(crate) fn stats(&self) -> SchedStats {
        self.stats
    }

    pub(crate) fn note_external_fault(&mut self) {
        self.stats.faults += 1;
    }

    fn slot_holds(&self, session: SessionId) -> bool {
        self.running.as_ref().map(|s| s.session == session) == Some(true)
            || self.staged.as_ref().map(|s| s.session == session) == Some(true)
    }
}

pub(crate) struct CancelOutcome {
    pub matched: u32,
    pub stop_hardware: bool,
}

fn validate_request(req: &SubmitRequest) -> Result<()> {
    if req.parts == 0 {
        return Err(Error::InvalidArgument);
    }
    let refs = req.inputs.len() + req.outputs.len();
    if refs == 0 || refs > NUM_ADDR_SLOTS {
        return Err(Error::InvalidArgument);
    }
    let mut seen = [false; NUM_ADDR_SLOTS];
    for reference in req.inputs.iter().chain(req.outputs.iter()) {
        let slot = reference.slot as usize;
        if slot >= NUM_ADDR_SLOTS || seen[slot] {
            return Err(Error::InvalidArgument);
        }
        if reference.len == 0 {
            return Err(Error::InvalidArgument);
        }
        seen[slot] = true;
    }
    Ok(())
}
