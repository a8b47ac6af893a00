// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Interrupt latch shared between the fast and deferred stages.
//!
//! The fast stage runs in interrupt context: it reads the raw status, clears
//! it (write-one-to-clear) and folds the result into this latch. Everything
//! that may block or take the heavier locks happens later in the deferred
//! stage, which drains the latch and reprocesses the recorded state once per
//! signaled kick.
//!
//! The hardware may coalesce several completions into one interrupt, so the
//! completion count is derived from the free-running kick counter rather than
//! from the number of times the completion bit was observed. The counter is
//! eight bits wide; wrapping subtraction keeps the delta correct across
//! overflow as long as fewer than 256 kicks land between two fast-stage runs.

use crate::regs::IrqBits;

/// Accumulated interrupt state awaiting the deferred stage.
#[derive(Debug)]
pub(crate) struct IrqLatch {
    last_count: u8,
    pending_kicks: u32,
    faults: IrqBits,
}

/// One drained batch of latched state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IrqSnapshot {
    pub kicks: u32,
    pub faults: IrqBits,
}

impl IrqSnapshot {
    pub fn is_empty(&self) -> bool {
        self.kicks == 0 && self.faults.is_empty()
    }
}

impl IrqLatch {
    /// `initial_count` is the kick counter value at bring-up; deltas are
    /// measured from there.
    pub fn new(initial_count: u8) -> Self {
        Self {
            last_count: initial_count,
            pending_kicks: 0,
            faults: IrqBits::empty(),
        }
    }

    /// Fast stage: fold a freshly read (and already cleared) status word into
    /// the latch. `count` must be read after the status so a completion that
    /// set the bit has also advanced the counter.
    pub fn record(&mut self, status: IrqBits, count: u8) {
        if status.contains(IrqBits::COMPLETE) {
            let delta = count.wrapping_sub(self.last_count);
            self.last_count = count;
            self.pending_kicks += u32::from(delta);
        }
        self.faults |= status & IrqBits::FAULTS;
    }

    /// Deferred stage: take everything recorded so far.
    pub fn drain(&mut self) -> IrqSnapshot {
        let snapshot = IrqSnapshot {
            kicks: self.pending_kicks,
            faults: self.faults,
        };
        self.pending_kicks = 0;
        self.faults = IrqBits::empty();
        snapshot
    }
}
