// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ranked spinlocks.
//!
//! The driver holds up to three locks at once and the order is fixed:
//! memory (outermost), then scheduler, then interrupt latch; the trace sink
//! may be taken under any of them. Each lock carries a rank and a shared
//! [`LockLedger`] counts held ranks, so a debug build panics the moment an
//! acquisition would invert the order. The double-lock check follows the
//! same single-entrant assumption as the rest of the bring-up diagnostics:
//! under real contention it can fire on a legitimate wait, which is why
//! every check compiles out of release builds.

use alloc::sync::Arc;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Trace sink; taken while holding any other lock.
pub(crate) const RANK_TRACE: u8 = 0;
/// Interrupt latch; innermost of the state locks.
pub(crate) const RANK_IRQ: u8 = 1;
/// Scheduler state.
pub(crate) const RANK_SCHED: u8 = 2;
/// Memory, translation and buffer state; outermost.
pub(crate) const RANK_MM: u8 = 3;

const RANK_COUNT: usize = 4;

/// Shared per-device record of which ranks are currently held.
pub(crate) struct LockLedger {
    held: [AtomicU32; RANK_COUNT],
}

impl LockLedger {
    pub(crate) const fn new() -> Self {
        Self {
            held: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    #[cfg(debug_assertions)]
    fn check_acquire(&self, rank: u8, name: &str) {
        for lower in 0..=rank as usize {
            if self.held[lower].load(Ordering::Acquire) != 0 {
                panic!(
                    "lock order violated: acquiring '{}' (rank {}) while rank {} is held",
                    name, rank, lower
                );
            }
        }
    }

    fn note_acquire(&self, rank: u8) {
        self.held[rank as usize].fetch_add(1, Ordering::AcqRel);
    }

    fn note_release(&self, rank: u8) {
        self.held[rank as usize].fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct OrderedMutex<T> {
    inner: spin::Mutex<T>,
    held: AtomicBool,
    rank: u8,
    /// Read by the debug-build diagnostics only.
    #[allow(dead_code)]
    name: &'static str,
    ledger: Arc<LockLedger>,
}

impl<T> OrderedMutex<T> {
    pub(crate) fn new(name: &'static str, rank: u8, ledger: Arc<LockLedger>, value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            held: AtomicBool::new(false),
            rank,
            name,
            ledger,
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, T> {
        let _was_held = self.held.swap(true, Ordering::Acquire);
        #[cfg(debug_assertions)]
        if _was_held {
            panic!("lock '{}' acquired while already held", self.name);
        }
        #[cfg(debug_assertions)]
        self.ledger.check_acquire(self.rank, self.name);
        self.ledger.note_acquire(self.rank);
        OrderedGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            lock: self,
        }
    }
}

pub(crate) struct OrderedGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    lock: &'a OrderedMutex<T>,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.ledger.note_release(self.lock.rank);
        self.lock.held.store(false, Ordering::Release);
        // Bookkeeping is cleared before the spinlock opens so a waiter
        // cannot observe the flag set on an unheld lock.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}
