// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Axon NPU resource and execution core (memory, MMU, scheduler, IRQ)
//! OWNERS: @runtime
//! STATUS: In Progress
//! API_STABILITY: Unstable (bring-up)
//! TEST_COVERAGE: per-module unit tests plus property tests (host); tests/ exercise
//! the full device surface against a register stub
//!
//! PUBLIC API:
//! - `Device`: register-window front-end tying the three subsystems together
//! - `mm`: heaps, buffers and per-process contexts with usage accounting
//! - `mmu`: three-level page-table contexts with parity-protected entries
//! - `sched`: priority submission scheduler with watchdog rollback
//! - `pdump`: optional capture sink for register/memory traffic replay
//!
//! NOTE:
//! - The platform glue (interrupt registration, user VMA plumbing, fence
//!   objects) lives behind the `axon-hal` traits; this crate never talks to
//!   the OS directly.
//! - Lock domains are ranked; see `sync` for the acquisition order.

extern crate alloc;

pub mod device;
pub mod error;
mod irq;
pub mod mm;
pub mod mmu;
pub mod pdump;
pub mod regs;
pub mod sched;
mod sync;
pub mod table;
pub mod types;

pub use device::{Device, DeviceConfig, FaultEvent, FaultObserver};
pub use error::{Error, Fault, Result};

/// Device-side translation granule. The MMU, the OCM window and all heap
/// layouts are expressed in multiples of this, independent of the host page
/// size.
pub const DEVICE_PAGE_SIZE: usize = 4096;
