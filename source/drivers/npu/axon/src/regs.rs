// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Register map of the Axon neural accelerator core.
//!
//! Offsets are relative to the control window the platform hands to
//! [`crate::device::Device`]. All registers are 32-bit; 64-bit quantities
//! are split low/high and the low half must be written first, the high
//! half last (the high write latches).

use axon_hal::Bus;
use bitflags::bitflags;

/// Value of [`REG_IDENTITY`] on silicon this driver understands ("AXON").
pub const AXON_IDENTITY: u32 = 0x4158_4f4e;

pub const REG_IDENTITY: usize = 0x000;
pub const REG_REVISION: usize = 0x004;

/// Core run control, see `CTRL_*`.
pub const REG_CORE_CTRL: usize = 0x010;
pub const REG_CORE_STATUS: usize = 0x014;

/// Raw interrupt status, write-one-to-clear.
pub const REG_IRQ_STATUS: usize = 0x020;
pub const REG_IRQ_MASK: usize = 0x024;
/// Free-running completed-kick counter; only the low byte is implemented.
pub const REG_KICK_COUNT: usize = 0x028;
/// Write 1 to start the programmed pass.
pub const REG_KICK: usize = 0x02c;

pub const REG_WDT_BUDGET_LO: usize = 0x030;
pub const REG_WDT_BUDGET_HI: usize = 0x034;

pub const REG_MMU_ROOT_LO: usize = 0x040;
pub const REG_MMU_ROOT_HI: usize = 0x044;
/// Translation control, see `MMU_CTRL_*`.
pub const REG_MMU_CTRL: usize = 0x048;

pub const REG_FAULT_ADDR_LO: usize = 0x050;
pub const REG_FAULT_ADDR_HI: usize = 0x054;
/// Qualifies the most recent fault, see `FAULT_*`.
pub const REG_FAULT_STATUS: usize = 0x058;

/// Cycles consumed by the most recently completed pass.
pub const REG_CYCLES_LO: usize = 0x060;
pub const REG_CYCLES_HI: usize = 0x064;
/// Hardware-computed signature over the last pass's outputs.
pub const REG_RESULT_HASH: usize = 0x068;

/// First of [`NUM_ADDR_SLOTS`] low/high address-slot pairs.
pub const REG_SLOT_BASE: usize = 0x100;
pub const NUM_ADDR_SLOTS: usize = 16;

pub const CTRL_START: u32 = 1 << 0;
pub const CTRL_STOP: u32 = 1 << 1;
pub const CTRL_RESET: u32 = 1 << 2;

pub const STATUS_IDLE: u32 = 1 << 0;

pub const MMU_CTRL_FLUSH: u32 = 1 << 0;
pub const MMU_CTRL_BYPASS: u32 = 1 << 1;

/// The fault did not originate from the pass this driver dispatched.
pub const FAULT_EXTERNAL: u32 = 1 << 0;

bitflags! {
    /// Bits of [`REG_IRQ_STATUS`] and [`REG_IRQ_MASK`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqBits: u32 {
        const COMPLETE = 1 << 0;
        const WATCHDOG = 1 << 1;
        const MMU_FAULT = 1 << 2;
        const BUS_ERROR = 1 << 3;
    }
}

impl IrqBits {
    /// Status bits that report a failed pass rather than a finished one.
    pub const FAULTS: IrqBits = IrqBits::WATCHDOG
        .union(IrqBits::MMU_FAULT)
        .union(IrqBits::BUS_ERROR);
}

/// Byte offset of the low half of address slot `slot`.
#[inline]
pub const fn slot_lo(slot: usize) -> usize {
    REG_SLOT_BASE + slot * 8
}

/// Byte offset of the high half of address slot `slot`.
#[inline]
pub const fn slot_hi(slot: usize) -> usize {
    REG_SLOT_BASE + slot * 8 + 4
}

/// Writes a 64-bit value as a low/high pair, low first.
pub fn write64<B: Bus>(bus: &B, lo: usize, hi: usize, value: u64) {
    bus.write(lo, value as u32);
    bus.write(hi, (value >> 32) as u32);
}

/// Reads a 64-bit value assembled from a low/high pair.
pub fn read64<B: Bus>(bus: &B, lo: usize, hi: usize) -> u64 {
    let low = bus.read(lo) as u64;
    let high = bus.read(hi) as u64;
    (high << 32) | low
}
