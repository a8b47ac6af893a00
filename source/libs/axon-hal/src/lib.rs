// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! Platform contracts consumed by accelerator driver cores.
//!
//! The driver core never touches raw hardware or platform memory services
//! directly; everything flows through the traits here. Register access is a
//! 32-bit window (`Bus`), physical memory comes from a [`MemoryBackend`]
//! (system pages, imported handles, kernel mappings, cache maintenance), and
//! elapsed time for scheduler accounting comes from a [`Clock`].

extern crate alloc;

use alloc::vec::Vec;

/// Basic register-window access trait shared by accelerator drivers.
///
/// `offset` is a byte offset into the device's register block. 64-bit
/// registers are split into lo/hi pairs by the driver.
pub trait Bus {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// A physically contiguous run of device-visible memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysSegment {
    /// First byte of the run.
    pub base: u64,
    /// Length in bytes.
    pub len: u64,
}

impl PhysSegment {
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    /// Exclusive end of the run.
    pub fn end(&self) -> u64 {
        self.base + self.len
    }
}

/// Direction of a cache-maintenance operation on a non-coherent platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    /// Flush CPU writes so the device observes them.
    ToDevice,
    /// Invalidate CPU caches so the CPU observes device writes.
    ToHost,
}

/// Physical allocation services backing driver heaps.
///
/// This is the narrow contract of the platform's allocation backends:
/// allocate/import/export/free/map/sync. The driver core owns all policy
/// (granularity, accounting, layout bookkeeping); the backend only produces
/// and consumes raw physical memory.
pub trait MemoryBackend {
    /// Allocates one physically contiguous granule of `granule` bytes.
    ///
    /// Returns the physical base address, or `None` when the platform is out
    /// of memory. The granule is expected to be a power-of-two multiple of
    /// the platform page size.
    fn alloc_granule(&mut self, granule: usize) -> Option<u64>;

    /// Returns a granule previously produced by [`Self::alloc_granule`].
    fn free_granule(&mut self, base: u64, granule: usize);

    /// Resolves an externally owned handle into its physical layout.
    ///
    /// The returned segments stay valid until [`Self::release_import`] is
    /// called with the same handle. `None` means the handle is unknown to the
    /// platform.
    fn resolve_import(&mut self, handle: u64) -> Option<Vec<PhysSegment>>;

    /// Drops the reference taken by [`Self::resolve_import`].
    fn release_import(&mut self, handle: u64);

    /// Wraps driver-owned segments into a handle another client can import.
    ///
    /// `None` means the platform cannot export (no sharing transport).
    fn export_segments(&mut self, segments: &[PhysSegment]) -> Option<u64>;

    /// Releases a handle produced by [`Self::export_segments`].
    fn release_export(&mut self, handle: u64);

    /// Maps the segments into the kernel address space.
    ///
    /// Returns the kernel virtual address of the first byte; the mapping is
    /// virtually contiguous across segments.
    fn map_kernel(&mut self, segments: &[PhysSegment]) -> Option<usize>;

    /// Unmaps a kernel mapping produced by [`Self::map_kernel`].
    fn unmap_kernel(&mut self, kva: usize);

    /// Performs cache maintenance over `segments` in `dir`.
    ///
    /// Hardware-coherent platforms implement this as a no-op.
    fn sync(&mut self, segments: &[PhysSegment], dir: SyncDirection);
}

/// Monotonic time source used for scheduler statistics.
pub trait Clock {
    /// Returns the current time in microseconds.
    fn now_us(&self) -> u64;
}

/// Completion signal attached to buffers filled by hardware.
pub trait Fence {
    fn signal(&self);
}
