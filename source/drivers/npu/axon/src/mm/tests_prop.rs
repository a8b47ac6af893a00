// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Property tests for the heap backends.

use proptest::prelude::*;

use axon_hal::{MemoryBackend, PhysSegment, SyncDirection};

use crate::mm::heap::{BufferAttrs, Heap, HeapConfig, HeapKind, PhysLayout};
use crate::DEVICE_PAGE_SIZE;

/// Grants sequential granules from a fake physical arena.
struct BumpBackend {
    next: u64,
    outstanding: usize,
}

impl BumpBackend {
    fn new() -> Self {
        Self {
            next: 0x9000_0000,
            outstanding: 0,
        }
    }
}

impl MemoryBackend for BumpBackend {
    fn alloc_granule(&mut self, granule: usize) -> Option<u64> {
        let base = self.next;
        self.next += granule as u64;
        self.outstanding += 1;
        Some(base)
    }
    fn free_granule(&mut self, _base: u64, _granule: usize) {
        self.outstanding -= 1;
    }
    fn resolve_import(&mut self, _token: u64) -> Option<alloc::vec::Vec<PhysSegment>> {
        None
    }
    fn release_import(&mut self, _token: u64) {}
    fn export_segments(&mut self, _segments: &[PhysSegment]) -> Option<u64> {
        None
    }
    fn release_export(&mut self, _token: u64) {}
    fn map_kernel(&mut self, _segments: &[PhysSegment]) -> Option<usize> {
        None
    }
    fn unmap_kernel(&mut self, _kva: usize) {}
    fn sync(&mut self, _segments: &[PhysSegment], _dir: SyncDirection) {}
}

fn carveout_heap(pages: u64) -> Heap {
    Heap::new(HeapConfig {
        kind: HeapKind::Carveout,
        region: Some(PhysSegment::new(0x4000_0000, pages * DEVICE_PAGE_SIZE as u64)),
        ..HeapConfig::default()
    })
    .unwrap()
}

proptest! {
    /// Runs carved from a pool never overlap and always sit inside the
    /// region, for any allocation pattern that fits.
    #[test]
    fn carveout_runs_stay_disjoint(sizes in proptest::collection::vec(1usize..5, 1..12)) {
        let mut heap = carveout_heap(32);
        let mut backend = BumpBackend::new();
        let mut taken: alloc::vec::Vec<PhysSegment> = alloc::vec::Vec::new();
        for pages in sizes {
            let bytes = pages * DEVICE_PAGE_SIZE;
            if let Ok((_, layout)) = heap.allocate(bytes, BufferAttrs::CACHED, 4096, &mut backend) {
                match layout {
                    PhysLayout::Segments(segments) => taken.extend(segments),
                    PhysLayout::Pages(_) => prop_assert!(false, "pooled heap yielded pages"),
                }
            }
        }
        let region_base = 0x4000_0000u64;
        let region_end = region_base + 32 * DEVICE_PAGE_SIZE as u64;
        for (i, a) in taken.iter().enumerate() {
            prop_assert!(a.base >= region_base && a.end() <= region_end);
            for b in taken.iter().skip(i + 1) {
                let disjoint = a.end() <= b.base || b.end() <= a.base;
                prop_assert!(disjoint, "{:#x?} overlaps {:#x?}", a, b);
            }
        }
    }

    /// With order bounds at zero a paged heap covers the request exactly:
    /// as many device pages as the rounded size demands, no surplus.
    #[test]
    fn paged_allocations_cover_exactly(size in 1usize..200_000) {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let mut backend = BumpBackend::new();
        let actual = crate::mm::round_up(size, 4096).unwrap();
        let (payload, layout) = heap
            .allocate(actual, BufferAttrs::CACHED, 4096, &mut backend)
            .unwrap();
        prop_assert_eq!(layout.device_pages(), actual / DEVICE_PAGE_SIZE);
        prop_assert_eq!(layout.total_len(), actual as u64);
        heap.release(payload, &mut backend);
        prop_assert_eq!(backend.outstanding, 0);
    }

    /// Wider order bounds may overshoot the request but never lose pages:
    /// everything handed out comes back on release.
    #[test]
    fn paged_release_returns_every_granule(
        size in 1usize..300_000,
        order_max in 0u8..4,
    ) {
        let mut heap = Heap::new(HeapConfig {
            order_max,
            ..HeapConfig::default()
        })
        .unwrap();
        let mut backend = BumpBackend::new();
        let actual = crate::mm::round_up(size, 4096).unwrap();
        let (payload, layout) = heap
            .allocate(actual, BufferAttrs::CACHED, 4096, &mut backend)
            .unwrap();
        prop_assert!(layout.total_len() >= actual as u64);
        heap.release(payload, &mut backend);
        prop_assert_eq!(backend.outstanding, 0);
    }
}
