// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Heap backends.
//!
//! A heap is a named source of device-visible memory registered at device
//! bring-up. Six kinds exist:
//!
//! * `Unified`: discontiguous granules from the platform page allocator.
//! * `Carveout`: a reserved physical window carved by a bitmap, with a
//!   relocatable base.
//! * `Import`: buffers resolved from externally shared tokens.
//! * `Shared`: like `Unified`, and allocations can be exported as tokens.
//! * `Anonymous`: host-only granules the device never maps.
//! * `Ocm`: the on-chip memory window, device-page grained.
//!
//! Every allocation yields a [`BufferPayload`] (what to give back later) and
//! a [`PhysLayout`] (how the bytes sit in the physical map). A layout is
//! exactly one of a page list or a segment list; callers branch on which.

use alloc::vec::Vec;

use axon_hal::{MemoryBackend, PhysSegment};
use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::DEVICE_PAGE_SIZE;

/// Largest granule order a paged heap may use (`host_page << order`).
pub const MAX_HEAP_ORDER: u8 = 10;

bitflags! {
    /// Buffer attributes supplied at allocation time.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferAttrs: u32 {
        /// Host-cached; needs explicit sync around device access.
        const CACHED = 1 << 0;
        /// Write-combined host mapping.
        const WRITE_COMBINE = 1 << 1;
        /// Fully uncached host mapping.
        const UNCACHED = 1 << 2;
        /// Backs translation-table nodes; device-page granularity.
        const PAGE_TABLE = 1 << 3;
    }
}

impl BufferAttrs {
    const CACHE_MODES: BufferAttrs = BufferAttrs::CACHED
        .union(BufferAttrs::WRITE_COMBINE)
        .union(BufferAttrs::UNCACHED);

    /// Applies the default cache mode and rejects conflicting ones.
    pub fn normalized(self) -> Result<BufferAttrs> {
        let cache = self.intersection(Self::CACHE_MODES);
        if cache.is_empty() {
            Ok(self | BufferAttrs::CACHED)
        } else if cache.bits().count_ones() == 1 {
            Ok(self)
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapKind {
    Unified,
    Carveout,
    Import,
    Shared,
    Anonymous,
    Ocm,
}

/// Static description of one heap, fixed at registration.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    pub kind: HeapKind,
    /// Backing window; required for `Carveout` and `Ocm`, ignored otherwise.
    pub region: Option<PhysSegment>,
    /// Granule order bounds for the paged kinds.
    pub order_min: u8,
    pub order_max: u8,
    /// Added to physical addresses when they are presented to the device.
    pub device_offset: i64,
    /// Whether buffers from this heap need host cache maintenance.
    pub cache_sync: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            kind: HeapKind::Unified,
            region: None,
            order_min: 0,
            order_max: 0,
            device_offset: 0,
            cache_sync: true,
        }
    }
}

/// Physical shape of a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhysLayout {
    /// One entry per device page, arbitrary order.
    Pages(Vec<u64>),
    /// Contiguous runs, each device-page aligned.
    Segments(Vec<PhysSegment>),
}

impl PhysLayout {
    pub fn device_pages(&self) -> usize {
        match self {
            PhysLayout::Pages(pages) => pages.len(),
            PhysLayout::Segments(segments) => segments
                .iter()
                .map(|s| s.len as usize / DEVICE_PAGE_SIZE)
                .sum(),
        }
    }

    pub fn total_len(&self) -> u64 {
        match self {
            PhysLayout::Pages(pages) => (pages.len() * DEVICE_PAGE_SIZE) as u64,
            PhysLayout::Segments(segments) => segments.iter().map(|s| s.len).sum(),
        }
    }

    /// Physical base of device page `index`. Linear in the segment count;
    /// hot paths go through the buffer's position cache instead.
    pub fn page_base(&self, index: usize) -> Option<u64> {
        match self {
            PhysLayout::Pages(pages) => pages.get(index).copied(),
            PhysLayout::Segments(segments) => {
                let mut remaining = index;
                for segment in segments {
                    let pages = segment.len as usize / DEVICE_PAGE_SIZE;
                    if remaining < pages {
                        return Some(segment.base + (remaining * DEVICE_PAGE_SIZE) as u64);
                    }
                    remaining -= pages;
                }
                None
            }
        }
    }

    /// Segment view for cache maintenance, coalescing adjacent pages.
    pub fn sync_segments(&self) -> Vec<PhysSegment> {
        match self {
            PhysLayout::Segments(segments) => segments.clone(),
            PhysLayout::Pages(pages) => {
                let mut out: Vec<PhysSegment> = Vec::new();
                for &page in pages {
                    match out.last_mut() {
                        Some(last) if last.end() == page => last.len += DEVICE_PAGE_SIZE as u64,
                        _ => out.push(PhysSegment::new(page, DEVICE_PAGE_SIZE as u64)),
                    }
                }
                out
            }
        }
    }
}

/// What the heap needs to reclaim an allocation.
#[derive(Clone, Debug)]
pub enum BufferPayload {
    /// Granules from the platform allocator, one segment each.
    Granules(Vec<PhysSegment>),
    /// A run carved from a pooled heap.
    Region(PhysSegment),
    /// An externally resolved token.
    Imported { token: u64 },
}

/// Bitmap page pool over a fixed physical window.
struct RegionPool {
    base: u64,
    pages: usize,
    map: Vec<u64>,
}

impl RegionPool {
    fn new(region: PhysSegment) -> Self {
        let pages = region.len as usize / DEVICE_PAGE_SIZE;
        Self {
            base: region.base,
            pages,
            map: alloc::vec![0; (pages + 63) / 64],
        }
    }

    fn bit(&self, index: usize) -> bool {
        self.map[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize, used: bool) {
        if used {
            self.map[index / 64] |= 1 << (index % 64);
        } else {
            self.map[index / 64] &= !(1 << (index % 64));
        }
    }

    fn used_pages(&self) -> usize {
        self.map.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// First-fit search for a contiguous run of `count` free pages.
    fn alloc(&mut self, count: usize) -> Option<u64> {
        if count == 0 || count > self.pages {
            return None;
        }
        let mut run = 0;
        for index in 0..self.pages {
            if self.bit(index) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = index + 1 - count;
                for page in first..=index {
                    self.set(page, true);
                }
                return Some(self.base + (first * DEVICE_PAGE_SIZE) as u64);
            }
        }
        None
    }

    fn free(&mut self, addr: u64, count: usize) {
        let first = ((addr - self.base) as usize) / DEVICE_PAGE_SIZE;
        for page in first..first + count {
            debug_assert!(self.bit(page), "pool page freed twice");
            self.set(page, false);
        }
    }
}

enum HeapState {
    /// Unified, Shared, Anonymous.
    Paged,
    /// Carveout, Ocm.
    Pooled(RegionPool),
    /// Import.
    External,
}

pub struct Heap {
    config: HeapConfig,
    state: HeapState,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Result<Self> {
        if config.order_min > config.order_max || config.order_max > MAX_HEAP_ORDER {
            return Err(Error::InvalidArgument);
        }
        let state = match config.kind {
            HeapKind::Unified | HeapKind::Shared | HeapKind::Anonymous => HeapState::Paged,
            HeapKind::Import => HeapState::External,
            HeapKind::Carveout | HeapKind::Ocm => {
                let region = config.region.ok_or(Error::InvalidArgument)?;
                if region.base % DEVICE_PAGE_SIZE as u64 != 0
                    || region.len == 0
                    || region.len % DEVICE_PAGE_SIZE as u64 != 0
                {
                    return Err(Error::InvalidArgument);
                }
                HeapState::Pooled(RegionPool::new(region))
            }
        };
        Ok(Self { config, state })
    }

    pub fn kind(&self) -> HeapKind {
        self.config.kind
    }

    pub fn device_offset(&self) -> i64 {
        self.config.device_offset
    }

    /// Device mappings use raw physical addresses for the on-chip window.
    pub fn skip_translation_offset(&self) -> bool {
        matches!(self.config.kind, HeapKind::Ocm)
    }

    pub fn device_mappable(&self) -> bool {
        !matches!(self.config.kind, HeapKind::Anonymous)
    }

    /// Whether translation nodes may be allocated here: the device must be
    /// able to walk them, and the heap must actually allocate.
    pub fn backs_nodes(&self) -> bool {
        !matches!(self.config.kind, HeapKind::Anonymous | HeapKind::Import)
    }

    pub fn supports_import(&self) -> bool {
        matches!(self.config.kind, HeapKind::Import)
    }

    pub fn supports_export(&self) -> bool {
        matches!(self.config.kind, HeapKind::Shared | HeapKind::Import)
    }

    pub fn needs_cache_sync(&self, attrs: BufferAttrs) -> bool {
        self.config.cache_sync && attrs.contains(BufferAttrs::CACHED)
    }

    /// Rounding granule for this heap given the buffer attributes.
    pub fn granule(&self, attrs: BufferAttrs, host_page: usize) -> usize {
        match self.config.kind {
            HeapKind::Carveout | HeapKind::Ocm => DEVICE_PAGE_SIZE,
            _ if attrs.contains(BufferAttrs::PAGE_TABLE) => DEVICE_PAGE_SIZE,
            _ => host_page,
        }
    }

    /// Allocates `actual` bytes (already rounded to [`Self::granule`]).
    pub fn allocate<M: MemoryBackend>(
        &mut self,
        actual: usize,
        attrs: BufferAttrs,
        host_page: usize,
        backend: &mut M,
    ) -> Result<(BufferPayload, PhysLayout)> {
        match &mut self.state {
            HeapState::External => Err(Error::InvalidArgument),
            HeapState::Pooled(pool) => {
                let pages = actual / DEVICE_PAGE_SIZE;
                let base = pool.alloc(pages).ok_or(Error::OutOfMemory)?;
                let segment = PhysSegment::new(base, actual as u64);
                Ok((
                    BufferPayload::Region(segment),
                    PhysLayout::Segments(alloc::vec![segment]),
                ))
            }
            HeapState::Paged => {
                let granules = alloc_granules(
                    actual,
                    if attrs.contains(BufferAttrs::PAGE_TABLE) {
                        DEVICE_PAGE_SIZE
                    } else {
                        host_page
                    },
                    self.config.order_min,
                    self.config.order_max,
                    backend,
                )?;
                let mut pages = Vec::with_capacity(actual / DEVICE_PAGE_SIZE);
                for granule in &granules {
                    let count = granule.len as usize / DEVICE_PAGE_SIZE;
                    for page in 0..count {
                        pages.push(granule.base + (page * DEVICE_PAGE_SIZE) as u64);
                    }
                }
                Ok((BufferPayload::Granules(granules), PhysLayout::Pages(pages)))
            }
        }
    }

    /// Resolves an external token into a layout.
    ///
    /// `actual` (the client size rounded to the device page) may be smaller
    /// than the resolved run, but only by less than one platform granule of
    /// rounding slack per the exporting side; anything else means the caller
    /// handed us a token for a different buffer.
    pub fn import<M: MemoryBackend>(
        &mut self,
        actual: usize,
        host_page: usize,
        token: u64,
        backend: &mut M,
    ) -> Result<(BufferPayload, PhysLayout)> {
        if !self.supports_import() {
            return Err(Error::InvalidArgument);
        }
        let segments = backend
            .resolve_import(token)
            .ok_or(Error::InvalidArgument)?;
        let mut total: u64 = 0;
        for segment in &segments {
            if segment.base % DEVICE_PAGE_SIZE as u64 != 0
                || segment.len == 0
                || segment.len % DEVICE_PAGE_SIZE as u64 != 0
            {
                backend.release_import(token);
                return Err(Error::InvalidArgument);
            }
            total += segment.len;
        }
        let actual = actual as u64;
        if actual > total || total - actual >= host_page as u64 {
            backend.release_import(token);
            return Err(Error::InvalidArgument);
        }
        Ok((
            BufferPayload::Imported { token },
            PhysLayout::Segments(segments),
        ))
    }

    pub fn export<M: MemoryBackend>(
        &self,
        layout: &PhysLayout,
        backend: &mut M,
    ) -> Result<u64> {
        if !self.supports_export() {
            return Err(Error::InvalidArgument);
        }
        let segments = layout.sync_segments();
        backend.export_segments(&segments).ok_or(Error::OutOfMemory)
    }

    pub fn release<M: MemoryBackend>(&mut self, payload: BufferPayload, backend: &mut M) {
        match payload {
            BufferPayload::Granules(granules) => {
                for granule in granules {
                    backend.free_granule(granule.base, granule.len as usize);
                }
            }
            BufferPayload::Region(segment) => {
                if let HeapState::Pooled(pool) = &mut self.state {
                    pool.free(segment.base, segment.len as usize / DEVICE_PAGE_SIZE);
                }
            }
            BufferPayload::Imported { token } => backend.release_import(token),
        }
    }

    /// Moves a pooled heap's window. Refused while any page is carved out,
    /// because outstanding payloads encode the old base.
    pub fn set_offset(&mut self, offset: u64) -> Result<()> {
        if self.config.kind != HeapKind::Carveout {
            return Err(Error::InvalidArgument);
        }
        let region = self.config.region.ok_or(Error::InvalidArgument)?;
        if offset % DEVICE_PAGE_SIZE as u64 != 0 || offset >= region.len {
            return Err(Error::InvalidArgument);
        }
        match &mut self.state {
            HeapState::Pooled(pool) => {
                if pool.used_pages() != 0 {
                    return Err(Error::Busy);
                }
                let shifted = PhysSegment::new(region.base + offset, region.len - offset);
                *pool = RegionPool::new(shifted);
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Grabs granules largest-order-first until `actual` bytes are covered.
/// On failure every granule taken so far goes back.
fn alloc_granules<M: MemoryBackend>(
    actual: usize,
    base_granule: usize,
    order_min: u8,
    order_max: u8,
    backend: &mut M,
) -> Result<Vec<PhysSegment>> {
    let mut granules: Vec<PhysSegment> = Vec::new();
    let mut remaining = actual;
    while remaining > 0 {
        // Largest order that fits what is left; order_min can overshoot,
        // the surplus pages simply go unmapped.
        let mut order = order_max;
        while order > order_min && (base_granule << order) > remaining {
            order -= 1;
        }
        let base = loop {
            let granule = base_granule << order;
            match backend.alloc_granule(granule) {
                Some(base) => break Some((base, granule)),
                None if order > order_min => order -= 1,
                None => break None,
            }
        };
        match base {
            Some((base, granule)) => {
                granules.push(PhysSegment::new(base, granule as u64));
                remaining = remaining.saturating_sub(granule);
            }
            None => {
                for granule in granules {
                    backend.free_granule(granule.base, granule.len as usize);
                }
                return Err(Error::OutOfMemory);
            }
        }
    }
    Ok(granules)
}
