// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Device MMU contexts.
//!
//! Each translation context owns a lazily grown three-level tree (see
//! [`walker`]) whose nodes are ordinary buffers in the owning process
//! context, accounted to the node meter. Mapping runs in phases: validate
//! and snapshot under the context borrow, allocate missing nodes with the
//! full state available, then commit entries. A node allocation that fails
//! mid-walk unwinds the nodes taken so far and leaves the tree exactly as
//! it was.
//!
//! A context can also run with the hardware walker bypassed; mappings are
//! then bookkeeping only and the device sees physical addresses plus a
//! fixed offset. Bypassed contexts require physically contiguous buffers.

pub mod walker;

#[cfg(test)]
mod tests_prop;

use alloc::boxed::Box;
use alloc::vec::Vec;

use axon_hal::{MemoryBackend, PhysSegment};
use bitflags::bitflags;

use crate::error::{Error, Fault, Result};
use crate::mm::context::{ProcessContext, MAPPING_LIMIT};
use crate::mm::MemoryState;
use crate::pdump::TraceSink;
use crate::types::{BufferId, CtxHandle, DeviceVirt, MappingId, MmuHandle};
use crate::DEVICE_PAGE_SIZE;

use walker::{
    decode_branch, decode_leaf, encode_branch, encode_leaf, level_indices, read_entry, write_entry,
    EntryFlags, EntryRead, NodeKey, NodeSlot, PageTree, TreeLevel, ENTRY_SIZE, MAX_ADDR_WIDTH,
    MAX_PHYS_WIDTH, PAGE_SHIFT,
};

bitflags! {
    /// Per-mapping flags supplied by the client.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ_ONLY = 1 << 0;
    }
}

/// Fixed parameters of one translation context.
#[derive(Clone, Copy, Debug)]
pub struct MmuConfig {
    /// Virtual width the tree decodes, at most [`MAX_ADDR_WIDTH`].
    pub addr_width: u8,
    /// Physical width entries may carry, at most [`MAX_PHYS_WIDTH`].
    pub phys_width: u8,
    /// Protect leaf entries with the odd-parity bit.
    pub parity: bool,
    /// Run without the hardware walker.
    pub bypass: bool,
    /// Added to physical addresses in bypass mode.
    pub bypass_offset: u64,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            addr_width: MAX_ADDR_WIDTH,
            phys_width: 40,
            parity: true,
            bypass: false,
            bypass_offset: 0,
        }
    }
}

impl MmuConfig {
    fn validate(&self) -> Result<()> {
        if self.addr_width <= PAGE_SHIFT as u8 || self.addr_width > MAX_ADDR_WIDTH {
            return Err(Error::InvalidArgument);
        }
        if self.phys_width <= PAGE_SHIFT as u8 || self.phys_width > MAX_PHYS_WIDTH {
            return Err(Error::InvalidArgument);
        }
        if self.bypass_offset % DEVICE_PAGE_SIZE as u64 != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn span(&self) -> u64 {
        1u64 << self.addr_width
    }
}

/// Tree growth and shrink notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmuEvent {
    NodeAllocated { level: TreeLevel },
    NodeFreed { level: TreeLevel },
}

pub type EventCallback = Box<dyn FnMut(MmuEvent) + Send>;

/// One buffer-to-context mapping.
pub struct Mapping {
    pub buffer: BufferId,
    pub mmu: MmuHandle,
    pub virt: DeviceVirt,
    pub pages: usize,
    pub flags: MapFlags,
    /// On-chip and bypass sources skip the heap's device offset.
    pub skip_offset: bool,
    /// Page retargeted into the on-chip window: (page index, window offset).
    pub promoted: Option<(usize, u64)>,
}

impl Mapping {
    fn covers(&self, virt: u64) -> bool {
        let base = self.virt.raw();
        virt >= base && virt < base + (self.pages * DEVICE_PAGE_SIZE) as u64
    }

    fn overlaps(&self, base: u64, span: u64) -> bool {
        let own = self.virt.raw();
        let own_span = (self.pages * DEVICE_PAGE_SIZE) as u64;
        base < own + own_span && own < base + span
    }
}

pub struct MmuContext {
    config: MmuConfig,
    node_heap: crate::types::HeapHandle,
    window: Option<PhysSegment>,
    /// `None` while bypassed.
    tree: Option<PageTree>,
    mappings: Vec<MappingId>,
    events: Option<EventCallback>,
}

impl MmuContext {
    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub(crate) fn node_heap(&self) -> crate::types::HeapHandle {
        self.node_heap
    }

    /// Whether `buf` backs one of this context's tree nodes.
    pub(crate) fn owns_node(&self, buf: BufferId) -> bool {
        match &self.tree {
            None => false,
            Some(tree) => {
                tree.catalogue.buffer == buf
                    || tree.dirs.values().any(|n| n.buffer == buf)
                    || tree.tables.values().any(|n| n.buffer == buf)
            }
        }
    }

    fn emit(&mut self, event: MmuEvent) {
        if let Some(callback) = self.events.as_mut() {
            callback(event);
        }
    }
}

#[inline]
fn device_view(offset: i64, skip: bool, phys: u64) -> u64 {
    if skip {
        phys
    } else {
        (phys as i64).wrapping_add(offset) as u64
    }
}

/// What phase A of `map_device` learns before any allocation happens.
struct MapPlan {
    pages: usize,
    page_addrs: Vec<u64>,
    missing: Vec<NodeKey>,
    node_heap: crate::types::HeapHandle,
    node_offset: i64,
    node_skip: bool,
    parity: bool,
    phys_width: u8,
    skip_offset: bool,
}

impl<M: MemoryBackend> MemoryState<M> {
    pub(crate) fn create_mmu_context(
        &mut self,
        ctx: CtxHandle,
        config: MmuConfig,
        node_heap: crate::types::HeapHandle,
        window: Option<PhysSegment>,
        events: Option<EventCallback>,
        trace: &mut dyn TraceSink,
    ) -> Result<MmuHandle> {
        config.validate()?;
        if !self.contexts.contains(ctx) {
            return Err(Error::InvalidArgument);
        }
        {
            let heap_ref = self.heaps.get(node_heap).ok_or(Error::InvalidArgument)?;
            if !heap_ref.backs_nodes() {
                return Err(Error::InvalidArgument);
            }
        }
        if let Some(window) = &window {
            if window.base % DEVICE_PAGE_SIZE as u64 != 0 || window.len == 0 {
                return Err(Error::InvalidArgument);
            }
        }
        let tree = if config.bypass {
            None
        } else {
            let grant = self.pt_node_alloc(ctx, node_heap, trace)?;
            Some(PageTree::new(NodeSlot {
                buffer: grant.buffer,
                kva: grant.kva,
                phys: grant.phys,
                used: 0,
            }))
        };
        let had_tree = tree.is_some();
        let mmu_ctx = MmuContext {
            config,
            node_heap,
            window,
            tree,
            mappings: Vec::new(),
            events,
        };
        let Some(ctx_ref) = self.contexts.get_mut(ctx) else {
            if let Some(tree) = mmu_ctx.tree {
                self.pt_node_free(ctx, tree.catalogue.buffer, trace);
            }
            return Err(Error::InvalidArgument);
        };
        match ctx_ref.mmu.insert(mmu_ctx) {
            Ok(handle) => {
                if had_tree {
                    if let Some(created) = ctx_ref.mmu.get_mut(handle) {
                        created.emit(MmuEvent::NodeAllocated {
                            level: TreeLevel::Catalogue,
                        });
                    }
                }
                log::debug!(target: "mmu", "ctx {}: mmu {} created (bypass={})", ctx, handle, config.bypass);
                Ok(handle)
            }
            Err(rejected) => {
                if let Some(tree) = rejected.tree {
                    self.pt_node_free(ctx, tree.catalogue.buffer, trace);
                }
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Destroys a translation context, unmapping whatever is still mapped.
    pub(crate) fn destroy_mmu_context(
        &mut self,
        ctx: CtxHandle,
        handle: MmuHandle,
        trace: &mut dyn TraceSink,
    ) -> Result<()> {
        let mapping_ids = {
            let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            let mmu_ctx = ctx_ref.mmu.get(handle).ok_or(Error::InvalidArgument)?;
            mmu_ctx.mappings.clone()
        };
        if !mapping_ids.is_empty() {
            log::warn!(
                target: "mmu",
                "ctx {}: mmu {} destroyed with {} live mappings",
                ctx,
                handle,
                mapping_ids.len()
            );
        }
        for mapping in mapping_ids {
            if let Err(err) = self.unmap_by_mapping(ctx, mapping, trace) {
                log::error!(target: "mmu", "ctx {}: mapping teardown failed: {}", ctx, err);
            }
        }
        let removed = self
            .contexts
            .get_mut(ctx)
            .and_then(|c| c.mmu.remove(handle));
        let Some(mut removed) = removed else {
            return Err(Error::InvalidArgument);
        };
        if let Some(mut tree) = removed.tree.take() {
            for (level, buffer) in tree.drain_nodes() {
                self.pt_node_free(ctx, buffer, trace);
                removed.emit(MmuEvent::NodeFreed { level });
            }
        }
        log::debug!(target: "mmu", "ctx {}: mmu {} destroyed", ctx, handle);
        Ok(())
    }

    /// Maps a buffer at `virt`. The range must be page aligned, inside the
    /// context's virtual span and free of existing mappings.
    pub(crate) fn map_device(
        &mut self,
        ctx: CtxHandle,
        handle: MmuHandle,
        buf: BufferId,
        virt: DeviceVirt,
        flags: MapFlags,
        trace: &mut dyn TraceSink,
    ) -> Result<MappingId> {
        // Phase A: heap policy for the mapped buffer and for tree nodes.
        let (heap_offset, heap_skip) = {
            let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            let buffer = ctx_ref.buffers.get(buf).ok_or(Error::InvalidArgument)?;
            let heap_ref = self.heaps.get(buffer.heap).ok_or(Error::InvalidArgument)?;
            if !heap_ref.device_mappable() {
                return Err(Error::InvalidArgument);
            }
            (heap_ref.device_offset(), heap_ref.skip_translation_offset())
        };
        let node_policy = {
            let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            let mmu_ctx = ctx_ref.mmu.get(handle).ok_or(Error::InvalidArgument)?;
            self.heaps
                .get(mmu_ctx.node_heap())
                .map(|h| (h.device_offset(), h.skip_translation_offset()))
        };

        // Phase B: validate the range and snapshot everything the commit
        // needs, without mutating the tree.
        let plan = {
            let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
            if ctx_ref.mappings.len() >= MAPPING_LIMIT {
                return Err(Error::OutOfMemory);
            }
            let ProcessContext {
                ref mut buffers,
                ref mut mmu,
                ref mut mappings,
                ..
            } = *ctx_ref;
            let mmu_ctx = mmu.get_mut(handle).ok_or(Error::InvalidArgument)?;
            if virt.raw() % DEVICE_PAGE_SIZE as u64 != 0 {
                return Err(Error::InvalidArgument);
            }
            let buffer = buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
            let pages = buffer.device_pages();
            if pages == 0 {
                return Err(Error::InvalidArgument);
            }
            let span = (pages * DEVICE_PAGE_SIZE) as u64;
            let end = virt.checked_add(span).ok_or(Error::InvalidArgument)?;
            if end.raw() > mmu_ctx.config.span() {
                return Err(Error::InvalidArgument);
            }
            for existing in &mmu_ctx.mappings {
                if let Some(mapping) = mappings.get(*existing) {
                    if mapping.overlaps(virt.raw(), span) {
                        return Err(Error::InvalidArgument);
                    }
                }
            }
            let skip_offset = heap_skip || mmu_ctx.config.bypass;
            let mut page_addrs = Vec::with_capacity(pages);
            for page in 0..pages {
                let phys = buffer.page_base(page).ok_or(Error::InvalidArgument)?;
                page_addrs.push(device_view(heap_offset, skip_offset, phys));
            }
            if mmu_ctx.config.bypass {
                let contiguous = page_addrs
                    .windows(2)
                    .all(|w| w[1] == w[0] + DEVICE_PAGE_SIZE as u64);
                if !contiguous {
                    return Err(Error::InvalidArgument);
                }
                let mapping = Mapping {
                    buffer: buf,
                    mmu: handle,
                    virt,
                    pages,
                    flags,
                    skip_offset,
                    promoted: None,
                };
                // Capacity pre-checked above; a full table cannot happen
                // while the lock is held.
                let Ok(id) = mappings.insert(mapping) else {
                    return Err(Error::OutOfMemory);
                };
                buffer.mappings.push(id);
                mmu_ctx.mappings.push(id);
                log::debug!(target: "mmu", "ctx {}: buffer {} bypass-mapped at {}", ctx, buf, virt);
                return Ok(id);
            }
            let tree = mmu_ctx.tree.as_ref().ok_or(Error::InvalidArgument)?;
            let (node_offset, node_skip) = node_policy.ok_or(Error::InvalidArgument)?;
            MapPlan {
                pages,
                page_addrs,
                missing: tree.missing_nodes(virt.raw(), pages),
                node_heap: mmu_ctx.node_heap,
                node_offset,
                node_skip,
                parity: mmu_ctx.config.parity,
                phys_width: mmu_ctx.config.phys_width,
                skip_offset,
            }
        };

        // Phase C: allocate the missing nodes. Failure unwinds them all.
        let mut new_nodes = Vec::with_capacity(plan.missing.len());
        for key in &plan.missing {
            match self.pt_node_alloc(ctx, plan.node_heap, trace) {
                Ok(grant) => new_nodes.push((*key, grant)),
                Err(err) => {
                    for (_, grant) in new_nodes {
                        self.pt_node_free(ctx, grant.buffer, trace);
                    }
                    return Err(err);
                }
            }
        }

        // Phase D: link nodes, write leaves, record the mapping.
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let ProcessContext {
            ref mut buffers,
            ref mut mmu,
            ref mut mappings,
            ..
        } = *ctx_ref;
        let mmu_ctx = mmu.get_mut(handle).ok_or(Error::InvalidArgument)?;
        let mut pending_events = Vec::new();
        {
            let tree = mmu_ctx.tree.as_mut().ok_or(Error::InvalidArgument)?;
            for (key, grant) in new_nodes {
                let slot = NodeSlot {
                    buffer: grant.buffer,
                    kva: grant.kva,
                    phys: grant.phys,
                    used: 0,
                };
                let child = device_view(plan.node_offset, plan.node_skip, slot.phys);
                let entry = encode_branch(child, plan.phys_width);
                match key {
                    NodeKey::Directory(ci) => {
                        unsafe { write_entry(tree.catalogue.kva, ci as usize, entry) };
                        trace.append(format_args!(
                            "MEMW {:#x} {:#x}",
                            tree.catalogue.phys + (ci as usize * ENTRY_SIZE) as u64,
                            entry
                        ));
                        tree.catalogue.used += 1;
                        tree.dirs.insert(ci, slot);
                    }
                    NodeKey::Table(ci, di) => {
                        let dir = tree.dirs.get_mut(&ci).ok_or(Error::InvalidArgument)?;
                        unsafe { write_entry(dir.kva, di as usize, entry) };
                        trace.append(format_args!(
                            "MEMW {:#x} {:#x}",
                            dir.phys + (di as usize * ENTRY_SIZE) as u64,
                            entry
                        ));
                        dir.used += 1;
                        tree.tables.insert((ci, di), slot);
                    }
                }
                pending_events.push(MmuEvent::NodeAllocated { level: key.level() });
            }
            for page in 0..plan.pages {
                let address = virt.raw() + (page * DEVICE_PAGE_SIZE) as u64;
                let (ci, di, ti) = level_indices(address);
                let table = tree
                    .tables
                    .get_mut(&(ci, di))
                    .ok_or(Error::InvalidArgument)?;
                let entry = encode_leaf(
                    address,
                    plan.page_addrs[page],
                    EntryFlags {
                        read_only: flags.contains(MapFlags::READ_ONLY),
                        cache: walker::EntryCache::Default,
                    },
                    plan.parity,
                    plan.phys_width,
                );
                debug_assert_eq!(
                    unsafe { read_entry(table.kva, ti as usize) },
                    0,
                    "mapping over a live entry"
                );
                unsafe { write_entry(table.kva, ti as usize, entry) };
                trace.append(format_args!(
                    "MEMW {:#x} {:#x}",
                    table.phys + (ti as usize * ENTRY_SIZE) as u64,
                    entry
                ));
                table.used += 1;
            }
        }
        let mapping = Mapping {
            buffer: buf,
            mmu: handle,
            virt,
            pages: plan.pages,
            flags,
            skip_offset: plan.skip_offset,
            promoted: None,
        };
        // Capacity pre-checked in phase B.
        let Ok(id) = mappings.insert(mapping) else {
            return Err(Error::OutOfMemory);
        };
        if let Some(buffer) = buffers.get_mut(buf) {
            buffer.mappings.push(id);
        }
        mmu_ctx.mappings.push(id);
        for event in pending_events {
            mmu_ctx.emit(event);
        }
        log::debug!(
            target: "mmu",
            "ctx {}: buffer {} mapped at {} ({} pages)",
            ctx,
            buf,
            virt,
            plan.pages
        );
        Ok(id)
    }

    /// Unmaps the mapping of `buf` inside `handle`.
    pub(crate) fn unmap_device(
        &mut self,
        ctx: CtxHandle,
        handle: MmuHandle,
        buf: BufferId,
        trace: &mut dyn TraceSink,
    ) -> Result<()> {
        let mapping = self
            .find_mapping(ctx, handle, buf)?
            .ok_or(Error::InvalidArgument)?;
        self.unmap_by_mapping(ctx, mapping, trace)
    }

    /// Core unmap: clears leaves, trims nodes whose last entry vanished,
    /// then frees those node buffers.
    pub(crate) fn unmap_by_mapping(
        &mut self,
        ctx: CtxHandle,
        mapping: MappingId,
        trace: &mut dyn TraceSink,
    ) -> Result<()> {
        let mut to_free: Vec<(TreeLevel, BufferId)> = Vec::new();
        let handle;
        {
            let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
            let ProcessContext {
                ref mut buffers,
                ref mut mmu,
                ref mut mappings,
                ..
            } = *ctx_ref;
            let record = mappings.remove(mapping).ok_or(Error::InvalidArgument)?;
            handle = record.mmu;
            let mmu_ctx = mmu.get_mut(record.mmu).ok_or(Error::InvalidArgument)?;
            mmu_ctx.mappings.retain(|m| *m != mapping);
            if let Some(buffer) = buffers.get_mut(record.buffer) {
                buffer.mappings.retain(|m| *m != mapping);
            }
            if let Some(tree) = mmu_ctx.tree.as_mut() {
                for page in 0..record.pages {
                    let address = record.virt.raw() + (page * DEVICE_PAGE_SIZE) as u64;
                    let (ci, di, ti) = level_indices(address);
                    let Some(table) = tree.tables.get_mut(&(ci, di)) else {
                        log::error!(target: "mmu", "ctx {}: table node missing at {:#x}", ctx, address);
                        continue;
                    };
                    unsafe { write_entry(table.kva, ti as usize, 0) };
                    trace.append(format_args!(
                        "MEMW {:#x} 0x0",
                        table.phys + (ti as usize * ENTRY_SIZE) as u64
                    ));
                    table.used -= 1;
                    if table.used != 0 {
                        continue;
                    }
                    // Last leaf gone: the table node goes, maybe its
                    // directory with it.
                    if let Some(slot) = tree.tables.remove(&(ci, di)) {
                        to_free.push((TreeLevel::Table, slot.buffer));
                    }
                    if let Some(dir) = tree.dirs.get_mut(&ci) {
                        unsafe { write_entry(dir.kva, di as usize, 0) };
                        trace.append(format_args!(
                            "MEMW {:#x} 0x0",
                            dir.phys + (di as usize * ENTRY_SIZE) as u64
                        ));
                        dir.used -= 1;
                        if dir.used == 0 {
                            if let Some(slot) = tree.dirs.remove(&ci) {
                                unsafe { write_entry(tree.catalogue.kva, ci as usize, 0) };
                                trace.append(format_args!(
                                    "MEMW {:#x} 0x0",
                                    tree.catalogue.phys + (ci as usize * ENTRY_SIZE) as u64
                                ));
                                tree.catalogue.used -= 1;
                                to_free.push((TreeLevel::Directory, slot.buffer));
                            }
                        }
                    }
                }
            }
        }
        for (_, buffer) in &to_free {
            self.pt_node_free(ctx, *buffer, trace);
        }
        if !to_free.is_empty() {
            if let Some(mmu_ctx) = self
                .contexts
                .get_mut(ctx)
                .and_then(|c| c.mmu.get_mut(handle))
            {
                for (level, _) in to_free {
                    mmu_ctx.emit(MmuEvent::NodeFreed { level });
                }
            }
        }
        Ok(())
    }

    /// Retargets one mapped page into the on-chip window. A page promoted
    /// earlier for the same mapping is restored first.
    pub(crate) fn promote_to_window(
        &mut self,
        ctx: CtxHandle,
        handle: MmuHandle,
        buf: BufferId,
        page_index: usize,
        window_offset: u64,
        trace: &mut dyn TraceSink,
    ) -> Result<()> {
        let mapping = self
            .find_mapping(ctx, handle, buf)?
            .ok_or(Error::InvalidArgument)?;
        let (heap_offset, heap_skip) = {
            let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            let buffer = ctx_ref.buffers.get(buf).ok_or(Error::InvalidArgument)?;
            let heap_ref = self.heaps.get(buffer.heap).ok_or(Error::InvalidArgument)?;
            (heap_ref.device_offset(), heap_ref.skip_translation_offset())
        };
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let ProcessContext {
            ref mut buffers,
            ref mut mmu,
            ref mut mappings,
            ..
        } = *ctx_ref;
        let mmu_ctx = mmu.get_mut(handle).ok_or(Error::InvalidArgument)?;
        let window = mmu_ctx.window.ok_or(Error::InvalidArgument)?;
        if window_offset % DEVICE_PAGE_SIZE as u64 != 0
            || window_offset + DEVICE_PAGE_SIZE as u64 > window.len
        {
            return Err(Error::InvalidArgument);
        }
        let record = mappings.get_mut(mapping).ok_or(Error::InvalidArgument)?;
        if page_index >= record.pages {
            return Err(Error::InvalidArgument);
        }
        let parity = mmu_ctx.config.parity;
        let phys_width = mmu_ctx.config.phys_width;
        let flags = EntryFlags {
            read_only: record.flags.contains(MapFlags::READ_ONLY),
            cache: walker::EntryCache::Default,
        };
        if let Some(tree) = mmu_ctx.tree.as_mut() {
            // Undo a previous promotion before moving the window user.
            if let Some((old_index, _)) = record.promoted {
                if old_index != page_index {
                    let buffer = buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
                    let phys = buffer.page_base(old_index).ok_or(Error::InvalidArgument)?;
                    let original = device_view(heap_offset, record.skip_offset || heap_skip, phys);
                    write_leaf_at(
                        tree,
                        record.virt.raw(),
                        old_index,
                        original,
                        flags,
                        parity,
                        phys_width,
                        trace,
                    )?;
                }
            }
            let target = window.base + window_offset;
            write_leaf_at(
                tree,
                record.virt.raw(),
                page_index,
                target,
                flags,
                parity,
                phys_width,
                trace,
            )?;
        }
        record.promoted = Some((page_index, window_offset));
        log::debug!(
            target: "mmu",
            "ctx {}: buffer {} page {} promoted to window offset {:#x}",
            ctx,
            buf,
            page_index,
            window_offset
        );
        Ok(())
    }

    /// Walks the live tree for `virt`. `Ok(None)` means not mapped; a
    /// corrupt entry is an error distinct from a miss.
    pub(crate) fn physical_for_virtual(
        &self,
        ctx: CtxHandle,
        handle: MmuHandle,
        virt: u64,
    ) -> Result<Option<u64>> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        let mmu_ctx = ctx_ref.mmu.get(handle).ok_or(Error::InvalidArgument)?;
        if virt >= mmu_ctx.config.span() {
            return Err(Error::InvalidArgument);
        }
        if mmu_ctx.config.bypass {
            for id in &mmu_ctx.mappings {
                let Some(mapping) = ctx_ref.mappings.get(*id) else {
                    continue;
                };
                if mapping.covers(virt) {
                    let delta = virt - mapping.virt.raw();
                    let page = (delta >> PAGE_SHIFT) as usize;
                    let Some(buffer) = ctx_ref.buffers.get(mapping.buffer) else {
                        continue;
                    };
                    let Some(base) = buffer.layout.page_base(page) else {
                        continue;
                    };
                    let offset_in_page = delta & (DEVICE_PAGE_SIZE as u64 - 1);
                    return Ok(Some(
                        base + offset_in_page + mmu_ctx.config.bypass_offset,
                    ));
                }
            }
            return Ok(None);
        }
        let Some(tree) = mmu_ctx.tree.as_ref() else {
            return Ok(None);
        };
        // The walk reads node memory the way the hardware does; the
        // software image only supplies the kernel view of each node.
        let (ci, di, ti) = level_indices(virt);
        let branch = unsafe { read_entry(tree.catalogue.kva, ci as usize) };
        if decode_branch(branch, mmu_ctx.config.phys_width).is_none() {
            return Ok(None);
        }
        let Some(dir) = tree.dirs.get(&ci) else {
            return Ok(None);
        };
        let branch = unsafe { read_entry(dir.kva, di as usize) };
        if decode_branch(branch, mmu_ctx.config.phys_width).is_none() {
            return Ok(None);
        }
        let Some(table) = tree.tables.get(&(ci, di)) else {
            return Ok(None);
        };
        let raw = unsafe { read_entry(table.kva, ti as usize) };
        match decode_leaf(raw, virt, mmu_ctx.config.parity, mmu_ctx.config.phys_width) {
            EntryRead::NotPresent => Ok(None),
            EntryRead::Corrupt => Err(Fault::CorruptEntry.into()),
            EntryRead::Mapped { phys, .. } => {
                Ok(Some(phys | (virt & (DEVICE_PAGE_SIZE as u64 - 1))))
            }
        }
    }

    /// Root pointer for the hardware, plus whether the walker is bypassed.
    pub(crate) fn catalogue_root(&self, ctx: CtxHandle, handle: MmuHandle) -> Result<(u64, bool)> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        let mmu_ctx = ctx_ref.mmu.get(handle).ok_or(Error::InvalidArgument)?;
        if mmu_ctx.config.bypass {
            return Ok((0, true));
        }
        let tree = mmu_ctx.tree.as_ref().ok_or(Error::InvalidArgument)?;
        let (offset, skip) = self
            .heaps
            .get(mmu_ctx.node_heap)
            .map(|h| (h.device_offset(), h.skip_translation_offset()))
            .ok_or(Error::InvalidArgument)?;
        Ok((device_view(offset, skip, tree.catalogue.phys), false))
    }

    /// Address to program into a hardware slot for `buf[offset..offset+len]`.
    pub(crate) fn device_address(
        &self,
        ctx: CtxHandle,
        handle: MmuHandle,
        buf: BufferId,
        offset: u64,
        len: u64,
    ) -> Result<u64> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        let mmu_ctx = ctx_ref.mmu.get(handle).ok_or(Error::InvalidArgument)?;
        let mapping = mmu_ctx
            .mappings
            .iter()
            .filter_map(|id| ctx_ref.mappings.get(*id))
            .find(|m| m.buffer == buf)
            .ok_or(Error::InvalidArgument)?;
        let span = (mapping.pages * DEVICE_PAGE_SIZE) as u64;
        let end = offset.checked_add(len).ok_or(Error::InvalidArgument)?;
        if len == 0 || end > span {
            return Err(Error::InvalidArgument);
        }
        if !mmu_ctx.config.bypass {
            return Ok(mapping.virt.raw() + offset);
        }
        // Bypass: hardware sees physical addresses. A promoted first page
        // redirects into the on-chip window.
        if let (Some((0, window_offset)), Some(window)) = (mapping.promoted, mmu_ctx.window) {
            return Ok(window.base + window_offset + offset);
        }
        let buffer = ctx_ref
            .buffers
            .get(mapping.buffer)
            .ok_or(Error::InvalidArgument)?;
        let base = buffer.layout.page_base(0).ok_or(Error::InvalidArgument)?;
        Ok(base + mmu_ctx.config.bypass_offset + offset)
    }

    fn find_mapping(
        &self,
        ctx: CtxHandle,
        handle: MmuHandle,
        buf: BufferId,
    ) -> Result<Option<MappingId>> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        let mmu_ctx = ctx_ref.mmu.get(handle).ok_or(Error::InvalidArgument)?;
        Ok(mmu_ctx
            .mappings
            .iter()
            .copied()
            .find(|id| {
                ctx_ref
                    .mappings
                    .get(*id)
                    .map(|m| m.buffer == buf)
                    .unwrap_or(false)
            }))
    }
}

/// Rewrites the leaf for page `page_index` of the mapping at `virt_base`.
#[allow(clippy::too_many_arguments)]
fn write_leaf_at(
    tree: &mut PageTree,
    virt_base: u64,
    page_index: usize,
    phys: u64,
    flags: EntryFlags,
    parity: bool,
    phys_width: u8,
    trace: &mut dyn TraceSink,
) -> Result<()> {
    let address = virt_base + (page_index * DEVICE_PAGE_SIZE) as u64;
    let (ci, di, ti) = level_indices(address);
    let table = tree
        .tables
        .get_mut(&(ci, di))
        .ok_or(Error::InvalidArgument)?;
    let entry = encode_leaf(address, phys, flags, parity, phys_width);
    unsafe { write_entry(table.kva, ti as usize, entry) };
    trace.append(format_args!(
        "MEMW {:#x} {:#x}",
        table.phys + (ti as usize * ENTRY_SIZE) as u64,
        entry
    ));
    Ok(())
}
