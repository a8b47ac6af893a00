// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory manager.
//!
//! One `MemoryState` sits behind the device's outermost lock and owns the
//! platform backend, the registered heaps and every process context. All
//! buffer lifecycle paths run here; the translation ops in [`crate::mmu`]
//! are implemented on the same state because table nodes are ordinary
//! buffers with node accounting.
//!
//! Failure paths release in strict reverse order of acquisition, so a
//! half-built buffer never leaks granules and a full handle table never
//! strands an allocation.

pub mod buffer;
pub mod context;
pub mod heap;

#[cfg(test)]
mod tests_prop;

use alloc::boxed::Box;
use alloc::vec::Vec;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

use axon_hal::{Fence, MemoryBackend, SyncDirection};

use crate::error::{Error, Result};
use crate::mm::buffer::{Buffer, FillState, UserWindow};
use crate::mm::context::ProcessContext;
use crate::mm::heap::{BufferAttrs, BufferPayload, Heap, HeapConfig};
use crate::pdump::TraceSink;
use crate::table::SlotTable;
use crate::types::{BufferId, CtxHandle, HeapHandle};
use crate::DEVICE_PAGE_SIZE;

/// Registered heaps per device.
pub(crate) const HEAP_LIMIT: usize = 32;
/// Live process contexts per device.
pub(crate) const CTX_LIMIT: usize = 64;

#[cfg(feature = "failpoints")]
static DENY_NEXT_ALLOC: AtomicBool = AtomicBool::new(false);

/// Byte usage of one process context, buffers and table nodes apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub buffer_current: u64,
    pub buffer_peak: u64,
    pub node_current: u64,
    pub node_peak: u64,
}

/// A freshly allocated, kernel-mapped, zeroed translation node.
pub(crate) struct NodeGrant {
    pub buffer: BufferId,
    pub kva: usize,
    pub phys: u64,
}

pub(crate) fn round_up(value: usize, align: usize) -> Option<usize> {
    let sum = value.checked_add(align - 1)?;
    Some(sum - sum % align)
}

pub(crate) struct MemoryState<M> {
    pub(crate) backend: M,
    pub(crate) heaps: SlotTable<HeapHandle, Heap>,
    pub(crate) contexts: SlotTable<CtxHandle, ProcessContext>,
    pub(crate) host_page: usize,
}

impl<M: MemoryBackend> MemoryState<M> {
    pub(crate) fn new(backend: M, host_page: usize) -> Result<Self> {
        if !host_page.is_power_of_two() || host_page < DEVICE_PAGE_SIZE {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            backend,
            heaps: SlotTable::bounded(HEAP_LIMIT),
            contexts: SlotTable::bounded(CTX_LIMIT),
            host_page,
        })
    }

    pub(crate) fn register_heap(&mut self, config: HeapConfig) -> Result<HeapHandle> {
        let heap = Heap::new(config)?;
        match self.heaps.insert(heap) {
            Ok(handle) => {
                log::info!(target: "mm", "heap {} registered ({:?})", handle, config.kind);
                Ok(handle)
            }
            Err(_) => Err(Error::OutOfMemory),
        }
    }

    /// Refused while any context still holds memory from the heap; the
    /// check is a scan, heaps carry no reference count.
    pub(crate) fn unregister_heap(&mut self, heap: HeapHandle) -> Result<()> {
        if !self.heaps.contains(heap) {
            return Err(Error::InvalidArgument);
        }
        if !self.contexts.iter().all(|(_, ctx)| ctx.heap_idle(heap)) {
            return Err(Error::Busy);
        }
        self.heaps.remove(heap);
        log::info!(target: "mm", "heap {} unregistered", heap);
        Ok(())
    }

    pub(crate) fn set_heap_offset(&mut self, heap: HeapHandle, offset: u64) -> Result<()> {
        self.heaps
            .get_mut(heap)
            .ok_or(Error::InvalidArgument)?
            .set_offset(offset)
    }

    pub(crate) fn create_context(&mut self) -> Result<CtxHandle> {
        match self.contexts.insert(ProcessContext::new()) {
            Ok(handle) => {
                log::debug!(target: "mm", "ctx {} created", handle);
                Ok(handle)
            }
            Err(_) => Err(Error::OutOfMemory),
        }
    }

    /// Force-teardown: translation contexts go first (their mappings and
    /// nodes die with them), then surviving buffers. Leaks are reported,
    /// never kept.
    pub(crate) fn destroy_context(
        &mut self,
        ctx: CtxHandle,
        trace: &mut dyn TraceSink,
    ) -> Result<()> {
        let (mmu_handles, live_buffers) = {
            let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            (ctx_ref.mmu.handles(), ctx_ref.buffers.len())
        };
        if !mmu_handles.is_empty() || live_buffers != 0 {
            log::warn!(
                target: "mm",
                "ctx {}: tearing down {} mmu contexts, {} buffers",
                ctx,
                mmu_handles.len(),
                live_buffers
            );
        }
        for handle in mmu_handles {
            if let Err(err) = self.destroy_mmu_context(ctx, handle, trace) {
                log::error!(target: "mm", "ctx {}: mmu {} teardown failed: {}", ctx, handle, err);
            }
        }
        let remaining = self
            .contexts
            .get(ctx)
            .map(|c| c.buffers.handles())
            .unwrap_or_default();
        for id in remaining {
            if let Err(err) = self.release_buffer(ctx, id, trace) {
                log::error!(target: "mm", "ctx {}: buffer {} teardown failed: {}", ctx, id, err);
            }
        }
        if let Some(ctx_ref) = self.contexts.remove(ctx) {
            if ctx_ref.usage.current() != 0 || ctx_ref.mmu_usage.current() != 0 {
                log::error!(
                    target: "mm",
                    "ctx {}: {} buffer bytes, {} node bytes leaked",
                    ctx,
                    ctx_ref.usage.current(),
                    ctx_ref.mmu_usage.current()
                );
            }
        }
        log::debug!(target: "mm", "ctx {} destroyed", ctx);
        Ok(())
    }

    pub(crate) fn allocate(
        &mut self,
        ctx: CtxHandle,
        heap: HeapHandle,
        size: usize,
        attrs: BufferAttrs,
        trace: &mut dyn TraceSink,
    ) -> Result<BufferId> {
        self.allocate_with(ctx, heap, size, attrs, trace)
    }

    pub(crate) fn import(
        &mut self,
        ctx: CtxHandle,
        heap: HeapHandle,
        size: usize,
        attrs: BufferAttrs,
        token: u64,
        trace: &mut dyn TraceSink,
    ) -> Result<BufferId> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let attrs = attrs.normalized()?;
        if !self.contexts.contains(ctx) {
            return Err(Error::InvalidArgument);
        }
        let host_page = self.host_page;
        let actual =
            round_up(size, DEVICE_PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        let heap_ref = self.heaps.get_mut(heap).ok_or(Error::InvalidArgument)?;
        let (payload, layout) = heap_ref.import(actual, host_page, token, &mut self.backend)?;
        trace_payload_alloc(trace, &payload, &layout);
        let buffer = Buffer::new(heap, size, actual, attrs, payload, layout);
        self.adopt_buffer(ctx, heap, buffer, trace)
    }

    pub(crate) fn export(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<u64> {
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
        if buffer.export_token.is_some() {
            return Err(Error::Busy);
        }
        let heap_ref = self.heaps.get(buffer.heap).ok_or(Error::InvalidArgument)?;
        let token = heap_ref.export(&buffer.layout, &mut self.backend)?;
        buffer.export_token = Some(token);
        Ok(token)
    }

    /// Frees a buffer, tearing down any device mappings first. Buffers
    /// serving as live translation nodes refuse to go; their translation
    /// context owns them.
    pub(crate) fn free(
        &mut self,
        ctx: CtxHandle,
        buf: BufferId,
        trace: &mut dyn TraceSink,
    ) -> Result<()> {
        {
            let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            if !ctx_ref.buffers.contains(buf) {
                return Err(Error::InvalidArgument);
            }
            if ctx_ref.mmu.iter().any(|(_, mmu)| mmu.owns_node(buf)) {
                return Err(Error::Busy);
            }
        }
        self.release_buffer(ctx, buf, trace)
    }

    pub(crate) fn map_kernel(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<usize> {
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
        if let Some(kva) = buffer.kernel_va {
            return Ok(kva);
        }
        let segments = buffer.layout.sync_segments();
        let kva = self
            .backend
            .map_kernel(&segments)
            .ok_or(Error::OutOfMemory)?;
        buffer.kernel_va = Some(kva);
        Ok(kva)
    }

    pub(crate) fn unmap_kernel(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
        let kva = buffer.kernel_va.take().ok_or(Error::InvalidArgument)?;
        self.backend.unmap_kernel(kva);
        Ok(())
    }

    pub(crate) fn map_user(
        &mut self,
        ctx: CtxHandle,
        buf: BufferId,
        base: usize,
        len: usize,
    ) -> Result<()> {
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
        if len == 0 || len > buffer.actual_size {
            return Err(Error::InvalidArgument);
        }
        if buffer.user.is_some() {
            return Err(Error::Busy);
        }
        buffer.user = Some(UserWindow {
            base,
            len,
            touched: false,
        });
        Ok(())
    }

    /// First user access to the window; makes device writes visible before
    /// the client reads them.
    pub(crate) fn note_user_fault(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        let touched = {
            let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
            let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
            let window = buffer.user.as_mut().ok_or(Error::InvalidArgument)?;
            core::mem::replace(&mut window.touched, true)
        };
        if !touched {
            self.sync_buffer(ctx, buf, SyncDirection::ToHost)?;
        }
        Ok(())
    }

    /// Window teardown. A touched window gets its dirty lines flushed so the
    /// device reads what the client last wrote.
    pub(crate) fn note_user_unmap(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        let touched = {
            let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
            let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
            let window = buffer.user.take().ok_or(Error::InvalidArgument)?;
            window.touched
        };
        if touched {
            self.sync_buffer(ctx, buf, SyncDirection::ToDevice)?;
        }
        Ok(())
    }

    pub(crate) fn sync_to_device(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.sync_buffer(ctx, buf, SyncDirection::ToDevice)
    }

    pub(crate) fn sync_to_host(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        self.sync_buffer(ctx, buf, SyncDirection::ToHost)
    }

    /// Producer hand-off: the buffer's contents are ready for the device.
    /// Cached heaps get flushed here so dispatch never reads stale lines.
    pub(crate) fn mark_filled(&mut self, ctx: CtxHandle, buf: BufferId) -> Result<()> {
        {
            let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
            let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
            buffer.fill = FillState::Filled;
        }
        self.sync_buffer(ctx, buf, SyncDirection::ToDevice)
    }

    /// Arms a fence to be signalled when the device next hands this buffer
    /// back as an output. Replaces any fence already armed.
    pub(crate) fn attach_fence(
        &mut self,
        ctx: CtxHandle,
        buf: BufferId,
        fence: Box<dyn Fence + Send>,
    ) -> Result<()> {
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
        buffer.fence = Some(fence);
        Ok(())
    }

    pub(crate) fn buffer_filled(&self, ctx: CtxHandle, buf: BufferId) -> Result<bool> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get(buf).ok_or(Error::InvalidArgument)?;
        Ok(buffer.fill == FillState::Filled)
    }

    /// Completion hand-back for an output buffer: invalidate host caches,
    /// mark it filled, surface the fence for signalling outside the lock.
    pub(crate) fn post_output(
        &mut self,
        ctx: CtxHandle,
        buf: BufferId,
    ) -> Result<Option<Box<dyn Fence + Send>>> {
        self.sync_buffer(ctx, buf, SyncDirection::ToHost)?;
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get_mut(buf).ok_or(Error::InvalidArgument)?;
        buffer.fill = FillState::Filled;
        Ok(buffer.take_fence())
    }

    /// Validates one submission buffer reference without touching it.
    pub(crate) fn validate_ref(
        &self,
        ctx: CtxHandle,
        buf: BufferId,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get(buf).ok_or(Error::InvalidArgument)?;
        let end = offset.checked_add(len).ok_or(Error::InvalidArgument)?;
        if len == 0 || end > buffer.actual_size as u64 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub(crate) fn usage(&self, ctx: CtxHandle) -> Result<UsageSnapshot> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        Ok(UsageSnapshot {
            buffer_current: ctx_ref.usage.current(),
            buffer_peak: ctx_ref.usage.peak(),
            node_current: ctx_ref.mmu_usage.current(),
            node_peak: ctx_ref.mmu_usage.peak(),
        })
    }

    /// Allocates, kernel-maps and zeroes one translation node.
    pub(crate) fn pt_node_alloc(
        &mut self,
        ctx: CtxHandle,
        heap: HeapHandle,
        trace: &mut dyn TraceSink,
    ) -> Result<NodeGrant> {
        let attrs = BufferAttrs::PAGE_TABLE | BufferAttrs::UNCACHED;
        let buffer = self.allocate_with(ctx, heap, DEVICE_PAGE_SIZE, attrs, trace)?;
        let kva = match self.map_kernel(ctx, buffer) {
            Ok(kva) => kva,
            Err(err) => {
                let _ = self.release_buffer(ctx, buffer, trace);
                return Err(err);
            }
        };
        let phys = self
            .contexts
            .get_mut(ctx)
            .and_then(|c| c.buffers.get_mut(buffer))
            .and_then(|b| b.page_base(0));
        let Some(phys) = phys else {
            let _ = self.release_buffer(ctx, buffer, trace);
            return Err(Error::InvalidArgument);
        };
        // A stale entry in a fresh node would be walked by hardware.
        unsafe { crate::mmu::walker::zero_node(kva) };
        Ok(NodeGrant { buffer, kva, phys })
    }

    pub(crate) fn pt_node_free(
        &mut self,
        ctx: CtxHandle,
        buffer: BufferId,
        trace: &mut dyn TraceSink,
    ) {
        if let Err(err) = self.release_buffer(ctx, buffer, trace) {
            log::error!(target: "mm", "ctx {}: node buffer {} free failed: {}", ctx, buffer, err);
        }
    }

    fn allocate_with(
        &mut self,
        ctx: CtxHandle,
        heap: HeapHandle,
        size: usize,
        attrs: BufferAttrs,
        trace: &mut dyn TraceSink,
    ) -> Result<BufferId> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        #[cfg(feature = "failpoints")]
        if DENY_NEXT_ALLOC.swap(false, Ordering::SeqCst) {
            return Err(Error::OutOfMemory);
        }
        let attrs = attrs.normalized()?;
        if !self.contexts.contains(ctx) {
            return Err(Error::InvalidArgument);
        }
        let host_page = self.host_page;
        let heap_ref = self.heaps.get_mut(heap).ok_or(Error::InvalidArgument)?;
        let granule = heap_ref.granule(attrs, host_page);
        let actual = round_up(size, granule).ok_or(Error::InvalidArgument)?;
        let (payload, layout) = heap_ref.allocate(actual, attrs, host_page, &mut self.backend)?;
        trace_payload_alloc(trace, &payload, &layout);
        let buffer = Buffer::new(heap, size, actual, attrs, payload, layout);
        self.adopt_buffer(ctx, heap, buffer, trace)
    }

    /// Inserts a built buffer into its context, charging the right meter.
    /// A full table unwinds the backing memory before reporting failure.
    fn adopt_buffer(
        &mut self,
        ctx: CtxHandle,
        heap: HeapHandle,
        buffer: Buffer,
        trace: &mut dyn TraceSink,
    ) -> Result<BufferId> {
        let actual = buffer.actual_size as u64;
        let attrs = buffer.attrs;
        let Some(ctx_ref) = self.contexts.get_mut(ctx) else {
            self.discard_payload(heap, buffer.payload, trace);
            return Err(Error::InvalidArgument);
        };
        match ctx_ref.buffers.insert(buffer) {
            Ok(id) => {
                if attrs.contains(BufferAttrs::PAGE_TABLE) {
                    ctx_ref.mmu_usage.charge(actual);
                } else {
                    ctx_ref.usage.charge(actual);
                }
                log::debug!(target: "mm", "ctx {}: buffer {} holds {} bytes from heap {}", ctx, id, actual, heap);
                Ok(id)
            }
            Err(buffer) => {
                self.discard_payload(heap, buffer.payload, trace);
                Err(Error::OutOfMemory)
            }
        }
    }

    fn discard_payload(
        &mut self,
        heap: HeapHandle,
        payload: BufferPayload,
        trace: &mut dyn TraceSink,
    ) {
        trace_payload_free(trace, &payload);
        if let Some(heap_ref) = self.heaps.get_mut(heap) {
            heap_ref.release(payload, &mut self.backend);
        }
    }

    /// Teardown core shared by `free`, node frees and context destruction.
    pub(crate) fn release_buffer(
        &mut self,
        ctx: CtxHandle,
        buf: BufferId,
        trace: &mut dyn TraceSink,
    ) -> Result<()> {
        let mapping_ids = {
            let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
            let buffer = ctx_ref.buffers.get(buf).ok_or(Error::InvalidArgument)?;
            buffer.mappings.clone()
        };
        for mapping in mapping_ids {
            if let Err(err) = self.unmap_by_mapping(ctx, mapping, trace) {
                log::warn!(target: "mm", "ctx {}: mapping teardown failed: {}", ctx, err);
            }
        }
        let ctx_ref = self.contexts.get_mut(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.remove(buf).ok_or(Error::InvalidArgument)?;
        if let Some(kva) = buffer.kernel_va {
            self.backend.unmap_kernel(kva);
        }
        if buffer.user.is_some() {
            log::warn!(target: "mm", "ctx {}: buffer {} freed while user-mapped", ctx, buf);
        }
        if let Some(token) = buffer.export_token {
            self.backend.release_export(token);
        }
        if buffer.attrs.contains(BufferAttrs::PAGE_TABLE) {
            ctx_ref.mmu_usage.release(buffer.actual_size as u64);
        } else {
            ctx_ref.usage.release(buffer.actual_size as u64);
        }
        trace_payload_free(trace, &buffer.payload);
        if let Some(heap_ref) = self.heaps.get_mut(buffer.heap) {
            heap_ref.release(buffer.payload, &mut self.backend);
        } else {
            log::error!(target: "mm", "ctx {}: buffer {} outlived heap {}", ctx, buf, buffer.heap);
        }
        Ok(())
    }

    fn sync_buffer(&mut self, ctx: CtxHandle, buf: BufferId, dir: SyncDirection) -> Result<()> {
        let ctx_ref = self.contexts.get(ctx).ok_or(Error::InvalidArgument)?;
        let buffer = ctx_ref.buffers.get(buf).ok_or(Error::InvalidArgument)?;
        let heap_ref = self.heaps.get(buffer.heap).ok_or(Error::InvalidArgument)?;
        if heap_ref.needs_cache_sync(buffer.attrs) {
            let segments = buffer.layout.sync_segments();
            self.backend.sync(&segments, dir);
        }
        Ok(())
    }
}

fn trace_payload_alloc(
    trace: &mut dyn TraceSink,
    payload: &BufferPayload,
    layout: &heap::PhysLayout,
) {
    match payload {
        BufferPayload::Granules(granules) => {
            for granule in granules {
                trace.append(format_args!("ALLOC {:#x} {:#x}", granule.base, granule.len));
            }
        }
        BufferPayload::Region(segment) => {
            trace.append(format_args!("ALLOC {:#x} {:#x}", segment.base, segment.len));
        }
        BufferPayload::Imported { .. } => {
            for segment in layout.sync_segments() {
                trace.append(format_args!("ALLOC {:#x} {:#x}", segment.base, segment.len));
            }
        }
    }
}

fn trace_payload_free(trace: &mut dyn TraceSink, payload: &BufferPayload) {
    match payload {
        BufferPayload::Granules(granules) => {
            for granule in granules {
                trace.append(format_args!("FREE {:#x}", granule.base));
            }
        }
        BufferPayload::Region(segment) => {
            trace.append(format_args!("FREE {:#x}", segment.base));
        }
        BufferPayload::Imported { token } => {
            trace.append(format_args!("FREE {:#x}", token));
        }
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::DENY_NEXT_ALLOC;
    use core::sync::atomic::Ordering;

    /// Forces the next buffer or node allocation to fail with
    /// [`crate::Error::OutOfMemory`].
    pub fn deny_next_alloc() {
        DENY_NEXT_ALLOC.store(true, Ordering::SeqCst);
    }
}
