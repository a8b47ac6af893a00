// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Buffer objects.
//!
//! A buffer is backing memory allocated from (or imported into) one heap,
//! owned by one process context. Besides the physical layout it tracks the
//! optional kernel mapping, the optional user-space window, every device
//! mapping referencing it, its fill state and an optional fence to signal
//! when the device finishes writing it.

use alloc::boxed::Box;
use alloc::vec::Vec;

use axon_hal::Fence;

use crate::mm::heap::{BufferAttrs, BufferPayload, PhysLayout};
use crate::types::{HeapHandle, MappingId};

/// Whether the producer has populated the buffer yet. Submissions whose
/// inputs are still `Empty` stay queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillState {
    Empty,
    Filled,
}

/// User-space window a buffer is mapped into.
#[derive(Clone, Copy, Debug)]
pub struct UserWindow {
    pub base: usize,
    pub len: usize,
    /// Set by the first page fault; cleared again on unmap.
    pub touched: bool,
}

/// Position cache for segment layouts: resolving page `k + 1` right after
/// page `k` must not rescan the segment list.
#[derive(Clone, Copy, Debug, Default)]
struct PageCursor {
    segment: usize,
    first_page_of_segment: usize,
}

pub struct Buffer {
    pub heap: HeapHandle,
    pub requested_size: usize,
    pub actual_size: usize,
    pub attrs: BufferAttrs,
    pub payload: BufferPayload,
    pub layout: PhysLayout,
    pub kernel_va: Option<usize>,
    pub user: Option<UserWindow>,
    pub mappings: Vec<MappingId>,
    pub fill: FillState,
    pub fence: Option<Box<dyn Fence + Send>>,
    pub export_token: Option<u64>,
    cursor: PageCursor,
}

impl Buffer {
    pub fn new(
        heap: HeapHandle,
        requested_size: usize,
        actual_size: usize,
        attrs: BufferAttrs,
        payload: BufferPayload,
        layout: PhysLayout,
    ) -> Self {
        Self {
            heap,
            requested_size,
            actual_size,
            attrs,
            payload,
            layout,
            kernel_va: None,
            user: None,
            mappings: Vec::new(),
            fill: FillState::Empty,
            fence: None,
            export_token: None,
            cursor: PageCursor::default(),
        }
    }

    /// Number of device pages covered by `actual_size`.
    pub fn device_pages(&self) -> usize {
        self.actual_size / crate::DEVICE_PAGE_SIZE
    }

    /// Physical base of device page `index`, cached for sequential walks.
    pub fn page_base(&mut self, index: usize) -> Option<u64> {
        match &self.layout {
            PhysLayout::Pages(pages) => pages.get(index).copied(),
            PhysLayout::Segments(segments) => {
                let page_size = crate::DEVICE_PAGE_SIZE;
                let mut segment = self.cursor.segment;
                let mut first = self.cursor.first_page_of_segment;
                if index < first || segment >= segments.len() {
                    segment = 0;
                    first = 0;
                }
                while segment < segments.len() {
                    let pages_here = segments[segment].len as usize / page_size;
                    if index < first + pages_here {
                        self.cursor = PageCursor {
                            segment,
                            first_page_of_segment: first,
                        };
                        return Some(
                            segments[segment].base + ((index - first) * page_size) as u64,
                        );
                    }
                    first += pages_here;
                    segment += 1;
                }
                None
            }
        }
    }

    pub fn is_mapped_to_device(&self) -> bool {
        !self.mappings.is_empty()
    }

    /// Takes the fence for signalling after device writes complete.
    pub fn take_fence(&mut self) -> Option<Box<dyn Fence + Send>> {
        self.fence.take()
    }
}
