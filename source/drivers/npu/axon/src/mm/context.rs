// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-client process contexts.
//!
//! A process context owns every buffer, device mapping and translation
//! context a client creates, plus two usage meters: one for ordinary
//! buffer bytes and one for translation-table nodes. The meters are split
//! because node memory is driver overhead a client never asked for by
//! name; accounting it separately keeps quota decisions honest.

use crate::mm::buffer::Buffer;
use crate::mmu::{Mapping, MmuContext};
use crate::table::SlotTable;
use crate::types::{BufferId, MappingId, MmuHandle};

/// Live buffers per context.
pub const BUFFER_LIMIT: usize = 4096;
/// Translation contexts per context.
pub const MMU_CTX_LIMIT: usize = 8;
/// Device mappings per context.
pub const MAPPING_LIMIT: usize = 4096;

/// Current/peak byte meter.
#[derive(Clone, Copy, Debug, Default)]
pub struct UsageCounters {
    current: u64,
    peak: u64,
}

impl UsageCounters {
    pub fn charge(&mut self, bytes: u64) {
        self.current += bytes;
        if self.current > self.peak {
            self.peak = self.current;
        }
    }

    pub fn release(&mut self, bytes: u64) {
        if bytes > self.current {
            log::error!(target: "mm", "usage underflow: releasing {} of {}", bytes, self.current);
            self.current = 0;
        } else {
            self.current -= bytes;
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }
}

pub struct ProcessContext {
    pub buffers: SlotTable<BufferId, Buffer>,
    pub mmu: SlotTable<MmuHandle, MmuContext>,
    pub mappings: SlotTable<MappingId, Mapping>,
    pub usage: UsageCounters,
    pub mmu_usage: UsageCounters,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self {
            buffers: SlotTable::bounded(BUFFER_LIMIT),
            mmu: SlotTable::bounded(MMU_CTX_LIMIT),
            mappings: SlotTable::bounded(MAPPING_LIMIT),
            usage: UsageCounters::default(),
            mmu_usage: UsageCounters::default(),
        }
    }

    /// True when nothing in the context references `heap` any more.
    pub fn heap_idle(&self, heap: crate::types::HeapHandle) -> bool {
        self.buffers.iter().all(|(_, buffer)| buffer.heap != heap)
            && self.mmu.iter().all(|(_, ctx)| ctx.node_heap() != heap)
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}
