// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Capture trace for offline replay.
//!
//! When a sink is attached the driver appends one line per register access,
//! translation-entry write and allocation event. Verification rigs feed the
//! capture to a hardware model to replay a session without the host stack.
//! The sink is write-only from the driver's point of view; draining it is
//! the harness's business.
//!
//! Line grammar, one record per line:
//!
//! ```text
//! WRW <offset> <value>     register write
//! RDW <offset> <value>     register read
//! MEMW <phys> <value>      translation-entry write
//! ALLOC <phys> <len>       backing memory handed to the device
//! FREE <phys>              backing memory reclaimed
//! ```

use alloc::fmt;
use alloc::string::String;
use alloc::vec::Vec;

pub trait TraceSink {
    fn append(&mut self, record: fmt::Arguments<'_>);
}

/// Discards every record. The default sink.
#[derive(Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    #[inline]
    fn append(&mut self, _record: fmt::Arguments<'_>) {}
}

/// Collects records in memory.
#[derive(Default)]
pub struct VecSink {
    records: Vec<String>,
}

impl VecSink {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }

    pub fn take_records(&mut self) -> Vec<String> {
        core::mem::take(&mut self.records)
    }
}

impl TraceSink for VecSink {
    fn append(&mut self, record: fmt::Arguments<'_>) {
        self.records.push(fmt::format(record));
    }
}
