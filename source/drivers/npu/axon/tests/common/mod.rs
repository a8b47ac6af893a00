// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared harness for the driver integration tests.
//!
//! Models the platform around one [`Device`]: a register file with
//! write-one-to-clear interrupt status and a write log, a memory backend
//! that hands out gapped granules and backs kernel mappings with real
//! host memory (so translation-entry writes are observable and
//! corruptible), a settable clock and a boolean fence. Everything is
//! `Rc`-shared so the test keeps a handle to what the device owns.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axon_hal::{Bus, Clock, Fence, MemoryBackend, PhysSegment, SyncDirection};
use npu_axon::mm::heap::{HeapConfig, HeapKind};
use npu_axon::pdump::VecSink;
use npu_axon::regs::{
    self, IrqBits, REG_CYCLES_HI, REG_CYCLES_LO, REG_FAULT_ADDR_HI, REG_FAULT_ADDR_LO,
    REG_FAULT_STATUS, REG_IRQ_STATUS, REG_KICK_COUNT, REG_RESULT_HASH,
};
use npu_axon::types::HeapHandle;
use npu_axon::{Device, DeviceConfig};

/// Register window size in 32-bit words.
const REG_WORDS: usize = 0x200 / 4;

/// Pool window used by carveout heaps in the tests.
pub const CARVEOUT_BASE: u64 = 0x8000_0000;
/// First granule the backend hands out.
pub const GRANULE_BASE: u64 = 0xa000_0000;

pub type TestDevice = Device<TestBus, TestMemory, TestClock, VecSink>;

struct BusInner {
    regs: [u32; REG_WORDS],
    writes: Vec<(usize, u32)>,
}

/// Register file shared between the device and the test.
///
/// [`regs::REG_IRQ_STATUS`] is write-one-to-clear like the hardware;
/// every other write stores. All writes are logged in order.
#[derive(Clone)]
pub struct TestBus {
    inner: Rc<RefCell<BusInner>>,
}

impl TestBus {
    pub fn new() -> Self {
        let mut regs = [0u32; REG_WORDS];
        regs[regs::REG_IDENTITY / 4] = regs::AXON_IDENTITY;
        regs[regs::REG_REVISION / 4] = 0x10;
        Self {
            inner: Rc::new(RefCell::new(BusInner {
                regs,
                writes: Vec::new(),
            })),
        }
    }

    pub fn set(&self, offset: usize, value: u32) {
        self.inner.borrow_mut().regs[offset / 4] = value;
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.inner.borrow().regs[offset / 4]
    }

    /// Drains the write log.
    pub fn take_writes(&self) -> Vec<(usize, u32)> {
        std::mem::take(&mut self.inner.borrow_mut().writes)
    }

    /// Values written to `offset` since the last drain, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.inner
            .borrow()
            .writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Models one finished hardware pass: latches the cycle count and
    /// result hash, bumps the kick counter (low byte only, wrapping) and
    /// raises the completion interrupt.
    pub fn complete_pass(&self, cycles: u64, hash: u32) {
        let mut inner = self.inner.borrow_mut();
        inner.regs[REG_CYCLES_LO / 4] = cycles as u32;
        inner.regs[REG_CYCLES_HI / 4] = (cycles >> 32) as u32;
        inner.regs[REG_RESULT_HASH / 4] = hash;
        inner.regs[REG_KICK_COUNT / 4] = (inner.regs[REG_KICK_COUNT / 4] + 1) & 0xff;
        inner.regs[REG_IRQ_STATUS / 4] |= IrqBits::COMPLETE.bits();
    }

    /// Models a hardware fault: latches the fault address and the
    /// attribution bit, then raises `bits`.
    pub fn raise_fault(&self, bits: IrqBits, address: u64, external: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.regs[REG_FAULT_ADDR_LO / 4] = address as u32;
        inner.regs[REG_FAULT_ADDR_HI / 4] = (address >> 32) as u32;
        inner.regs[REG_FAULT_STATUS / 4] = if external { regs::FAULT_EXTERNAL } else { 0 };
        inner.regs[REG_IRQ_STATUS / 4] |= bits.bits();
    }
}

impl Bus for TestBus {
    fn read(&self, offset: usize) -> u32 {
        self.inner.borrow().regs[offset / 4]
    }

    fn write(&self, offset: usize, value: u32) {
        let mut inner = self.inner.borrow_mut();
        inner.writes.push((offset, value));
        if offset == REG_IRQ_STATUS {
            inner.regs[offset / 4] &= !value;
        } else {
            inner.regs[offset / 4] = value;
        }
    }
}

struct KernelMap {
    /// Real host memory behind the mapping; `u64`-aligned because the
    /// driver reads and writes 8-byte entries through the pointer.
    words: Box<[u64]>,
    segments: Vec<PhysSegment>,
}

struct MemInner {
    next_granule: u64,
    granules: HashMap<u64, usize>,
    imports: HashMap<u64, (Vec<PhysSegment>, u32)>,
    exports: HashMap<u64, Vec<PhysSegment>>,
    next_export: u64,
    kernel_maps: HashMap<usize, KernelMap>,
    syncs: Vec<(SyncDirection, u64)>,
}

/// Platform memory backend with full bookkeeping.
///
/// Granules come from a bump allocator that leaves a one-page hole
/// between grants, so multi-granule buffers are never physically
/// contiguous. Kernel mappings are backed by heap memory whose address
/// doubles as the kernel virtual address.
#[derive(Clone)]
pub struct TestMemory {
    inner: Rc<RefCell<MemInner>>,
}

impl TestMemory {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(MemInner {
                next_granule: GRANULE_BASE,
                granules: HashMap::new(),
                imports: HashMap::new(),
                exports: HashMap::new(),
                next_export: 0xe000,
                kernel_maps: HashMap::new(),
                syncs: Vec::new(),
            })),
        }
    }

    /// Makes `token` resolvable to `segments`.
    pub fn register_import(&self, token: u64, segments: Vec<PhysSegment>) {
        self.inner.borrow_mut().imports.insert(token, (segments, 0));
    }

    /// Live references on an import token.
    pub fn import_refs(&self, token: u64) -> u32 {
        self.inner
            .borrow()
            .imports
            .get(&token)
            .map(|(_, refs)| *refs)
            .unwrap_or(0)
    }

    pub fn outstanding_granules(&self) -> usize {
        self.inner.borrow().granules.len()
    }

    pub fn outstanding_kernel_maps(&self) -> usize {
        self.inner.borrow().kernel_maps.len()
    }

    pub fn outstanding_exports(&self) -> usize {
        self.inner.borrow().exports.len()
    }

    /// Cache-maintenance calls so far as (direction, bytes), drained.
    pub fn take_syncs(&self) -> Vec<(SyncDirection, u64)> {
        std::mem::take(&mut self.inner.borrow_mut().syncs)
    }

    /// Flips bit `bit` of the 8-byte word at physical `phys`, which must
    /// be covered by a live kernel mapping and 8-byte aligned.
    pub fn corrupt_word(&self, phys: u64, bit: u32) {
        assert_eq!(phys % 8, 0, "corrupt target must be entry aligned");
        let mut inner = self.inner.borrow_mut();
        for map in inner.kernel_maps.values_mut() {
            let mut run_start = 0usize;
            let mut hit = None;
            for seg in &map.segments {
                if phys >= seg.base && phys < seg.end() {
                    hit = Some(run_start + (phys - seg.base) as usize);
                    break;
                }
                run_start += seg.len as usize;
            }
            if let Some(byte_off) = hit {
                map.words[byte_off / 8] ^= 1u64 << bit;
                return;
            }
        }
        panic!("no kernel mapping covers {:#x}", phys);
    }
}

impl MemoryBackend for TestMemory {
    fn alloc_granule(&mut self, granule: usize) -> Option<u64> {
        let mut inner = self.inner.borrow_mut();
        let base = inner.next_granule;
        // Leave a hole so adjacent grants never coalesce.
        inner.next_granule += (granule + 4096) as u64;
        inner.granules.insert(base, granule);
        Some(base)
    }

    fn free_granule(&mut self, base: u64, granule: usize) {
        let removed = self.inner.borrow_mut().granules.remove(&base);
        assert_eq!(removed, Some(granule), "granule {:#x} freed wrongly", base);
    }

    fn resolve_import(&mut self, token: u64) -> Option<Vec<PhysSegment>> {
        let mut inner = self.inner.borrow_mut();
        let (segments, refs) = inner.imports.get_mut(&token)?;
        *refs += 1;
        Some(segments.clone())
    }

    fn release_import(&mut self, token: u64) {
        if let Some((_, refs)) = self.inner.borrow_mut().imports.get_mut(&token) {
            assert!(*refs > 0, "import {:#x} released while unreferenced", token);
            *refs -= 1;
        }
    }

    fn export_segments(&mut self, segments: &[PhysSegment]) -> Option<u64> {
        let mut inner = self.inner.borrow_mut();
        let token = inner.next_export;
        inner.next_export += 1;
        inner.exports.insert(token, segments.to_vec());
        Some(token)
    }

    fn release_export(&mut self, token: u64) {
        self.inner.borrow_mut().exports.remove(&token);
    }

    fn map_kernel(&mut self, segments: &[PhysSegment]) -> Option<usize> {
        let total: u64 = segments.iter().map(|s| s.len).sum();
        let words = vec![0u64; total as usize / 8].into_boxed_slice();
        let kva = words.as_ptr() as usize;
        self.inner.borrow_mut().kernel_maps.insert(
            kva,
            KernelMap {
                words,
                segments: segments.to_vec(),
            },
        );
        Some(kva)
    }

    fn unmap_kernel(&mut self, kva: usize) {
        let removed = self.inner.borrow_mut().kernel_maps.remove(&kva);
        assert!(removed.is_some(), "kva {:#x} unmapped twice", kva);
    }

    fn sync(&mut self, segments: &[PhysSegment], dir: SyncDirection) {
        let total: u64 = segments.iter().map(|s| s.len).sum();
        self.inner.borrow_mut().syncs.push((dir, total));
    }
}

#[derive(Clone)]
pub struct TestClock {
    now: Rc<Cell<u64>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
        }
    }

    pub fn advance(&self, us: u64) {
        self.now.set(self.now.get() + us);
    }
}

impl Clock for TestClock {
    fn now_us(&self) -> u64 {
        self.now.get()
    }
}

/// Fence that records having been signalled.
pub struct TestFence(pub Arc<AtomicBool>);

impl Fence for TestFence {
    fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One assembled device plus the test's handles on its surroundings.
pub struct Rig {
    pub bus: TestBus,
    pub mem: TestMemory,
    pub clock: TestClock,
    pub dev: TestDevice,
}

impl Rig {
    /// Hardware pass plus the driver's two interrupt stages.
    pub fn complete_and_service(&self, cycles: u64, hash: u32) {
        self.bus.complete_pass(cycles, hash);
        assert!(self.dev.irq_fast(), "completion raised no work");
        self.dev.process_completions();
    }

    /// Fault plus the driver's two interrupt stages.
    pub fn fault_and_service(&self, bits: IrqBits, address: u64, external: bool) {
        self.bus.raise_fault(bits, address, external);
        assert!(self.dev.irq_fast(), "fault raised no work");
        self.dev.process_completions();
    }
}

pub fn rig() -> Rig {
    rig_with(DeviceConfig::default())
}

pub fn rig_with(config: DeviceConfig) -> Rig {
    let bus = TestBus::new();
    let mem = TestMemory::new();
    let clock = TestClock::new();
    let dev = Device::new(bus.clone(), mem.clone(), clock.clone(), VecSink::new(), config)
        .expect("device probe failed");
    // Drop the probe-time writes so tests see only their own.
    bus.take_writes();
    Rig {
        bus,
        mem,
        clock,
        dev,
    }
}

pub fn unified_heap(dev: &TestDevice) -> HeapHandle {
    dev.create_heap(HeapConfig::default()).expect("unified heap")
}

pub fn carveout_heap(dev: &TestDevice, pages: u64) -> HeapHandle {
    dev.create_heap(HeapConfig {
        kind: HeapKind::Carveout,
        region: Some(PhysSegment::new(CARVEOUT_BASE, pages * 4096)),
        ..HeapConfig::default()
    })
    .expect("carveout heap")
}

pub fn import_heap(dev: &TestDevice) -> HeapHandle {
    dev.create_heap(HeapConfig {
        kind: HeapKind::Import,
        ..HeapConfig::default()
    })
    .expect("import heap")
}

pub fn shared_heap(dev: &TestDevice) -> HeapHandle {
    dev.create_heap(HeapConfig {
        kind: HeapKind::Shared,
        ..HeapConfig::default()
    })
    .expect("shared heap")
}

/// Parses one `0x`-prefixed hex field of a trace record.
pub fn hex(field: &str) -> u64 {
    u64::from_str_radix(field.trim_start_matches("0x"), 16)
        .unwrap_or_else(|_| panic!("bad hex field {:?}", field))
}

/// The `(address, value)` pairs of every `MEMW` record, in order.
pub fn memw_lines(records: &[String]) -> Vec<(u64, u64)> {
    records
        .iter()
        .filter(|r| r.starts_with("MEMW "))
        .map(|r| {
            let mut fields = r.split_whitespace().skip(1);
            let addr = hex(fields.next().expect("MEMW address"));
            let value = hex(fields.next().expect("MEMW value"));
            (addr, value)
        })
        .collect()
}
