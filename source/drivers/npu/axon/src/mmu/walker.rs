// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Translation-table layout and entry codec.
//!
//! The device walks a three-level software-built tree: a page catalogue
//! whose entries point at page directories, whose entries point at page
//! tables, whose entries map device pages. Every node is one device page
//! of 512 eight-byte entries. Each level decodes nine bits of the virtual
//! address, so the tree spans bits 12..39.
//!
//! Leaf entries carry an odd-parity bit over the virtual/physical page
//! pair. A set parity bit that does not match, or address bits outside the
//! configured physical width, decode as corruption rather than as a miss;
//! the two conditions are different failures and callers see them
//! differently.

use alloc::collections::BTreeMap;

use crate::types::BufferId;
use crate::DEVICE_PAGE_SIZE;

pub const ENTRY_SIZE: usize = 8;
pub const ENTRIES_PER_NODE: usize = 512;

/// Virtual-address span of one leaf entry / one table node / one directory.
pub const PAGE_SHIFT: u32 = 12;
pub const TABLE_SHIFT: u32 = PAGE_SHIFT + 9;
pub const DIRECTORY_SHIFT: u32 = TABLE_SHIFT + 9;
/// Widest virtual address the tree can express.
pub const MAX_ADDR_WIDTH: u8 = (DIRECTORY_SHIFT + 9) as u8;
pub const MAX_PHYS_WIDTH: u8 = 48;

const ENTRY_VALID: u64 = 1 << 0;
const ENTRY_READ_ONLY: u64 = 1 << 1;
const ENTRY_CACHE_SHIFT: u32 = 2;
const ENTRY_CACHE_MASK: u64 = 0b11 << ENTRY_CACHE_SHIFT;
const ENTRY_PARITY: u64 = 1 << 4;
const ENTRY_FLAGS_MASK: u64 =
    ENTRY_VALID | ENTRY_READ_ONLY | ENTRY_CACHE_MASK | ENTRY_PARITY;

static_assertions::const_assert_eq!(ENTRIES_PER_NODE * ENTRY_SIZE, DEVICE_PAGE_SIZE);
static_assertions::const_assert_eq!(1usize << (TABLE_SHIFT - PAGE_SHIFT), ENTRIES_PER_NODE);

/// Cache treatment the device applies when it touches the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCache {
    Default = 0,
    Bypass = 1,
    Streaming = 2,
}

/// Decoded leaf attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryFlags {
    pub read_only: bool,
    pub cache: EntryCache,
}

impl EntryFlags {
    pub const fn normal() -> Self {
        Self {
            read_only: false,
            cache: EntryCache::Default,
        }
    }
}

/// Result of decoding one leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryRead {
    NotPresent,
    Corrupt,
    Mapped { phys: u64, flags: EntryFlags },
}

const fn build_parity_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut value = 0;
    while value < 256 {
        table[value] = (value as u8).count_ones() as u8 & 1;
        value += 1;
    }
    table
}

static PARITY_TABLE: [u8; 256] = build_parity_table();

/// Folds the virtual/physical page pair down to one odd-parity bit.
#[inline]
pub fn pair_parity(vpn: u64, ppn: u64) -> u64 {
    let mut folded = (vpn << 32) ^ (ppn & 0xffff_ffff);
    folded ^= folded >> 32;
    folded ^= folded >> 16;
    folded ^= folded >> 8;
    PARITY_TABLE[(folded & 0xff) as usize] as u64
}

/// Mask of the physical-address bits an entry may carry.
#[inline]
const fn addr_mask(phys_width: u8) -> u64 {
    (!0u64 >> (64 - phys_width)) & !((1 << PAGE_SHIFT) - 1)
}

/// Catalogue, directory and table indices of a virtual address.
#[inline]
pub fn level_indices(virt: u64) -> (u16, u16, u16) {
    let catalogue = (virt >> DIRECTORY_SHIFT) & 0x1ff;
    let directory = (virt >> TABLE_SHIFT) & 0x1ff;
    let table = (virt >> PAGE_SHIFT) & 0x1ff;
    (catalogue as u16, directory as u16, table as u16)
}

/// Encodes a leaf entry mapping virtual page `vpn` to physical `phys`.
pub fn encode_leaf(virt: u64, phys: u64, flags: EntryFlags, parity: bool, phys_width: u8) -> u64 {
    let mut entry = (phys & addr_mask(phys_width)) | ENTRY_VALID;
    if flags.read_only {
        entry |= ENTRY_READ_ONLY;
    }
    entry |= (flags.cache as u64) << ENTRY_CACHE_SHIFT;
    if parity {
        let vpn = virt >> PAGE_SHIFT;
        let ppn = phys >> PAGE_SHIFT;
        if pair_parity(vpn, ppn) == 0 {
            // Odd parity: the stored bit makes the protected pair odd.
            entry |= ENTRY_PARITY;
        }
    }
    entry
}

/// Encodes a branch entry pointing at a child node.
pub fn encode_branch(child_phys: u64, phys_width: u8) -> u64 {
    (child_phys & addr_mask(phys_width)) | ENTRY_VALID
}

/// Decodes a leaf entry read back from node memory.
pub fn decode_leaf(raw: u64, virt: u64, parity: bool, phys_width: u8) -> EntryRead {
    if raw & ENTRY_VALID == 0 {
        return EntryRead::NotPresent;
    }
    let mask = addr_mask(phys_width);
    if raw & !(mask | ENTRY_FLAGS_MASK) != 0 {
        // Bits above the physical width can only come from a bad write.
        return EntryRead::Corrupt;
    }
    let phys = raw & mask;
    if parity {
        let vpn = virt >> PAGE_SHIFT;
        let ppn = phys >> PAGE_SHIFT;
        let stored = (raw & ENTRY_PARITY) >> 4;
        if pair_parity(vpn, ppn) + stored != 1 {
            return EntryRead::Corrupt;
        }
    }
    let cache = match (raw & ENTRY_CACHE_MASK) >> ENTRY_CACHE_SHIFT {
        0 => EntryCache::Default,
        1 => EntryCache::Bypass,
        _ => EntryCache::Streaming,
    };
    EntryRead::Mapped {
        phys,
        flags: EntryFlags {
            read_only: raw & ENTRY_READ_ONLY != 0,
            cache,
        },
    }
}

/// Decodes a branch entry; branches carry no parity.
pub fn decode_branch(raw: u64, phys_width: u8) -> Option<u64> {
    if raw & ENTRY_VALID == 0 {
        return None;
    }
    Some(raw & addr_mask(phys_width))
}

/// Volatile entry accessors. Node memory is shared with the device, so
/// reads and writes must not be elided or reordered by the compiler.
///
/// # Safety
/// `kva` must be the live kernel mapping of a node page and `index` must
/// be below [`ENTRIES_PER_NODE`].
pub unsafe fn write_entry(kva: usize, index: usize, value: u64) {
    debug_assert!(index < ENTRIES_PER_NODE);
    core::ptr::write_volatile((kva as *mut u64).add(index), value);
}

/// # Safety
/// Same contract as [`write_entry`].
pub unsafe fn read_entry(kva: usize, index: usize) -> u64 {
    debug_assert!(index < ENTRIES_PER_NODE);
    core::ptr::read_volatile((kva as *const u64).add(index))
}

/// # Safety
/// `kva` must be the live kernel mapping of a whole node page.
pub unsafe fn zero_node(kva: usize) {
    core::ptr::write_bytes(kva as *mut u8, 0, DEVICE_PAGE_SIZE);
}

/// One live tree node.
#[derive(Debug)]
pub struct NodeSlot {
    /// Backing buffer in the owning context, accounted as node usage.
    pub buffer: BufferId,
    pub kva: usize,
    pub phys: u64,
    /// Valid child entries; the node is freed when this returns to zero.
    pub used: u16,
}

/// Tree levels as reported through allocation events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeLevel {
    Catalogue,
    Directory,
    Table,
}

/// Key of a node that the next mapping needs but that does not exist yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKey {
    Directory(u16),
    Table(u16, u16),
}

impl NodeKey {
    pub fn level(self) -> TreeLevel {
        match self {
            NodeKey::Directory(_) => TreeLevel::Directory,
            NodeKey::Table(..) => TreeLevel::Table,
        }
    }
}

/// The software image of one context's translation tree.
pub struct PageTree {
    pub catalogue: NodeSlot,
    pub dirs: BTreeMap<u16, NodeSlot>,
    pub tables: BTreeMap<(u16, u16), NodeSlot>,
}

impl PageTree {
    pub fn new(catalogue: NodeSlot) -> Self {
        Self {
            catalogue,
            dirs: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }

    /// Nodes the range `virt .. virt + pages * page` will touch but which
    /// are not allocated yet, deduplicated and in creation order.
    pub fn missing_nodes(&self, virt: u64, pages: usize) -> alloc::vec::Vec<NodeKey> {
        let mut missing = alloc::vec::Vec::new();
        for page in 0..pages {
            let address = virt + (page * DEVICE_PAGE_SIZE) as u64;
            let (ci, di, _) = level_indices(address);
            if !self.dirs.contains_key(&ci) {
                let key = NodeKey::Directory(ci);
                if !missing.contains(&key) {
                    missing.push(key);
                }
            }
            if !self.tables.contains_key(&(ci, di)) {
                let key = NodeKey::Table(ci, di);
                if !missing.contains(&key) {
                    missing.push(key);
                }
            }
        }
        missing
    }

    /// All node buffers, leaves before branches, for teardown.
    pub fn drain_nodes(&mut self) -> alloc::vec::Vec<(TreeLevel, BufferId)> {
        let mut nodes: alloc::vec::Vec<(TreeLevel, BufferId)> = alloc::vec::Vec::new();
        for (_, node) in core::mem::take(&mut self.tables) {
            nodes.push((TreeLevel::Table, node.buffer));
        }
        for (_, node) in core::mem::take(&mut self.dirs) {
            nodes.push((TreeLevel::Directory, node.buffer));
        }
        nodes.push((TreeLevel::Catalogue, self.catalogue.buffer));
        nodes
    }
}
