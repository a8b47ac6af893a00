// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Property tests for the translation-entry codec.

use proptest::prelude::*;

use crate::mmu::walker::{
    decode_leaf, encode_leaf, pair_parity, EntryCache, EntryFlags, EntryRead,
};

const PHYS_WIDTH: u8 = 40;

fn virt_strategy() -> impl Strategy<Value = u64> {
    (0u64..(1 << 27)).prop_map(|page| page << 12)
}

fn phys_strategy() -> impl Strategy<Value = u64> {
    (0u64..(1 << (PHYS_WIDTH - 12))).prop_map(|page| page << 12)
}

proptest! {
    /// Folded parity agrees with a straight population count of the pair.
    #[test]
    fn parity_is_popcount_of_pair(vpn in any::<u64>(), ppn in any::<u64>()) {
        let pair = (vpn << 32) ^ (ppn & 0xffff_ffff);
        prop_assert_eq!(pair_parity(vpn, ppn), (pair.count_ones() & 1) as u64);
    }

    /// Whatever goes in comes back out, parity on or off.
    #[test]
    fn leaf_round_trips(
        virt in virt_strategy(),
        phys in phys_strategy(),
        read_only in any::<bool>(),
        parity in any::<bool>(),
    ) {
        let flags = EntryFlags { read_only, cache: EntryCache::Default };
        let entry = encode_leaf(virt, phys, flags, parity, PHYS_WIDTH);
        match decode_leaf(entry, virt, parity, PHYS_WIDTH) {
            EntryRead::Mapped { phys: got, flags: got_flags } => {
                prop_assert_eq!(got, phys);
                prop_assert_eq!(got_flags.read_only, read_only);
            }
            other => prop_assert!(false, "decode failed: {:?}", other),
        }
    }

    /// Any single bit flipped inside the address field turns the entry
    /// into a detected corruption, never a silently wrong translation.
    #[test]
    fn address_bit_flips_are_detected(
        virt in virt_strategy(),
        phys in phys_strategy(),
        bit in 12u32..(PHYS_WIDTH as u32),
    ) {
        let entry = encode_leaf(virt, phys, EntryFlags::normal(), true, PHYS_WIDTH);
        let tampered = entry ^ (1u64 << bit);
        prop_assert_eq!(decode_leaf(tampered, virt, true, PHYS_WIDTH), EntryRead::Corrupt);
    }

    /// A flipped parity bit is itself a detected corruption.
    #[test]
    fn parity_bit_flip_is_detected(virt in virt_strategy(), phys in phys_strategy()) {
        let entry = encode_leaf(virt, phys, EntryFlags::normal(), true, PHYS_WIDTH);
        let tampered = entry ^ (1u64 << 4);
        prop_assert_eq!(decode_leaf(tampered, virt, true, PHYS_WIDTH), EntryRead::Corrupt);
    }

    /// Bits above the physical width decode as corruption even with the
    /// parity check disabled.
    #[test]
    fn reserved_bits_are_detected(
        virt in virt_strategy(),
        phys in phys_strategy(),
        bit in (PHYS_WIDTH as u32)..63,
    ) {
        let entry = encode_leaf(virt, phys, EntryFlags::normal(), false, PHYS_WIDTH);
        let tampered = entry | (1u64 << bit);
        prop_assert_eq!(decode_leaf(tampered, virt, false, PHYS_WIDTH), EntryRead::Corrupt);
    }
}
