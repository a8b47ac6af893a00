// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded slot arenas keyed by typed handles.
//!
//! Every registry in the driver (heaps, contexts, buffers, mappings,
//! translation contexts, sessions) stores its objects in a `SlotTable`.
//! Freed slots are reused lowest-first, so handles stay small and a table
//! never grows past its configured limit. The limit is a denial-of-service
//! guard: a misbehaving client exhausts its own table, not kernel memory.

use alloc::vec::Vec;
use core::marker::PhantomData;

/// Implemented by the newtype ids in [`crate::types`].
pub trait Handle: Copy + Eq {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

pub struct SlotTable<H, T> {
    slots: Vec<Option<T>>,
    occupied: usize,
    limit: usize,
    _key: PhantomData<H>,
}

impl<H: Handle, T> SlotTable<H, T> {
    /// Creates an empty table that refuses to grow past `limit` live entries.
    pub const fn bounded(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            occupied: 0,
            limit,
            _key: PhantomData,
        }
    }

    /// Inserts `value`, reusing the lowest free slot. A full table hands
    /// the value back so the caller can unwind whatever it had acquired.
    pub fn insert(&mut self, value: T) -> Result<H, T> {
        if self.occupied >= self.limit {
            return Err(value);
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                self.occupied += 1;
                return Ok(H::from_index(index));
            }
        }
        let index = self.slots.len();
        self.slots.push(Some(value));
        self.occupied += 1;
        Ok(H::from_index(index))
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        self.slots.get(handle.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        self.slots.get_mut(handle.index()).and_then(Option::as_mut)
    }

    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: H) -> Option<T> {
        let taken = self.slots.get_mut(handle.index()).and_then(Option::take);
        if taken.is_some() {
            self.occupied -= 1;
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (H::from_index(index), value)))
    }

    /// Snapshot of the live handles. Used by teardown paths that mutate the
    /// table while walking it.
    pub fn handles(&self) -> Vec<H> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}
