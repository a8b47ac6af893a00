// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Newtype identifiers used across the driver core.
//!
//! Handles are slot-table references (never zero, index + 1); raw conversions
//! exist for the control-surface boundary that marshals client arguments.
//! Keeping each id distinct prevents cross-table confusion: a `BufferId`
//! cannot be fed to the heap registry, a `SessionId` cannot name a mapping.

use core::fmt;
use core::num::NonZeroU32;

use crate::table::Handle;

macro_rules! slot_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// Constructs a handle from a raw value provided by a client.
            pub fn from_raw(raw: u32) -> Option<Self> {
                NonZeroU32::new(raw).map(Self)
            }

            /// Returns the raw representation of the handle.
            pub fn to_raw(self) -> u32 {
                self.0.get()
            }
        }

        impl Handle for $name {
            fn from_index(index: usize) -> Self {
                // SAFETY: index is offset by one, so the raw value is never zero.
                Self(unsafe { NonZeroU32::new_unchecked(index as u32 + 1) })
            }

            fn index(self) -> usize {
                self.0.get() as usize - 1
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.get())
            }
        }
    };
}

slot_handle! {
    /// Reference to a registered heap in the device-wide heap table.
    HeapHandle
}

slot_handle! {
    /// Reference to a client process context.
    CtxHandle
}

slot_handle! {
    /// Reference to a buffer, unique within its owning process context.
    BufferId
}

slot_handle! {
    /// Reference to an address-translation context within a process context.
    MmuHandle
}

slot_handle! {
    /// Reference to one buffer-to-context mapping (internal arena id).
    MappingId
}

slot_handle! {
    /// Reference to a scheduler session.
    SessionId
}

/// Client-chosen identifier for one submission.
///
/// Unlike the slot handles above this is an opaque tag: the scheduler never
/// indexes by it, it only matches it against cancel patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SubmitId(u32);

impl SubmitId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// True when the id matches `pattern` under `mask`.
    #[inline]
    pub const fn matches(self, pattern: u32, mask: u32) -> bool {
        self.0 & mask == pattern & mask
    }
}

impl fmt::Display for SubmitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device-virtual address inside an MMU context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceVirt(u64);

impl DeviceVirt {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Accepts only addresses aligned to `page_size`.
    #[inline]
    pub fn page_aligned(raw: u64, page_size: usize) -> Option<Self> {
        if raw % page_size as u64 == 0 {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn checked_add(self, bytes: u64) -> Option<DeviceVirt> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(DeviceVirt(v)),
            None => None,
        }
    }
}

impl fmt::Display for DeviceVirt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Submission priority, highest serviced first.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

/// Number of priority levels the scheduler maintains.
pub const PRIORITY_COUNT: usize = 3;

impl Priority {
    /// Decodes a raw priority from the control surface.
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// All levels in service order, highest first.
    pub const fn descending() -> [Priority; PRIORITY_COUNT] {
        [Self::High, Self::Normal, Self::Low]
    }
}
