// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Driver-wide error taxonomy.
//!
//! Five stable categories cross the control surface; everything inside the
//! driver maps onto them. Hardware-originated failures carry a [`Fault`]
//! payload so callers can tell a wedged bus from a trashed translation
//! structure without parsing log output.

use core::fmt;

/// Classified hardware failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The interconnect reported an error while the core was master.
    BusError,
    /// The device MMU raised a translation fault.
    Translation,
    /// A page-table entry failed its integrity check; the structure is
    /// corrupt, not merely unmapped.
    CorruptEntry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed or out-of-range argument, including unknown handles.
    InvalidArgument,
    /// Allocation failure or a full handle table.
    OutOfMemory,
    /// The object is in use, or the hardware cannot accept more work.
    Busy,
    /// The hardware signalled a fault.
    HardwareFault(Fault),
    /// A watchdog budget elapsed before the hardware finished.
    Timeout,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::HardwareFault(fault)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Busy => write!(f, "busy"),
            Error::HardwareFault(Fault::BusError) => write!(f, "hardware fault: bus error"),
            Error::HardwareFault(Fault::Translation) => {
                write!(f, "hardware fault: translation fault")
            }
            Error::HardwareFault(Fault::CorruptEntry) => {
                write!(f, "hardware fault: corrupt page-table entry")
            }
            Error::Timeout => write!(f, "watchdog timeout"),
        }
    }
}
