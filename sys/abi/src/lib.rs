// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel, image tooling, and
//! anything that needs to talk about processes from the outside.

#![no_std]

use serde::{Deserialize, Serialize};

pub mod image;

/// Number of bits in a `ProcessId` used to represent the table index, rather
/// than the generation number.
pub const PROCESS_ID_INDEX_BITS: u32 = 8;

/// Names a particular incarnation of a process.
///
/// A `ProcessId` combines two fields: the index of the process's slot in the
/// kernel's process table, and a generation number drawn from a single
/// kernel-wide counter. Every load and every restart draws a fresh generation,
/// so an id held across a restart goes stale and will be refused by the
/// kernel, even though the slot index is unchanged.
///
/// The index is in the lower `ProcessId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const INDEX_BITS: u32 = PROCESS_ID_INDEX_BITS;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    /// Largest number of processes a table can address.
    pub const MAX_PROCESSES: usize = 1 << Self::INDEX_BITS;

    /// Fabricates a `ProcessId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ProcessId(
            (index as u32 & Self::INDEX_MASK) | (gen.0 << Self::INDEX_BITS),
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation(self.0 >> Self::INDEX_BITS)
    }
}

/// Type used to track generation numbers. Only the low
/// `32 - ProcessId::INDEX_BITS` bits are significant.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Generation(u32);

impl Generation {
    pub const ZERO: Self = Self(0);

    const MASK: u32 = u32::MAX >> ProcessId::INDEX_BITS;

    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1) & Self::MASK)
    }
}

impl From<u32> for Generation {
    fn from(x: u32) -> Self {
        Self(x & Self::MASK)
    }
}

/// Compact 32-bit name for a loaded application, suitable for access-control
/// lists and IPC routing. Unique among the processes currently in the table.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct ShortId(pub u32);

impl core::fmt::Display for ShortId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Lifecycle state of a process.
///
/// ```text
///   Unstarted --start--> Running <--yield/wake--> Yielded
///       ^                  |  \                    |
///       |                fault \--stop--> Stopped  |
///    restart               v        <--resume--    |
///       +------------- Faulted <-------fault-------+
///
///   any state except Terminated --terminate--> Terminated
/// ```
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Hash, Serialize, Deserialize,
)]
pub enum ProcessState {
    /// Loaded but never run, or reset by a restart and not yet scheduled.
    #[default]
    Unstarted,
    /// Eligible for the CPU.
    Running,
    /// Waiting for an event; not eligible until woken.
    Yielded,
    /// Stopped by a fault. Never runnable without intervention.
    Faulted,
    /// Suspended by a privileged request; resumes as `Running`.
    Stopped,
    /// Dead. The slot stays occupied until the kernel reclaims it.
    Terminated,
}

impl ProcessState {
    /// Checks whether the scheduler may pick a process in this state.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Unstarted | Self::Running)
    }
}

/// A record describing a fault taken by a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The process has violated memory access rules. This may have come from
    /// a memory protection fault while executing the process (in the case of
    /// `source` `User`) or from checks on syscall arguments (`source`
    /// `Kernel`).
    MemoryAccess {
        /// Problematic address, when the processor reports one.
        address: Option<u32>,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// The process has overflowed its stack.
    StackOverflow { address: u32 },
    /// The process has induced a bus error.
    BusError {
        address: Option<u32>,
        source: FaultSource,
    },
    /// Divide-by-zero
    DivideByZero,
    /// Attempt to execute non-executable memory
    IllegalText,
    /// Execution of an illegal instruction
    IllegalInstruction,
    /// Other invalid operation, with an architecture-specific code (the
    /// fault status register on ARMv7/8-M).
    InvalidOperation(u32),
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
    /// The process has explicitly aborted itself with a panic.
    Panic,
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a process used a syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A program passed a buffer that is unaligned or wraps the end of the
    /// address space.
    InvalidSlice,
    /// A program passed a buffer that it does not own.
    SliceNotOwned,
    /// A program named a process that does not exist.
    ProcessOutOfRange,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}
