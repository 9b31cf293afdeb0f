// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event trace.
//!
//! The kernel keeps a [`Ringbuf`](ringbuf::Ringbuf) of these, which tests and
//! debuggers read back after the fact. Consecutive identical events from the
//! same line collapse into one entry with a count.

use abi::{FaultInfo, ProcessId, ProcessState, ShortId};

use crate::err::LoadError;
use crate::fault::Action;
use crate::loader::ScanEnd;

/// Entries in the kernel trace buffer.
pub const TRACE_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    ScanStart { base: u32, len: u32 },
    /// Only recorded when scan tracing is configured.
    Candidate { offset: u32 },
    Loaded {
        offset: u32,
        id: ProcessId,
        short_id: ShortId,
    },
    Renumbered { from: ShortId, to: ShortId },
    /// A well-formed image passed over without being an error: padding, or
    /// something already loaded.
    Skipped { offset: u32, total_size: u32 },
    Rejected { offset: u32, error: LoadError },
    ScanEnd(ScanEnd),
    State {
        id: ProcessId,
        from: ProcessState,
        to: ProcessState,
    },
    Fault { id: ProcessId, fault: FaultInfo },
    Decision { id: ProcessId, action: Action },
    Reclaimed { id: ProcessId },
    Halt { id: ProcessId },
}
