// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding what happens to a process after it faults.
//!
//! The kernel captures the fault, then asks the board's [`FaultPolicy`]
//! exactly once what to do about it. The policy only decides; carrying out
//! the decision is the kernel's job.

use serde::Deserialize;

use crate::process::Process;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Leave the process Faulted, holding its state for inspection.
    Stop,
    /// Kill it. Its slot and RAM can then be reclaimed.
    Terminate,
    /// Reset it to its entry point and let it run again.
    Restart,
    /// Stop the whole system.
    HaltAll,
}

/// How much the diagnostic sink hears about the fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Detail {
    /// A bare record of who faulted and what was done, no dump.
    Silent,
    /// One line: who faulted and how.
    Minimal,
    /// Also registers, regions and the last syscall.
    Full,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub detail: Detail,
}

impl Decision {
    pub const fn new(action: Action, detail: Detail) -> Self {
        Self { action, detail }
    }
}

pub trait FaultPolicy {
    /// Called once per fault, with the fault already recorded in `process`.
    fn decide(&self, process: &Process<'_>) -> Decision;
}

impl<T: FaultPolicy + ?Sized> FaultPolicy for &T {
    fn decide(&self, process: &Process<'_>) -> Decision {
        (**self).decide(process)
    }
}

/// Restart every time, reporting everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct RestartWithDump;

impl FaultPolicy for RestartWithDump {
    fn decide(&self, _: &Process<'_>) -> Decision {
        Decision::new(Action::Restart, Detail::Full)
    }
}

/// Hold the process where it fell, with a one-line report.
#[derive(Copy, Clone, Debug, Default)]
pub struct StopWithSummary;

impl FaultPolicy for StopWithSummary {
    fn decide(&self, _: &Process<'_>) -> Decision {
        Decision::new(Action::Stop, Detail::Minimal)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TerminateImmediately;

impl FaultPolicy for TerminateImmediately {
    fn decide(&self, _: &Process<'_>) -> Decision {
        Decision::new(Action::Terminate, Detail::Silent)
    }
}

/// Treat any process fault as a system failure.
#[derive(Copy, Clone, Debug, Default)]
pub struct HaltOnFault;

impl FaultPolicy for HaltOnFault {
    fn decide(&self, _: &Process<'_>) -> Decision {
        Decision::new(Action::HaltAll, Detail::Full)
    }
}

/// Restart a process up to `limit` times, then do `then` instead.
#[derive(Copy, Clone, Debug)]
pub struct ThresholdRestart {
    pub limit: u32,
    pub then: Action,
}

impl FaultPolicy for ThresholdRestart {
    fn decide(&self, process: &Process<'_>) -> Decision {
        if process.counters().restarts < self.limit {
            Decision::new(Action::Restart, Detail::Minimal)
        } else {
            Decision::new(self.then, Detail::Full)
        }
    }
}
