// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-facing diagnostics.
//!
//! Two different stories need telling: an image that never became a process
//! (`load:` lines), and a process that loaded, ran and then faulted
//! (`fault:` lines). A board supplies a [`DiagnosticSink`] to hear both;
//! [`TextSink`] renders them as `key=value` text into any `fmt::Write`.

use core::fmt::{self, Write};

use crate::err::LoadError;
use crate::fault::{Decision, Detail};
use crate::process::Process;

/// An image the loader looked at and refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LoadFailure {
    /// Offset of the image within the scanned flash.
    pub offset: u32,
    pub error: LoadError,
}

/// A fault and what was decided about it. The process's fault record holds
/// the details.
#[derive(Copy, Clone)]
pub struct FaultReport<'a> {
    pub process: &'a Process<'a>,
    pub decision: Decision,
}

pub trait DiagnosticSink {
    fn load_failure(&mut self, failure: &LoadFailure);
    fn fault(&mut self, report: &FaultReport<'_>);
}

impl<T: DiagnosticSink + ?Sized> DiagnosticSink for &mut T {
    fn load_failure(&mut self, failure: &LoadFailure) {
        (**self).load_failure(failure)
    }

    fn fault(&mut self, report: &FaultReport<'_>) {
        (**self).fault(report)
    }
}

/// Discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn load_failure(&mut self, _: &LoadFailure) {}
    fn fault(&mut self, _: &FaultReport<'_>) {}
}

/// Renders diagnostics as lines of text.
pub struct TextSink<W> {
    out: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_fault(&mut self, report: &FaultReport<'_>) -> fmt::Result {
        let p = report.process;
        let detail = report.decision.detail;
        if detail == Detail::Silent {
            // Just enough to tell a fault from a load failure.
            return writeln!(
                self.out,
                "fault: id={:#010x} short_id={} action={:?}",
                p.id().0,
                p.identity().short_id,
                report.decision.action,
            );
        }
        write!(
            self.out,
            "fault: id={:#010x} name={} short_id={} state={:?}",
            p.id().0,
            p.name().unwrap_or("-"),
            p.identity().short_id,
            p.state(),
        )?;
        if let Some(rec) = p.fault() {
            write!(self.out, " fault={:?}", rec.fault)?;
        }
        writeln!(
            self.out,
            " action={:?} restarts={}",
            report.decision.action,
            p.counters().restarts
        )?;

        if detail < Detail::Full {
            return Ok(());
        }
        let Some(rec) = p.fault() else {
            return Ok(());
        };
        writeln!(
            self.out,
            "fault:   pc={:#010x} sp={:#010x} was={:?}",
            rec.pc, rec.sp, rec.state_before
        )?;
        for region in rec.protection.regions() {
            writeln!(
                self.out,
                "fault:   region base={:#010x} len={:#x} attrs={:?}",
                region.span.base(),
                region.span.len(),
                region.attributes,
            )?;
        }
        if let Some(sc) = rec.last_syscall {
            writeln!(
                self.out,
                "fault:   last_syscall={} args={:x?}",
                sc.number, sc.args
            )?;
        }
        Ok(())
    }
}

impl<W: Write> DiagnosticSink for TextSink<W> {
    fn load_failure(&mut self, failure: &LoadFailure) {
        writeln!(
            self.out,
            "load: offset={:#x} error={:?}",
            failure.offset, failure.error
        )
        .ok();
    }

    fn fault(&mut self, report: &FaultReport<'_>) {
        self.write_fault(report).ok();
    }
}
