// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scanning flash for application images and turning them into processes.
//!
//! The loader walks the flash region from the bottom, one candidate at a
//! time, in ascending address order. Each candidate goes through parsing,
//! credential checking, identity assignment and allocation; the first three
//! are per-candidate and a failure just moves the scan along, while running
//! out of RAM or table slots ends it.
//!
//! Credential checks may need an asynchronous engine, so the loader is a
//! cooperative state machine. [`Loader::step`] does one bounded unit of work.
//! While a check is outstanding, `step` reports [`Step::Waiting`] until a
//! completion has been handed over through [`Loader::on_check_complete`].
//! Completions are only ever queued there; they're acted on at the next
//! `step`.

use abi::image::{BASE_HEADER_LEN, IMAGE_ALIGN};
use abi::{ProcessId, ShortId};
use heapless::{Deque, Vec};
use kerncore::Span;
use ringbuf::ringbuf_entry;

use crate::arch::MemoryProtection;
use crate::cap::LoadCap;
use crate::creds::{
    CheckError, CheckPolicy, CheckProgress, CredentialChecker, Verification,
};
use crate::crypto::{CheckToken, CryptoEngine, Verdict};
use crate::diag::{DiagnosticSink, LoadFailure};
use crate::err::LoadError;
use crate::ident::IdentityPolicy;
use crate::image::{self, Image, Probe, Viability};
use crate::kernel::Kernel;
use crate::region::AllocError;
use crate::trace::Trace;

/// Failures, loads and renumberings kept in a [`LoadReport`], each.
pub const MAX_REPORT: usize = 16;

/// Completions that can wait between steps.
const COMPLETION_DEPTH: usize = 4;

/// The flash to scan, and where it sits in the address space.
#[derive(Copy, Clone, Debug)]
pub struct FlashRegion<'f> {
    span: Span,
    bytes: &'f [u8],
}

impl<'f> FlashRegion<'f> {
    /// `None` if `bytes` at `base` would run off the end of the address
    /// space.
    pub fn new(base: u32, bytes: &'f [u8]) -> Option<Self> {
        let len = u32::try_from(bytes.len()).ok()?;
        Some(Self {
            span: Span::new(base, len)?,
            bytes,
        })
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn bytes(&self) -> &'f [u8] {
        self.bytes
    }
}

/// How a scan ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScanEnd {
    /// Ran out of flash.
    EndOfRegion,
    /// Found erased flash where the next header would be.
    NoFurtherHeader,
    PoolExhausted,
    NoAlignedRegion,
    TableFull,
    /// The system halted mid-scan.
    Halted,
}

/// A short id that was taken and moved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Renumbering {
    pub id: ProcessId,
    pub from: ShortId,
    pub to: ShortId,
}

#[derive(Clone, Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<ProcessId, MAX_REPORT>,
    pub failures: Vec<LoadFailure, MAX_REPORT>,
    pub renumbered: Vec<Renumbering, MAX_REPORT>,
    /// `None` while the scan is still going.
    pub end: Option<ScanEnd>,
    /// Records that didn't fit in the vectors above.
    pub dropped: u32,
}

impl LoadReport {
    fn note<T>(dropped: &mut u32, v: &mut Vec<T, MAX_REPORT>, item: T) {
        if v.push(item).is_err() {
            *dropped = dropped.saturating_add(1);
        }
    }

    pub fn failure_at(&self, offset: u32) -> Option<&LoadError> {
        self.failures
            .iter()
            .find(|f| f.offset == offset)
            .map(|f| &f.error)
    }
}

/// Policies the loader applies to every candidate.
#[derive(Copy, Clone)]
pub struct LoaderPolicies<'p> {
    pub check: CheckPolicy<'p>,
    pub identity: &'p dyn IdentityPolicy,
}

/// Result of one [`Loader::step`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// More work is ready; call `step` again.
    Continue,
    /// A credential check is with the engine and no completion has arrived.
    Waiting,
    Finished(ScanEnd),
}

#[derive(Copy, Clone, Debug)]
enum Phase<'f> {
    Scanning,
    Checking {
        offset: u32,
        image: Image<'f>,
    },
    Finished(ScanEnd),
}

pub struct Loader<'f, 'p> {
    flash: FlashRegion<'f>,
    checker: CredentialChecker<'p>,
    identity: &'p dyn IdentityPolicy,
    offset: u32,
    /// Set after a parse failure: we're stepping a word at a time looking
    /// for the next header and don't report what we step over.
    resyncing: bool,
    started: bool,
    phase: Phase<'f>,
    completions: Deque<(CheckToken, Verdict), COMPLETION_DEPTH>,
    report: LoadReport,
}

impl<'f, 'p> Loader<'f, 'p> {
    pub fn new(
        flash: FlashRegion<'f>,
        policies: LoaderPolicies<'p>,
        _cap: &LoadCap,
    ) -> Self {
        Self {
            flash,
            checker: CredentialChecker::new(policies.check),
            identity: policies.identity,
            offset: 0,
            resyncing: false,
            started: false,
            phase: Phase::Scanning,
            completions: Deque::new(),
            report: LoadReport::default(),
        }
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn into_report(self) -> LoadReport {
        self.report
    }

    /// Checks whether a credential check is outstanding.
    pub fn is_waiting(&self) -> bool {
        matches!(self.phase, Phase::Checking { .. })
    }

    /// Hands over an engine completion. Nothing happens until the next
    /// `step`.
    pub fn on_check_complete(&mut self, token: CheckToken, verdict: Verdict) {
        // At most one check is outstanding, so anything queued ahead of a
        // full queue is stale. Make room by dropping the oldest.
        if self.completions.is_full() {
            self.completions.pop_front();
        }
        let _ = self.completions.push_back((token, verdict));
    }

    /// Does one unit of work.
    pub fn step<M: MemoryProtection, const N: usize>(
        &mut self,
        kernel: &mut Kernel<'f, '_, M, N>,
        engine: &mut dyn CryptoEngine,
        sink: &mut dyn DiagnosticSink,
    ) -> Step {
        if !self.started {
            self.started = true;
            // Completions still in flight from an earlier scan must not
            // match anything this one submits.
            self.checker.set_epoch(kernel.next_scan_epoch());
            let span = self.flash.span;
            ringbuf_entry!(
                kernel.trace,
                Trace::ScanStart {
                    base: span.base(),
                    len: span.len()
                }
            );
        }
        if kernel.halted().is_some() {
            return self.finish(kernel, ScanEnd::Halted);
        }

        match self.phase {
            Phase::Finished(end) => Step::Finished(end),
            Phase::Scanning => self.scan(kernel, engine, sink),
            Phase::Checking { offset, image } => {
                let Some((token, verdict)) = self.completions.pop_front()
                else {
                    return Step::Waiting;
                };
                let progress =
                    self.checker.on_check_complete(token, verdict, &image, engine);
                match progress {
                    Err(CheckError::StaleToken) if self.checker.is_busy() => {
                        // Not ours; keep waiting for the real one.
                        Step::Continue
                    }
                    Err(e) => {
                        self.reject(kernel, sink, offset, e.into());
                        self.skip(&image);
                        Step::Continue
                    }
                    Ok(CheckProgress::Pending(_)) => Step::Waiting,
                    Ok(CheckProgress::Done(v)) => {
                        self.admit(kernel, sink, offset, image, v)
                    }
                }
            }
        }
    }

    /// Gives up on the outstanding check, recording `error` against the
    /// candidate.
    pub fn abandon_check<M: MemoryProtection, const N: usize>(
        &mut self,
        kernel: &mut Kernel<'f, '_, M, N>,
        sink: &mut dyn DiagnosticSink,
        error: CheckError,
    ) {
        if let Phase::Checking { offset, image } = self.phase {
            self.checker.cancel();
            self.reject(kernel, sink, offset, error.into());
            self.skip(&image);
        }
    }

    fn scan<M: MemoryProtection, const N: usize>(
        &mut self,
        kernel: &mut Kernel<'f, '_, M, N>,
        engine: &mut dyn CryptoEngine,
        sink: &mut dyn DiagnosticSink,
    ) -> Step {
        let offset = self.offset;
        let rest = self.flash.bytes.get(offset as usize..).unwrap_or(&[]);
        match image::probe(rest) {
            Probe::EndOfRegion => {
                return self.finish(kernel, ScanEnd::EndOfRegion)
            }
            // Inside the remains of a bad image an erased word is just data.
            Probe::Erased if self.resyncing => {
                self.offset += IMAGE_ALIGN as u32;
                return Step::Continue;
            }
            Probe::Erased => {
                return self.finish(kernel, ScanEnd::NoFurtherHeader)
            }
            Probe::Candidate => (),
        }
        // With no RAM left at all, nothing more can load; don't bother
        // looking at the candidate.
        let allocator = kernel.allocator();
        if allocator.remaining() == 0 && allocator.free_spans().is_empty() {
            return self.finish(kernel, ScanEnd::PoolExhausted);
        }
        if kernel.config().trace_scan {
            ringbuf_entry!(kernel.trace, Trace::Candidate { offset });
        }

        let image = match image::parse(rest) {
            Ok(image) => {
                self.resyncing = false;
                image
            }
            Err(e) => {
                // Never trust a size from a header that didn't parse. Step
                // over the minimum and hunt for the next header from there,
                // reporting only words that at least look like one.
                if self.resyncing && !image::looks_like_header(rest) {
                    self.offset += IMAGE_ALIGN as u32;
                } else {
                    self.reject(kernel, sink, offset, e.into());
                    self.offset += BASE_HEADER_LEN as u32;
                    self.resyncing = true;
                }
                return Step::Continue;
            }
        };

        let rejection = match image.viability(kernel.config().kernel_version) {
            Viability::Loadable => None,
            Viability::Padding => {
                ringbuf_entry!(
                    kernel.trace,
                    Trace::Skipped {
                        offset,
                        total_size: image.total_size()
                    }
                );
                self.skip(&image);
                return Step::Continue;
            }
            Viability::Disabled => Some(LoadError::Disabled),
            Viability::IncompatibleKernel { major, minor } => {
                Some(LoadError::IncompatibleKernel { major, minor })
            }
        };
        if let Some(error) = rejection {
            self.reject(kernel, sink, offset, error);
            self.skip(&image);
            return Step::Continue;
        }

        if kernel.owns_flash(self.flash.span.base() + offset) {
            ringbuf_entry!(
                kernel.trace,
                Trace::Skipped {
                    offset,
                    total_size: image.total_size()
                }
            );
            self.skip(&image);
            return Step::Continue;
        }
        if kernel.is_full() {
            return self.finish(kernel, ScanEnd::TableFull);
        }

        match self.checker.begin_check(&image, engine) {
            Ok(CheckProgress::Done(v)) => {
                self.admit(kernel, sink, offset, image, v)
            }
            Ok(CheckProgress::Pending(_)) => {
                self.phase = Phase::Checking { offset, image };
                Step::Waiting
            }
            Err(e) => {
                self.reject(kernel, sink, offset, e.into());
                self.skip(&image);
                Step::Continue
            }
        }
    }

    fn admit<M: MemoryProtection, const N: usize>(
        &mut self,
        kernel: &mut Kernel<'f, '_, M, N>,
        sink: &mut dyn DiagnosticSink,
        offset: u32,
        image: Image<'f>,
        verification: Verification,
    ) -> Step {
        self.skip(&image);
        let base = self.flash.span.base() + offset;
        match kernel.admit(self.flash.span, base, image, verification, self.identity)
        {
            Ok(admitted) => {
                let r = &mut self.report;
                LoadReport::note(&mut r.dropped, &mut r.loaded, admitted.id);
                if let Some(from) = admitted.renumbered_from {
                    LoadReport::note(
                        &mut r.dropped,
                        &mut r.renumbered,
                        Renumbering {
                            id: admitted.id,
                            from,
                            to: admitted.short_id,
                        },
                    );
                }
                ringbuf_entry!(
                    kernel.trace,
                    Trace::Loaded {
                        offset,
                        id: admitted.id,
                        short_id: admitted.short_id
                    }
                );
                Step::Continue
            }
            Err(LoadError::TableFull) => self.finish(kernel, ScanEnd::TableFull),
            Err(LoadError::Alloc(AllocError::PoolExhausted { .. })) => {
                self.finish(kernel, ScanEnd::PoolExhausted)
            }
            Err(LoadError::Alloc(AllocError::NoAlignedRegion { .. })) => {
                self.finish(kernel, ScanEnd::NoAlignedRegion)
            }
            Err(e) => {
                self.reject(kernel, sink, offset, e);
                Step::Continue
            }
        }
    }

    /// Moves past a well-formed image and back to scanning.
    fn skip(&mut self, image: &Image<'_>) {
        self.offset = self.offset.saturating_add(image.total_size());
        self.phase = Phase::Scanning;
    }

    fn reject<M: MemoryProtection, const N: usize>(
        &mut self,
        kernel: &mut Kernel<'f, '_, M, N>,
        sink: &mut dyn DiagnosticSink,
        offset: u32,
        error: LoadError,
    ) {
        ringbuf_entry!(kernel.trace, Trace::Rejected { offset, error });
        let failure = LoadFailure { offset, error };
        sink.load_failure(&failure);
        let r = &mut self.report;
        LoadReport::note(&mut r.dropped, &mut r.failures, failure);
    }

    fn finish<M: MemoryProtection, const N: usize>(
        &mut self,
        kernel: &mut Kernel<'f, '_, M, N>,
        end: ScanEnd,
    ) -> Step {
        if let Phase::Checking { .. } = self.phase {
            self.checker.cancel();
        }
        self.phase = Phase::Finished(end);
        if self.report.end.is_none() {
            self.report.end = Some(end);
            ringbuf_entry!(kernel.trace, Trace::ScanEnd(end));
        }
        Step::Finished(end)
    }
}
