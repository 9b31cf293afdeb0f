// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel proper: the process table and everything that acts on it.
//!
//! `Kernel` owns the table, the RAM allocator, the MPU and the trace buffer.
//! Loading goes through [`Kernel::load_all`] (or a [`Loader`] driven by
//! hand). After that, the scheduler picks runnable processes round-robin,
//! exceptions land in [`Kernel::record_fault`], and [`Kernel::service_faults`]
//! asks the fault policy what to do about each one.
//!
//! Operations that change another process's fate take a capability from
//! [`crate::cap`]; `new` hands out the only set.

use abi::{FaultInfo, ProcessId, ProcessState, ShortId};
use kerncore::Span;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::arch::MemoryProtection;
use crate::cap::{Capabilities, LoadCap, ProcessManagementCap};
use crate::config::LoaderConfig;
use crate::creds::{CheckError, Verification};
use crate::crypto::CryptoEngine;
use crate::diag::{DiagnosticSink, FaultReport};
use crate::err::{KernelError, LoadError};
use crate::fail::Epitaph;
use crate::fault::{Action, Decision, FaultPolicy};
use crate::ident::{self, AppId, IdentityPolicy};
use crate::image::Image;
use crate::loader::{FlashRegion, LoadReport, Loader, LoaderPolicies, Step};
use crate::process::{Admission, Event, Process, StateError, SyscallRecord};
use crate::region::{AllocError, AllocRequest, RegionAllocator};
use crate::table::ProcessTable;
use crate::trace::{Trace, TRACE_DEPTH};

/// What `admit` made of a candidate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Admitted {
    pub id: ProcessId,
    pub short_id: ShortId,
    pub renumbered_from: Option<ShortId>,
}

pub struct Kernel<'f, 'p, M, const N: usize> {
    table: ProcessTable<'f, N>,
    allocator: RegionAllocator,
    mpu: M,
    policy: &'p dyn FaultPolicy,
    config: LoaderConfig,
    pub(crate) trace: Ringbuf<Trace, TRACE_DEPTH>,
    /// Slot the round-robin scan starts from next time.
    cursor: usize,
    current: Option<ProcessId>,
    epitaph: Option<Epitaph>,
    /// Epoch of the most recent scan; see [`crate::crypto::CheckToken`].
    scan_epoch: u16,
}

impl<'f, 'p, M: MemoryProtection, const N: usize> Kernel<'f, 'p, M, N> {
    /// Makes a kernel with an empty table, taking RAM for processes from
    /// `pool`. Returns the only capabilities for it.
    pub fn new(
        mpu: M,
        pool: Span,
        policy: &'p dyn FaultPolicy,
        config: LoaderConfig,
    ) -> (Self, Capabilities) {
        let kernel = Self {
            table: ProcessTable::new(),
            allocator: RegionAllocator::new(pool),
            mpu,
            policy,
            config,
            trace: Ringbuf::new(Trace::None),
            cursor: 0,
            current: None,
            epitaph: None,
            scan_epoch: 0,
        };
        (kernel, Capabilities::mint())
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn trace(&self) -> &Ringbuf<Trace, TRACE_DEPTH> {
        &self.trace
    }

    pub fn mpu(&self) -> &M {
        &self.mpu
    }

    pub fn allocator(&self) -> &RegionAllocator {
        &self.allocator
    }

    /// The epitaph, once the system has halted.
    pub fn halted(&self) -> Option<&str> {
        self.epitaph.as_ref().map(Epitaph::as_str)
    }

    /// The process most recently handed the CPU by `schedule`.
    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process<'f>> {
        self.table.get(id)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process<'f>> + '_ {
        self.table.iter()
    }

    pub fn short_id(&self, id: ProcessId) -> Option<ShortId> {
        self.table.get(id).map(|p| p.identity().short_id)
    }

    pub fn app_id(&self, id: ProcessId) -> Option<&AppId> {
        self.table.get(id).map(|p| &p.identity().app_id)
    }

    pub fn lookup_short_id(&self, short_id: ShortId) -> Option<ProcessId> {
        self.table.find_short_id(short_id)
    }

    /// Processes allowed at once: the table's capacity or the configured
    /// limit, whichever is smaller.
    pub fn process_limit(&self) -> usize {
        N.min(self.config.max_processes)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.table.len() >= self.process_limit()
    }

    /// Starts a new scan epoch. Zero is left to checkers used on their own.
    pub(crate) fn next_scan_epoch(&mut self) -> u16 {
        self.scan_epoch = self.scan_epoch.wrapping_add(1).max(1);
        self.scan_epoch
    }

    pub(crate) fn owns_flash(&self, base: u32) -> bool {
        self.table.owns_flash(base)
    }

    /// Scans `flash` and loads everything it can, pumping `engine` while a
    /// credential check is outstanding.
    pub fn load_all(
        &mut self,
        flash: FlashRegion<'f>,
        policies: LoaderPolicies<'_>,
        engine: &mut dyn CryptoEngine,
        sink: &mut dyn DiagnosticSink,
        cap: &LoadCap,
    ) -> LoadReport {
        let mut loader = Loader::new(flash, policies, cap);
        let mut idle = 0;
        loop {
            match loader.step(self, engine, sink) {
                Step::Finished(_) => break,
                Step::Continue => idle = 0,
                Step::Waiting => match engine.poll() {
                    Some((token, verdict)) => {
                        loader.on_check_complete(token, verdict);
                        idle = 0;
                    }
                    None => {
                        idle += 1;
                        if idle > self.config.check_poll_budget {
                            loader.abandon_check(
                                self,
                                sink,
                                CheckError::TimedOut,
                            );
                            idle = 0;
                        }
                    }
                },
            }
        }
        loader.into_report()
    }

    /// Gives a checked image an identity and RAM, and a slot in the table.
    pub(crate) fn admit(
        &mut self,
        flash_scan: Span,
        flash_base: u32,
        image: Image<'f>,
        verification: Verification,
        identity: &dyn IdentityPolicy,
    ) -> Result<Admitted, LoadError> {
        if self.is_full() || self.table.free_index().is_none() {
            return Err(LoadError::TableFull);
        }

        let assigned = ident::assign(
            identity,
            &image,
            &verification,
            &self.table,
            self.config.short_id_collision,
        )?;
        if self.table.find_app_id(&assigned.identity.app_id).is_some() {
            return Err(LoadError::DuplicateAppId);
        }

        let flash_len = image.integrity_region().len() as u32;
        let fixed = image.fixed_addresses();
        let request = AllocRequest {
            flash: Span::new(flash_base, flash_len)
                .ok_or(AllocError::FlashOutsideScan)?,
            min_ram: image.minimum_ram_size(),
            kernel_reserve: self.config.kernel_reserve,
            fixed_ram: fixed.ram,
            fixed_flash: fixed.flash,
        };
        let allocation =
            self.allocator.allocate(&self.mpu, flash_scan, &request)?;
        let ram = allocation.ram;

        let admission = Admission {
            image,
            flash_base,
            identity: assigned.identity,
            verification,
            ram,
            protection: allocation.protection,
        };
        let Some(id) = self.table.insert_with(|id| Process::new(id, admission))
        else {
            self.allocator.release(ram);
            return Err(LoadError::TableFull);
        };

        if let Some(from) = assigned.renumbered_from {
            ringbuf_entry!(
                self.trace,
                Trace::Renumbered {
                    from,
                    to: assigned.identity.short_id
                }
            );
        }
        Ok(Admitted {
            id,
            short_id: assigned.identity.short_id,
            renumbered_from: assigned.renumbered_from,
        })
    }

    /// Applies `f` to the live process `id`, tracing any state change.
    fn with_process(
        &mut self,
        id: ProcessId,
        f: impl FnOnce(&mut Process<'f>) -> Result<(), StateError>,
    ) -> Result<(), KernelError> {
        if self.epitaph.is_some() {
            return Err(KernelError::Halted);
        }
        let p = self.table.get_mut(id).ok_or(KernelError::StaleId)?;
        let from = p.state();
        f(p)?;
        let to = p.state();
        if from != to {
            ringbuf_entry!(self.trace, Trace::State { id, from, to });
        }
        if self.current == Some(id) && !to.is_runnable() {
            self.current = None;
        }
        Ok(())
    }

    fn require_running(&self, id: ProcessId) -> Result<(), KernelError> {
        if self.epitaph.is_some() {
            return Err(KernelError::Halted);
        }
        match self.table.get(id) {
            None => Err(KernelError::StaleId),
            Some(p) if p.state() == ProcessState::Running => Ok(()),
            Some(_) => Err(KernelError::NotRunning),
        }
    }

    /// Picks the next runnable process after the last one picked, starting
    /// it if it has never run, and loads its protection into the MPU.
    pub fn schedule(&mut self) -> Option<ProcessId> {
        if self.epitaph.is_some() || N == 0 {
            self.current = None;
            return None;
        }
        for k in 0..N {
            let i = (self.cursor + k) % N;
            let Some(p) = self.table.by_index_mut(i) else {
                continue;
            };
            if !p.is_runnable() {
                continue;
            }
            let id = p.id();
            if p.state() == ProcessState::Unstarted {
                // Unstarted always has a Start transition.
                if p.start().is_ok() {
                    ringbuf_entry!(
                        self.trace,
                        Trace::State {
                            id,
                            from: ProcessState::Unstarted,
                            to: ProcessState::Running
                        }
                    );
                }
            }
            self.mpu.apply(p.protection());
            self.cursor = (i + 1) % N;
            self.current = Some(id);
            return Some(id);
        }
        self.current = None;
        None
    }

    pub fn yield_process(&mut self, id: ProcessId) -> Result<(), KernelError> {
        self.with_process(id, Process::yield_now)
    }

    pub fn wake(&mut self, id: ProcessId) -> Result<(), KernelError> {
        self.with_process(id, Process::wake)
    }

    /// Notes a syscall made by a running process.
    pub fn record_syscall(
        &mut self,
        id: ProcessId,
        number: u32,
        args: [u32; 4],
    ) -> Result<(), KernelError> {
        self.require_running(id)?;
        if let Some(p) = self.table.get_mut(id) {
            p.note_syscall(SyscallRecord { number, args });
        }
        Ok(())
    }

    pub fn timeslice_expired(&mut self, id: ProcessId) -> Result<(), KernelError> {
        self.require_running(id)?;
        if let Some(p) = self.table.get_mut(id) {
            p.note_timeslice();
        }
        Ok(())
    }

    /// Exception path: captures `fault` and marks the process Faulted. No
    /// decision is made here; that waits for `service_faults`.
    pub fn record_fault(
        &mut self,
        id: ProcessId,
        fault: FaultInfo,
    ) -> Result<(), KernelError> {
        self.with_process(id, |p| p.fault_with(fault))?;
        ringbuf_entry!(self.trace, Trace::Fault { id, fault });
        Ok(())
    }

    /// Policy path: asks the fault policy about every captured fault that
    /// hasn't been decided yet, reports it, and carries out the decision.
    /// Returns how many faults were handled.
    pub fn service_faults(&mut self, sink: &mut dyn DiagnosticSink) -> usize {
        let mut handled = 0;
        for i in 0..N {
            if self.epitaph.is_some() {
                break;
            }
            if self.decide_and_apply(i, sink).is_some() {
                handled += 1;
            }
        }
        handled
    }

    /// Both paths at once, for a fault that should be dealt with right
    /// away.
    pub fn handle_fault(
        &mut self,
        id: ProcessId,
        fault: FaultInfo,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Decision, KernelError> {
        self.record_fault(id, fault)?;
        self.decide_and_apply(id.index(), sink)
            .ok_or(KernelError::StaleId)
    }

    fn decide_and_apply(
        &mut self,
        index: usize,
        sink: &mut dyn DiagnosticSink,
    ) -> Option<Decision> {
        let p = self.table.by_index(index)?;
        if !p.fault_pending() || p.state() != ProcessState::Faulted {
            return None;
        }
        let id = p.id();
        let decision = self.policy.decide(p);
        sink.fault(&FaultReport {
            process: p,
            decision,
        });
        ringbuf_entry!(
            self.trace,
            Trace::Decision {
                id,
                action: decision.action
            }
        );

        match decision.action {
            Action::Stop => {
                if let Some(p) = self.table.by_index_mut(index) {
                    p.mark_decided();
                }
            }
            Action::Terminate => {
                // Faulted always has a Terminate transition.
                let _ = self.with_process(id, Process::terminate);
            }
            Action::Restart => {
                if self.restart_slot(index).is_err() {
                    let _ = self.with_process(id, Process::terminate);
                }
            }
            Action::HaltAll => {
                let p = self.table.by_index_mut(index)?;
                p.mark_decided();
                let epitaph = Epitaph::new(format_args!(
                    "halt: process {} ({}) faulted: {:?}",
                    p.identity().short_id,
                    p.name().unwrap_or("-"),
                    p.fault().map(|r| r.fault),
                ));
                self.epitaph = Some(epitaph);
                self.current = None;
                ringbuf_entry!(self.trace, Trace::Halt { id });
            }
        }
        Some(decision)
    }

    /// Restarts whatever is in slot `index` under a fresh id.
    fn restart_slot(&mut self, index: usize) -> Result<ProcessId, KernelError> {
        let old = self
            .table
            .by_index(index)
            .map(|p| p.id())
            .ok_or(KernelError::StaleId)?;
        let new_id = self.table.fresh_id(index);
        let p = self.table.by_index_mut(index).ok_or(KernelError::StaleId)?;
        let from = p.state();
        p.restart(new_id)?;
        ringbuf_entry!(
            self.trace,
            Trace::State {
                id: old,
                from,
                to: ProcessState::Unstarted
            }
        );
        if self.current == Some(old) {
            self.current = None;
        }
        Ok(new_id)
    }

    pub fn stop(
        &mut self,
        id: ProcessId,
        _cap: &ProcessManagementCap,
    ) -> Result<(), KernelError> {
        self.with_process(id, Process::stop)
    }

    pub fn resume(
        &mut self,
        id: ProcessId,
        _cap: &ProcessManagementCap,
    ) -> Result<(), KernelError> {
        self.with_process(id, Process::resume)
    }

    pub fn terminate(
        &mut self,
        id: ProcessId,
        _cap: &ProcessManagementCap,
    ) -> Result<(), KernelError> {
        self.with_process(id, Process::terminate)
    }

    /// Restarts a Faulted process by hand. Returns its new id.
    pub fn restart(
        &mut self,
        id: ProcessId,
        _cap: &ProcessManagementCap,
    ) -> Result<ProcessId, KernelError> {
        if self.epitaph.is_some() {
            return Err(KernelError::Halted);
        }
        let p = self.table.get(id).ok_or(KernelError::StaleId)?;
        if p.state() != ProcessState::Faulted {
            return Err(StateError::Illegal {
                from: p.state(),
                event: Event::Restart,
            }
            .into());
        }
        self.restart_slot(id.index())
    }

    /// Frees the slot and RAM of a Terminated process.
    pub fn reclaim(
        &mut self,
        id: ProcessId,
        _cap: &ProcessManagementCap,
    ) -> Result<(), KernelError> {
        let p = self.table.get(id).ok_or(KernelError::StaleId)?;
        if p.state() != ProcessState::Terminated {
            return Err(KernelError::NotTerminated);
        }
        if let Some(p) = self.table.remove(id) {
            self.allocator.release(p.ram());
            ringbuf_entry!(self.trace, Trace::Reclaimed { id });
        }
        Ok(())
    }
}
