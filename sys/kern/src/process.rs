// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process control blocks and their state machine.
//!
//! A `Process` borrows its image from flash for as long as it exists, and
//! remembers where its RAM and protection regions are. Its lifecycle follows
//! the diagram on [`ProcessState`]; [`transition`] is the only place that
//! decides whether a move is legal.

use abi::{FaultInfo, ProcessId, ProcessState};
use kerncore::Span;

use crate::arch::ProtectionConfig;
use crate::creds::Verification;
use crate::ident::Identity;
use crate::image::{self, Image, ParseError};

/// Things that can happen to a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Start,
    Yield,
    Wake,
    Fault,
    Stop,
    Resume,
    Restart,
    Terminate,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateError {
    Illegal { from: ProcessState, event: Event },
}

/// Computes the state `event` leads to from `from`.
pub fn transition(
    from: ProcessState,
    event: Event,
) -> Result<ProcessState, StateError> {
    use ProcessState::{
        Faulted, Running, Stopped, Terminated, Unstarted, Yielded,
    };

    let to = match (from, event) {
        (Unstarted, Event::Start) => Running,
        (Running, Event::Yield) => Yielded,
        (Yielded, Event::Wake) => Running,
        (Running | Yielded, Event::Fault) => Faulted,
        (Running | Yielded, Event::Stop) => Stopped,
        (Stopped, Event::Resume) => Running,
        (Faulted, Event::Restart) => Unstarted,
        (Terminated, Event::Terminate) => {
            return Err(StateError::Illegal { from, event })
        }
        (_, Event::Terminate) => Terminated,
        _ => return Err(StateError::Illegal { from, event }),
    };
    Ok(to)
}

/// Register state saved while the process is off the CPU.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedState {
    pub pc: u32,
    pub sp: u32,
    /// Argument registers, r0-r3.
    pub regs: [u32; 4],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SyscallRecord {
    pub number: u32,
    pub args: [u32; 4],
}

/// Everything captured at the moment a process faulted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaultRecord {
    pub fault: FaultInfo,
    pub pc: u32,
    pub sp: u32,
    pub last_syscall: Option<SyscallRecord>,
    pub state_before: ProcessState,
    pub protection: ProtectionConfig,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub syscalls: u32,
    pub timeslices: u32,
    pub restarts: u32,
    pub faults: u32,
}

/// Restarting can fail if the image in flash no longer parses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartError {
    State(StateError),
    Image(ParseError),
}

impl From<StateError> for RestartError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<ParseError> for RestartError {
    fn from(e: ParseError) -> Self {
        Self::Image(e)
    }
}

#[derive(Clone, Debug)]
pub struct Process<'f> {
    id: ProcessId,
    identity: Identity,
    name: Option<&'f str>,
    image: &'f [u8],
    flash: Span,
    ram: Span,
    protection: ProtectionConfig,
    entry: u32,
    app_version: u32,
    verification: Verification,

    state: ProcessState,
    save: SavedState,
    counters: Counters,
    last_syscall: Option<SyscallRecord>,
    fault: Option<FaultRecord>,
    /// Set when a fault is captured, cleared once a policy decision has been
    /// applied to it.
    fault_pending: bool,
}

/// Everything the loader settled on for one image.
pub(crate) struct Admission<'f> {
    pub image: Image<'f>,
    pub flash_base: u32,
    pub identity: Identity,
    pub verification: Verification,
    pub ram: Span,
    pub protection: ProtectionConfig,
}

impl<'f> Process<'f> {
    pub(crate) fn new(id: ProcessId, admission: Admission<'f>) -> Self {
        let Admission {
            image,
            flash_base,
            identity,
            verification,
            ram,
            protection,
        } = admission;
        let flash_len = image.integrity_region().len() as u32;
        let mut p = Self {
            id,
            identity,
            name: image.package_name(),
            image: image.bytes(),
            flash: Span::new(flash_base, flash_len).unwrap_or_default(),
            ram,
            protection,
            entry: 0,
            app_version: image.app_version(),
            verification,
            state: ProcessState::Unstarted,
            save: SavedState::default(),
            counters: Counters::default(),
            last_syscall: None,
            fault: None,
            fault_pending: false,
        };
        p.reset_context(&image);
        p
    }

    /// Points the saved context at the image's entry, with the stack at the
    /// top of the process's accessible RAM.
    fn reset_context(&mut self, image: &Image<'_>) {
        self.entry = self.flash.base() + image.entry_offset().unwrap_or(0);
        let accessible = self.protection.ram();
        let stack_top = self.protection.kernel_break();
        self.save = SavedState {
            pc: self.entry,
            sp: stack_top,
            regs: [accessible.base(), accessible.len(), stack_top, 0],
        };
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn name(&self) -> Option<&'f str> {
        self.name
    }

    pub fn image(&self) -> &'f [u8] {
        self.image
    }

    /// Flash the process may execute: header through the end of its binary.
    pub fn flash(&self) -> Span {
        self.flash
    }

    /// The RAM block held for this process, kernel reserve included.
    pub fn ram(&self) -> Span {
        self.ram
    }

    pub fn protection(&self) -> &ProtectionConfig {
        &self.protection
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn app_version(&self) -> u32 {
        self.app_version
    }

    pub fn verification(&self) -> &Verification {
        &self.verification
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }

    pub fn save(&self) -> &SavedState {
        &self.save
    }

    /// Lets the context-switch path store registers.
    pub fn save_mut(&mut self) -> &mut SavedState {
        &mut self.save
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn last_syscall(&self) -> Option<&SyscallRecord> {
        self.last_syscall.as_ref()
    }

    /// The most recent fault, kept across restarts.
    pub fn fault(&self) -> Option<&FaultRecord> {
        self.fault.as_ref()
    }

    /// Checks whether a captured fault is still waiting for a decision.
    pub fn fault_pending(&self) -> bool {
        self.fault_pending
    }

    fn apply(&mut self, event: Event) -> Result<(), StateError> {
        self.state = transition(self.state, event)?;
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), StateError> {
        self.apply(Event::Start)
    }

    pub(crate) fn yield_now(&mut self) -> Result<(), StateError> {
        self.apply(Event::Yield)
    }

    pub(crate) fn wake(&mut self) -> Result<(), StateError> {
        self.apply(Event::Wake)
    }

    pub(crate) fn stop(&mut self) -> Result<(), StateError> {
        self.apply(Event::Stop)
    }

    pub(crate) fn resume(&mut self) -> Result<(), StateError> {
        self.apply(Event::Resume)
    }

    pub(crate) fn terminate(&mut self) -> Result<(), StateError> {
        self.apply(Event::Terminate)?;
        self.fault_pending = false;
        Ok(())
    }

    /// Captures `fault` and marks the process Faulted.
    pub(crate) fn fault_with(
        &mut self,
        fault: FaultInfo,
    ) -> Result<(), StateError> {
        let state_before = self.state;
        self.apply(Event::Fault)?;
        self.fault = Some(FaultRecord {
            fault,
            pc: self.save.pc,
            sp: self.save.sp,
            last_syscall: self.last_syscall,
            state_before,
            protection: self.protection.clone(),
        });
        self.fault_pending = true;
        self.counters.faults = self.counters.faults.wrapping_add(1);
        Ok(())
    }

    /// Records that the policy's decision for the current fault was carried
    /// out.
    pub(crate) fn mark_decided(&mut self) {
        self.fault_pending = false;
    }

    /// Resets a Faulted process to run again from its entry point under a
    /// new id. Identity, regions and the last fault record are kept.
    pub(crate) fn restart(
        &mut self,
        new_id: ProcessId,
    ) -> Result<(), RestartError> {
        transition(self.state, Event::Restart)?;
        let image = image::parse(self.image)?;

        self.state = ProcessState::Unstarted;
        self.id = new_id;
        self.reset_context(&image);
        self.last_syscall = None;
        self.fault_pending = false;
        self.counters.restarts = self.counters.restarts.wrapping_add(1);
        Ok(())
    }

    pub(crate) fn note_syscall(&mut self, record: SyscallRecord) {
        self.last_syscall = Some(record);
        self.counters.syscalls = self.counters.syscalls.wrapping_add(1);
    }

    pub(crate) fn note_timeslice(&mut self) {
        self.counters.timeslices = self.counters.timeslices.wrapping_add(1);
    }
}
