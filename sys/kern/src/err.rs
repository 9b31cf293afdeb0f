// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Each stage of loading has its own error type; `LoadError` gathers them so
//! the loader can record one value per rejected candidate and decide, with
//! [`LoadError::is_terminal`], whether to keep scanning.

use crate::creds::CheckError;
use crate::ident::IdentityError;
use crate::image::ParseError;
use crate::process::{RestartError, StateError};
use crate::region::AllocError;

/// Why a candidate image didn't become a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadError {
    Parse(ParseError),
    Credentials(CheckError),
    Identity(IdentityError),
    Alloc(AllocError),
    /// The image's enable flag is clear.
    Disabled,
    IncompatibleKernel { major: u16, minor: u16 },
    /// Another loaded process already has this application identifier.
    DuplicateAppId,
    TableFull,
}

impl LoadError {
    /// Checks whether this error means no later candidate can load either.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Alloc(e) => e.is_terminal(),
            Self::TableFull => true,
            _ => false,
        }
    }
}

impl From<ParseError> for LoadError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<CheckError> for LoadError {
    fn from(e: CheckError) -> Self {
        Self::Credentials(e)
    }
}

impl From<IdentityError> for LoadError {
    fn from(e: IdentityError) -> Self {
        Self::Identity(e)
    }
}

impl From<AllocError> for LoadError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

/// Errors from operations on loaded processes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// The id names a slot whose occupant has since changed, or an empty
    /// slot.
    StaleId,
    State(StateError),
    /// The system has halted; nothing runs or changes any more.
    Halted,
    /// The operation is only for a process that is on the CPU.
    NotRunning,
    /// Only Terminated processes can be reclaimed.
    NotTerminated,
    /// The image no longer parses, so the process can't be rebuilt.
    RestartFailed(ParseError),
}

impl From<StateError> for KernelError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<RestartError> for KernelError {
    fn from(e: RestartError) -> Self {
        match e {
            RestartError::State(s) => Self::State(s),
            RestartError::Image(p) => Self::RestartFailed(p),
        }
    }
}
