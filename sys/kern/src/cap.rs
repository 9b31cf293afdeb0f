// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability tokens for privileged kernel operations.
//!
//! A capability is a zero-sized value that only this crate can construct.
//! [`Kernel::new`](crate::kernel::Kernel::new) hands out exactly one of each,
//! and operations that change another process's fate take a reference to
//! the right one. Code that was never given the token can't call them.

mod sealed {
    pub trait Sealed {}
}

/// Marker for capability types. Can't be implemented outside this crate.
pub trait Capability: sealed::Sealed {}

/// Permits stopping, resuming, terminating, restarting and reclaiming
/// processes.
#[derive(Debug)]
pub struct ProcessManagementCap {
    _private: (),
}

/// Permits scanning flash and admitting new processes.
#[derive(Debug)]
pub struct LoadCap {
    _private: (),
}

impl sealed::Sealed for ProcessManagementCap {}
impl Capability for ProcessManagementCap {}
impl sealed::Sealed for LoadCap {}
impl Capability for LoadCap {}

/// The full set handed out at kernel creation.
#[derive(Debug)]
pub struct Capabilities {
    pub process_management: ProcessManagementCap,
    pub load: LoadCap,
}

impl Capabilities {
    pub(crate) fn mint() -> Self {
        Self {
            process_management: ProcessManagementCap { _private: () },
            load: LoadCap { _private: () },
        }
    }
}
