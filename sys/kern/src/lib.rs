// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process loading, isolation, and fault handling.
//!
//! This is the part of the kernel that decides which application images in
//! flash become processes, fences each process into its own memory with the
//! protection unit, and decides what happens to a process when it faults.
//!
//! The pieces, leaves first:
//!
//! - [`image`] parses an image header out of flash without trusting it.
//! - [`creds`] checks an image's credentials against a policy, using an
//!   asynchronous [`crypto::CryptoEngine`].
//! - [`ident`] derives the application identifier and short id.
//! - [`region`] carves RAM out of a pool, shaped by [`arch::MemoryProtection`].
//! - [`process`] is the process control block and its state machine.
//! - [`fault`] holds the policies that decide what a fault means.
//! - [`loader`] walks flash and drives all of the above, one step at a time.
//! - [`kernel`] owns the process table and everything that mutates it.
//!
//! # Design principles
//!
//! 1. Flash is untrusted. Every length and offset read from an image is
//!    checked before it is used, and a bad image costs the loader that image
//!    and nothing else.
//! 2. No allocation. Every table has a capacity fixed at compile time, and
//!    running out of room is an error the caller sees.
//! 3. Hardware sits behind traits. The memory protection unit and the
//!    cryptographic engine are reached only through [`arch::MemoryProtection`]
//!    and [`crypto::CryptoEngine`], so everything else runs on the host.

// Allow std-y things to be used in test.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

pub mod arch;
pub mod cap;
pub mod config;
pub mod creds;
pub mod crypto;
pub mod diag;
pub mod err;
pub mod fail;
pub mod fault;
pub mod ident;
pub mod image;
pub mod kernel;
pub mod loader;
pub mod process;
pub mod region;
pub mod table;
pub mod trace;

pub use abi::{FaultInfo, FaultSource, ProcessId, ProcessState, ShortId};
pub use kerncore::Span;
