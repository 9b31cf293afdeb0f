// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-side configuration for loading and running processes.
//!
//! These types deserialize from the `[loader]` table of an application's
//! config file (see `build-kconfig`), but they are plain values, and a board
//! can just as well write one out as a `const`.

use serde::Deserialize;

/// Version of the kernel ABI, compared against an image's `KernelVersion`
/// TLV. An image is compatible if the majors match and the image's minor is
/// no newer than ours.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelVersion {
    pub major: u16,
    pub minor: u16,
}

impl KernelVersion {
    pub const CURRENT: Self = Self { major: 2, minor: 0 };

    pub fn accepts(&self, image_major: u16, image_minor: u16) -> bool {
        image_major == self.major && image_minor <= self.minor
    }
}

/// What to do when a freshly derived short id is already held by a loaded
/// process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Refuse to load the newcomer.
    Reject,
    /// Probe upward for the nearest free id and record that we did so.
    Renumber,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoaderConfig {
    /// Upper bound on loaded processes, in addition to the table's own
    /// capacity.
    #[serde(default = "LoaderConfig::default_max_processes")]
    pub max_processes: usize,
    /// Bytes at the top of each process's RAM region kept for the kernel's
    /// own per-process bookkeeping.
    #[serde(default)]
    pub kernel_reserve: u32,
    #[serde(default = "LoaderConfig::default_collision")]
    pub short_id_collision: CollisionPolicy,
    #[serde(default = "LoaderConfig::default_kernel_version")]
    pub kernel_version: KernelVersion,
    /// How many consecutive empty polls of the crypto engine `load_all`
    /// tolerates before abandoning a credential check.
    #[serde(default = "LoaderConfig::default_poll_budget")]
    pub check_poll_budget: u32,
    /// Record every scan step in the trace buffer, not just outcomes.
    #[serde(default)]
    pub trace_scan: bool,
}

impl LoaderConfig {
    pub const DEFAULT: Self = Self {
        max_processes: usize::MAX,
        kernel_reserve: 0,
        short_id_collision: CollisionPolicy::Reject,
        kernel_version: KernelVersion::CURRENT,
        check_poll_budget: 64,
        trace_scan: false,
    };

    fn default_max_processes() -> usize {
        Self::DEFAULT.max_processes
    }

    fn default_collision() -> CollisionPolicy {
        Self::DEFAULT.short_id_collision
    }

    fn default_kernel_version() -> KernelVersion {
        Self::DEFAULT.kernel_version
    }

    fn default_poll_budget() -> u32 {
        Self::DEFAULT.check_poll_budget
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
