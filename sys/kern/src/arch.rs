// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory protection hardware.
//!
//! The rest of the kernel talks to the MPU only through the
//! [`MemoryProtection`] trait, and never names a chip. Each supported MPU
//! flavor lives in a submodule and models its region registers in memory, so
//! that what `apply` would have written is observable on the host.
//!
//! `BoardMpu` names the flavor selected for this build.

use heapless::Vec;
use kerncore::{MemoryRegion, Span};

pub mod armv7m;
pub mod armv8m;

cfg_if::cfg_if! {
    if #[cfg(feature = "armv8m")] {
        pub type BoardMpu = armv8m::ArmV8m;
    } else {
        pub type BoardMpu = armv7m::ArmV7m;
    }
}

/// Regions in one process's protection configuration: its flash and its RAM.
pub const MAX_REGIONS: usize = 4;

/// Number of region slots in the modeled hardware.
pub const HW_REGIONS: usize = 8;

// This is defined outside the bitflags! macro so that we can derive what we
// like on it.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionAttributes(u32);

bitflags::bitflags! {
    impl RegionAttributes: u32 {
        /// Region can be read by the process.
        const READ = 1 << 0;
        /// Region can be written by the process.
        const WRITE = 1 << 1;
        /// Region can contain executable code for the process.
        const EXECUTE = 1 << 2;
    }
}

impl RegionAttributes {
    pub const FLASH: Self = Self::READ.union(Self::EXECUTE);
    pub const RAM: Self = Self::READ.union(Self::WRITE);
}

/// One enabled region, with the register values that encode it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionDesc {
    pub span: Span,
    pub attributes: RegionAttributes,
    /// Architecture-specific register pair: `(RBAR, RASR)` on v7-M,
    /// `(RBAR, RLAR)` on v8-M.
    pub raw: [u32; 2],
}

impl MemoryRegion for RegionDesc {
    #[inline(always)]
    fn contains(&self, addr: u32) -> bool {
        self.span.contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> u32 {
        self.span.base()
    }

    #[inline(always)]
    fn end_addr(&self) -> u32 {
        self.span.end()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MpuError {
    /// The hardware can't express a region with this base and length.
    Unencodable { base: u32, len: u32 },
    /// The two spans handed to `configure` overlap.
    Overlap,
    TooManyRegions,
}

/// A complete, encoded protection configuration for one process.
///
/// # Invariants
///
/// `regions` is sorted by base address and the regions don't overlap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtectionConfig {
    regions: Vec<RegionDesc, MAX_REGIONS>,
    flash: Span,
    ram: Span,
}

impl ProtectionConfig {
    /// Builds a configuration from encoded regions. Used by the
    /// architecture modules.
    pub(crate) fn from_regions(
        flash: RegionDesc,
        ram: RegionDesc,
    ) -> Result<Self, MpuError> {
        if flash.span.overlaps(&ram.span) {
            return Err(MpuError::Overlap);
        }
        let mut regions = Vec::new();
        let (lo, hi) = if flash.span.base() <= ram.span.base() {
            (flash, ram)
        } else {
            (ram, flash)
        };
        regions.push(lo).map_err(|_| MpuError::TooManyRegions)?;
        regions.push(hi).map_err(|_| MpuError::TooManyRegions)?;
        Ok(Self {
            regions,
            flash: flash.span,
            ram: ram.span,
        })
    }

    pub fn regions(&self) -> &[RegionDesc] {
        &self.regions
    }

    pub fn flash(&self) -> Span {
        self.flash
    }

    /// The RAM the process can actually touch.
    pub fn ram(&self) -> Span {
        self.ram
    }

    /// First address above the process's accessible RAM. The initial stack
    /// pointer goes here.
    pub fn kernel_break(&self) -> u32 {
        self.ram.end()
    }

    /// Checks whether the process may access all of `span` with at least
    /// `attributes`.
    pub fn can_access(&self, span: Span, attributes: RegionAttributes) -> bool {
        kerncore::can_access(span, &self.regions, |r| {
            r.attributes.contains(attributes)
        })
    }
}

/// One flavor of memory protection unit.
pub trait MemoryProtection {
    /// Finds the lowest region of at least `min_len` bytes inside
    /// `[lower, upper)` that this MPU can express. The result may be larger
    /// than asked for.
    fn fit_region(&self, lower: u32, upper: u32, min_len: u32) -> Option<Span>;

    /// Returns the longest prefix of `region` no longer than `len` that can
    /// be enabled on its own. `region` must have come from `fit_region`.
    fn accessible_prefix(&self, region: Span, len: u32) -> Option<Span>;

    /// Checks whether `span` can be covered exactly by one region.
    fn can_protect(&self, span: Span) -> bool;

    /// Encodes flash (read/execute) and RAM (read/write) regions.
    fn configure(
        &self,
        flash: Span,
        ram: Span,
    ) -> Result<ProtectionConfig, MpuError>;

    /// Loads a configuration into the hardware, replacing whatever was there.
    fn apply(&mut self, config: &ProtectionConfig);
}

impl<T: MemoryProtection + ?Sized> MemoryProtection for &mut T {
    fn fit_region(&self, lower: u32, upper: u32, min_len: u32) -> Option<Span> {
        (**self).fit_region(lower, upper, min_len)
    }

    fn accessible_prefix(&self, region: Span, len: u32) -> Option<Span> {
        (**self).accessible_prefix(region, len)
    }

    fn can_protect(&self, span: Span) -> bool {
        (**self).can_protect(span)
    }

    fn configure(
        &self,
        flash: Span,
        ram: Span,
    ) -> Result<ProtectionConfig, MpuError> {
        (**self).configure(flash, ram)
    }

    fn apply(&mut self, config: &ProtectionConfig) {
        (**self).apply(config)
    }
}

/// In-memory copy of an MPU's region registers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RegisterFile {
    slots: [[u32; 2]; HW_REGIONS],
    loads: u32,
}

impl RegisterFile {
    pub const fn new() -> Self {
        Self {
            slots: [[0; 2]; HW_REGIONS],
            loads: 0,
        }
    }

    /// Writes each region into successive slots and clears the rest. `tag`
    /// lets the caller fold the slot number into the first register.
    pub(crate) fn load(
        &mut self,
        config: &ProtectionConfig,
        tag: impl Fn(usize, [u32; 2]) -> [u32; 2],
    ) {
        self.slots = [[0; 2]; HW_REGIONS];
        for (i, region) in config.regions().iter().enumerate() {
            self.slots[i] = tag(i, region.raw);
        }
        self.loads = self.loads.wrapping_add(1);
    }

    pub fn slots(&self) -> &[[u32; 2]; HW_REGIONS] {
        &self.slots
    }

    /// Number of times a configuration has been loaded.
    pub fn loads(&self) -> u32 {
        self.loads
    }
}
