// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent address arithmetic for the kernel.
//!
//! Everything here is pure and works on plain `u32` addresses, so that it can
//! be exercised on the host without any of the kernel's types.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

use core::cmp::Ordering;

/// A half-open range of addresses, `[base, base + len)`.
///
/// # Invariants
///
/// `base + len` does not overflow. Spans cannot touch the very end of the
/// address space; nothing the kernel manages lives there.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Span {
    base: u32,
    len: u32,
}

impl Span {
    /// Makes a span, or `None` if it would wrap the address space.
    pub const fn new(base: u32, len: u32) -> Option<Self> {
        match base.checked_add(len) {
            Some(_) => Some(Self { base, len }),
            None => None,
        }
    }

    /// Makes a span from its two ends, or `None` if they are reversed.
    pub const fn from_bounds(base: u32, end: u32) -> Option<Self> {
        if end < base {
            None
        } else {
            Some(Self {
                base,
                len: end - base,
            })
        }
    }

    pub const fn base(&self) -> u32 {
        self.base
    }

    pub const fn len(&self) -> u32 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first address _not_ in the span.
    pub const fn end(&self) -> u32 {
        self.base + self.len
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// Checks whether every byte of `other` is inside `self`. An empty
    /// `other` is contained if its base lies within `[base, end]`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.base <= other.base && other.end() <= self.end()
    }

    /// Checks whether the two spans share at least one byte. Empty spans
    /// overlap nothing.
    pub fn overlaps(&self, other: &Span) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base < other.end()
            && other.base < self.end()
    }
}

/// Describes types that indicate region permissions.
///
/// # Invariants
///
/// `r.contains(x)` implies `r.base_addr() <= x < r.end_addr()` and vice versa.
pub trait MemoryRegion {
    fn contains(&self, addr: u32) -> bool;
    fn base_addr(&self) -> u32;
    fn end_addr(&self) -> u32;
}

impl MemoryRegion for Span {
    fn contains(&self, addr: u32) -> bool {
        Span::contains(self, addr)
    }

    fn base_addr(&self) -> u32 {
        self.base
    }

    fn end_addr(&self) -> u32 {
        self.end()
    }
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn contains(&self, addr: u32) -> bool {
        (**self).contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> u32 {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> u32 {
        (**self).end_addr()
    }
}

/// Returns the status of the region relative to the address: `Greater` if the
/// region lies above `addr`, `Less` if below, `Equal` if it contains it.
#[inline(always)]
fn region_compare(region: &impl MemoryRegion, addr: u32) -> Ordering {
    if addr < region.base_addr() {
        Ordering::Greater
    } else if addr >= region.end_addr() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Determines whether `span` is completely covered by regions in `table` that
/// satisfy `region_ok`. The span may cross several regions, as long as they
/// are contiguous.
///
/// # Preconditions
///
/// `table` must be sorted by base address, and its regions must not overlap.
///
/// # Returns
///
/// `true` for an empty span, since it names no memory. Otherwise `true` only
/// if every byte is covered by an acceptable region.
#[must_use]
pub fn can_access<R>(
    span: Span,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> bool
where
    R: MemoryRegion,
{
    if span.is_empty() {
        return true;
    }

    let mut scan_addr = span.base();
    let end_addr = span.end();

    let Ok(index) =
        table.binary_search_by(|reg| region_compare(reg, scan_addr))
    else {
        return false;
    };

    for region in &table[index..] {
        if !region.contains(scan_addr) || !region_ok(region) {
            // Hole, or a region we're not allowed to use.
            return false;
        }
        if end_addr <= region.end_addr() {
            return true;
        }
        scan_addr = region.end_addr();
    }

    false
}

/// Rounds `x` up to a multiple of `align`, which must be a power of two.
/// Returns `None` on overflow.
pub fn align_up(x: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    x.checked_add(mask).map(|v| v & !mask)
}

/// Rounds `x` down to a multiple of `align`, which must be a power of two.
pub fn align_down(x: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

pub fn is_aligned(x: u32, align: u32) -> bool {
    debug_assert!(align.is_power_of_two());
    x & (align - 1) == 0
}

/// Smallest power of two that is at least `len` and at least `floor`.
/// Returns `None` if that exceeds the 32-bit address space.
pub fn pow2_at_least(len: u32, floor: u32) -> Option<u32> {
    len.max(floor).checked_next_power_of_two()
}
