// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Carving process RAM out of the application pool.
//!
//! The allocator is a bump cursor over the pool plus a short free list of
//! regions given back by reclaimed processes. Every region it hands out is
//! one the MPU can express, so the loader never admits a process whose
//! protection can't be applied.
//!
//! # Invariants
//!
//! Allocated regions lie inside the pool and never overlap one another, or
//! anything on the free list.

use heapless::Vec;
use kerncore::Span;

use crate::arch::{MemoryProtection, MpuError, ProtectionConfig};

/// Number of released regions remembered for reuse.
pub const FREE_SLOTS: usize = 8;

/// What a candidate image needs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AllocRequest {
    /// The image's protected flash, header through binary end.
    pub flash: Span,
    pub min_ram: u32,
    /// Bytes above the process's RAM kept for the kernel.
    pub kernel_reserve: u32,
    pub fixed_ram: Option<u32>,
    pub fixed_flash: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Allocation {
    /// The whole block taken from the pool, reserve included.
    pub ram: Span,
    pub protection: ProtectionConfig,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// Fewer bytes than needed remain in the pool.
    PoolExhausted { needed: u32, available: u32 },
    /// The bytes exist but no placement of them satisfies the MPU.
    NoAlignedRegion { needed: u32 },
    FlashOutsideScan,
    FlashNotProtectable,
    FixedAddressMismatch { expected: u32, actual: u32 },
    Unencodable(MpuError),
}

impl AllocError {
    /// Terminal errors mean no later image can fit either, so the scan
    /// should stop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::NoAlignedRegion { .. }
        )
    }
}

impl From<MpuError> for AllocError {
    fn from(e: MpuError) -> Self {
        Self::Unencodable(e)
    }
}

pub struct RegionAllocator {
    pool: Span,
    next: u32,
    free: Vec<Span, FREE_SLOTS>,
}

impl RegionAllocator {
    pub const fn new(pool: Span) -> Self {
        Self {
            pool,
            next: pool.base(),
            free: Vec::new(),
        }
    }

    pub fn pool(&self) -> Span {
        self.pool
    }

    /// Bytes above the bump cursor.
    pub fn remaining(&self) -> u32 {
        self.pool.end() - self.next
    }

    pub fn free_spans(&self) -> &[Span] {
        &self.free
    }

    pub fn allocate(
        &mut self,
        mpu: &dyn MemoryProtection,
        flash_scan: Span,
        request: &AllocRequest,
    ) -> Result<Allocation, AllocError> {
        let flash = request.flash;
        if !flash_scan.contains_span(&flash) {
            return Err(AllocError::FlashOutsideScan);
        }
        if let Some(expected) = request.fixed_flash {
            if expected != flash.base() {
                return Err(AllocError::FixedAddressMismatch {
                    expected,
                    actual: flash.base(),
                });
            }
        }
        if !mpu.can_protect(flash) {
            return Err(AllocError::FlashNotProtectable);
        }

        let needed = request
            .min_ram
            .checked_add(request.kernel_reserve)
            .ok_or(AllocError::PoolExhausted {
                needed: u32::MAX,
                available: self.remaining(),
            })?;

        if let Some(a) = self.take_free(mpu, flash, request)? {
            return Ok(a);
        }

        let lower = match request.fixed_ram {
            Some(fixed) if fixed < self.next || !self.pool.contains(fixed) => {
                return Err(AllocError::FixedAddressMismatch {
                    expected: fixed,
                    actual: self.next,
                });
            }
            Some(fixed) => fixed,
            None => self.next,
        };

        let Some((block, accessible)) =
            fit(mpu, lower, self.pool.end(), request)
        else {
            let available = self.pool.end() - lower;
            return Err(if available < needed {
                AllocError::PoolExhausted { needed, available }
            } else {
                AllocError::NoAlignedRegion { needed }
            });
        };
        if let Some(expected) = request.fixed_ram {
            if block.base() != expected {
                return Err(AllocError::FixedAddressMismatch {
                    expected,
                    actual: block.base(),
                });
            }
        }

        let protection = mpu.configure(flash, accessible)?;

        // Alignment padding below the block is still usable later.
        if let Some(gap) = Span::from_bounds(self.next, block.base()) {
            self.remember(gap);
        }
        self.next = block.end();
        Ok(Allocation {
            ram: block,
            protection,
        })
    }

    /// Tries to satisfy `request` from a previously released region.
    fn take_free(
        &mut self,
        mpu: &dyn MemoryProtection,
        flash: Span,
        request: &AllocRequest,
    ) -> Result<Option<Allocation>, AllocError> {
        for i in 0..self.free.len() {
            let f = self.free[i];
            let lower = request.fixed_ram.unwrap_or(f.base());
            if !f.contains(lower) {
                continue;
            }
            let Some((block, accessible)) = fit(mpu, lower, f.end(), request)
            else {
                continue;
            };
            if request.fixed_ram.is_some_and(|a| a != block.base()) {
                continue;
            }
            let protection = mpu.configure(flash, accessible)?;

            self.free.swap_remove(i);
            for leftover in [
                Span::from_bounds(f.base(), block.base()),
                Span::from_bounds(block.end(), f.end()),
            ]
            .into_iter()
            .flatten()
            {
                self.remember(leftover);
            }
            return Ok(Some(Allocation {
                ram: block,
                protection,
            }));
        }
        Ok(None)
    }

    /// Gives a region back. A region at the top of the bump cursor rolls the
    /// cursor back; anything else goes on the free list. If the free list is
    /// full the region stays unused until the next boot.
    pub fn release(&mut self, span: Span) {
        if span.is_empty() || !self.pool.contains_span(&span) {
            return;
        }
        if span.end() == self.next {
            self.next = span.base();
            // Fold any free regions now sitting at the top into the cursor.
            while let Some(i) =
                self.free.iter().position(|f| f.end() == self.next)
            {
                self.next = self.free.swap_remove(i).base();
            }
        } else {
            self.remember(span);
        }
    }

    fn remember(&mut self, span: Span) {
        if !span.is_empty() {
            // Dropped on overflow, see `release`.
            let _ = self.free.push(span);
        }
    }
}

/// Finds a block in `[lower, upper)` whose enabled prefix holds `min_ram`
/// after leaving `kernel_reserve` at the top. Returns `(block, accessible)`.
fn fit(
    mpu: &dyn MemoryProtection,
    lower: u32,
    upper: u32,
    request: &AllocRequest,
) -> Option<(Span, Span)> {
    let mut need = request.min_ram.checked_add(request.kernel_reserve)?;
    // Each retry strictly grows the block; a handful always suffices.
    for _ in 0..32 {
        let block = mpu.fit_region(lower, upper, need)?;
        let usable = block.len() - request.kernel_reserve;
        if let Some(accessible) = mpu.accessible_prefix(block, usable) {
            if accessible.len() >= request.min_ram {
                return Some((block, accessible));
            }
        }
        need = block.len().checked_add(1)?;
    }
    None
}
