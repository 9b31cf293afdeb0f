// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M (and v6-M) MPU.
//!
//! Regions are powers of two, at least 32 bytes, and naturally aligned.
//! Regions of 256 bytes or more are split into eight subregions that can be
//! disabled individually, which is how we enable only a prefix of a larger
//! block.

use kerncore::{align_down, align_up, is_aligned, pow2_at_least, Span};

use super::{
    MemoryProtection, MpuError, ProtectionConfig, RegionAttributes,
    RegionDesc, RegisterFile,
};

const MIN_REGION: u32 = 32;
const MIN_SUBDIVIDED: u32 = 256;
const RBAR_VALID: u32 = 1 << 4;

#[derive(Clone, Debug, Default)]
pub struct ArmV7m {
    registers: RegisterFile,
}

impl ArmV7m {
    pub const fn new() -> Self {
        Self {
            registers: RegisterFile::new(),
        }
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Computes `(RBAR, RASR)` for `span`. RBAR leaves out the VALID bit and
    /// region number; those depend on which slot the region lands in.
    pub fn encode(
        span: Span,
        attributes: RegionAttributes,
    ) -> Result<[u32; 2], MpuError> {
        let unencodable = MpuError::Unencodable {
            base: span.base(),
            len: span.len(),
        };
        if span.is_empty() {
            return Err(unencodable);
        }
        let size = pow2_at_least(span.len(), MIN_REGION).ok_or(unencodable)?;
        if !is_aligned(span.base(), size) {
            return Err(unencodable);
        }
        let srd: u32 = if span.len() == size {
            0
        } else if size >= MIN_SUBDIVIDED && span.len() % (size / 8) == 0 {
            let enabled = span.len() / (size / 8);
            (0xFF << enabled) & 0xFF
        } else {
            return Err(unencodable);
        };

        let xn = !attributes.contains(RegionAttributes::EXECUTE);
        // Privileged code keeps access in every encoding.
        let ap: u32 = if attributes.contains(RegionAttributes::WRITE) {
            0b011
        } else if attributes.contains(RegionAttributes::READ) {
            0b010
        } else {
            0b001
        };
        // Normal memory, write-back, read/write allocate, not shared.
        let (tex, scb): (u32, u32) = (0b001, 0b011);
        // SIZE is log2 minus one: 32 bytes is 4.
        let l2size = 30 - size.leading_zeros();

        let rasr = (xn as u32) << 28
            | ap << 24
            | tex << 19
            | scb << 16
            | srd << 8
            | l2size << 1
            | 1;
        Ok([span.base(), rasr])
    }

    fn describe(
        span: Span,
        attributes: RegionAttributes,
    ) -> Result<RegionDesc, MpuError> {
        Ok(RegionDesc {
            span,
            attributes,
            raw: Self::encode(span, attributes)?,
        })
    }
}

impl MemoryProtection for ArmV7m {
    fn fit_region(&self, lower: u32, upper: u32, min_len: u32) -> Option<Span> {
        let size = pow2_at_least(min_len, MIN_REGION)?;
        let base = align_up(lower, size)?;
        let region = Span::new(base, size)?;
        (region.end() <= upper).then_some(region)
    }

    fn accessible_prefix(&self, region: Span, len: u32) -> Option<Span> {
        if len >= region.len() {
            return Some(region);
        }
        if region.len() < MIN_SUBDIVIDED {
            return None;
        }
        let len = align_down(len, region.len() / 8);
        if len == 0 {
            return None;
        }
        Span::new(region.base(), len)
    }

    fn can_protect(&self, span: Span) -> bool {
        Self::encode(span, RegionAttributes::FLASH).is_ok()
    }

    fn configure(
        &self,
        flash: Span,
        ram: Span,
    ) -> Result<ProtectionConfig, MpuError> {
        ProtectionConfig::from_regions(
            Self::describe(flash, RegionAttributes::FLASH)?,
            Self::describe(ram, RegionAttributes::RAM)?,
        )
    }

    fn apply(&mut self, config: &ProtectionConfig) {
        self.registers.load(config, |i, [rbar, rasr]| {
            [rbar | RBAR_VALID | i as u32, rasr]
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(base: u32, len: u32) -> Span {
        Span::new(base, len).unwrap()
    }

    #[test]
    fn fit_is_naturally_aligned() {
        let mpu = ArmV7m::new();
        assert_eq!(
            mpu.fit_region(0x2000_0100, 0x2001_0000, 0x900),
            Some(span(0x2000_1000, 0x1000))
        );
        assert_eq!(mpu.fit_region(0x2000_0000, 0x2000_0800, 0x900), None);
        assert_eq!(
            mpu.fit_region(0x2000_0004, 0x2000_0100, 1),
            Some(span(0x2000_0020, 32))
        );
    }

    #[test]
    fn prefix_uses_subregions() {
        let mpu = ArmV7m::new();
        let block = span(0x2000_0000, 0x400);
        assert_eq!(
            mpu.accessible_prefix(block, 0x3A0),
            Some(span(0x2000_0000, 0x380))
        );
        assert_eq!(mpu.accessible_prefix(block, 0x7F), None);
        assert_eq!(mpu.accessible_prefix(span(0x2000_0000, 0x80), 0x70), None);
        assert_eq!(mpu.accessible_prefix(block, 0x400), Some(block));
    }

    #[test]
    fn flash_region_encoding() {
        let raw =
            ArmV7m::encode(span(0x0800_0000, 0x1000), RegionAttributes::FLASH)
                .unwrap();
        assert_eq!(raw, [0x0800_0000, 0x020B_0017]);
    }

    #[test]
    fn ram_region_with_disabled_subregions() {
        let raw =
            ArmV7m::encode(span(0x2000_0000, 0x300), RegionAttributes::RAM)
                .unwrap();
        assert_eq!(raw, [0x2000_0000, 0x130B_C013]);
    }

    #[test]
    fn unencodable_spans() {
        let attrs = RegionAttributes::FLASH;
        // Misaligned for its size.
        assert!(ArmV7m::encode(span(0x0800_0020, 0x40), attrs).is_err());
        // Not a subregion multiple.
        assert!(ArmV7m::encode(span(0x0800_0000, 0x310), attrs).is_err());
        // Too small to subdivide.
        assert!(ArmV7m::encode(span(0x0800_0000, 0x60), attrs).is_err());
        assert!(ArmV7m::encode(span(0x0800_0000, 0), attrs).is_err());
    }

    #[test]
    fn apply_writes_slots() {
        let mut mpu = ArmV7m::new();
        let cfg = mpu
            .configure(span(0x0800_0000, 0x1000), span(0x2000_0000, 0x400))
            .unwrap();
        mpu.apply(&cfg);
        let slots = mpu.registers().slots();
        assert_eq!(slots[0][0], 0x0800_0000 | RBAR_VALID);
        assert_eq!(slots[1][0], 0x2000_0000 | RBAR_VALID | 1);
        assert_eq!(slots[2], [0, 0]);
        assert_eq!(mpu.registers().loads(), 1);
    }
}
