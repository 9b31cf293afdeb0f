// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv8-M MPU: base and limit registers with 32-byte granularity.

use kerncore::{align_down, align_up, is_aligned, Span};

use super::{
    MemoryProtection, MpuError, ProtectionConfig, RegionAttributes,
    RegionDesc, RegisterFile,
};

const GRANULE: u32 = 32;

#[derive(Clone, Debug, Default)]
pub struct ArmV8m {
    registers: RegisterFile,
}

impl ArmV8m {
    pub const fn new() -> Self {
        Self {
            registers: RegisterFile::new(),
        }
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Computes `(RBAR, RLAR)` for `span`. The AttrIdx field of RLAR is
    /// filled in when the region is assigned a slot.
    pub fn encode(
        span: Span,
        attributes: RegionAttributes,
    ) -> Result<[u32; 2], MpuError> {
        if span.is_empty()
            || !is_aligned(span.base(), GRANULE)
            || !is_aligned(span.len(), GRANULE)
        {
            return Err(MpuError::Unencodable {
                base: span.base(),
                len: span.len(),
            });
        }

        let xn = !attributes.contains(RegionAttributes::EXECUTE);
        let ap: u32 = if attributes.contains(RegionAttributes::WRITE) {
            0b01
        } else if attributes.contains(RegionAttributes::READ) {
            0b11
        } else {
            0b00
        };
        // Not shared.
        let sh: u32 = 0b00;

        // Limit is inclusive of its last granule, plus the enable bit.
        let rlar = (span.end() - GRANULE) | 1;
        let rbar = (xn as u32) | ap << 1 | sh << 3 | span.base();
        Ok([rbar, rlar])
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

impl MemoryProtection for ArmV8m {
    fn fit_region(&self, lower: u32, upper: u32, min_len: u32) -> Option<Span> {
        let base = align_up(lower, GRANULE)?;
        let len = align_up(min_len.max(GRANULE), GRANULE)?;
        let region = Span::new(base, len)?;
        (region.end() <= upper).then_some(region)
    }

    fn accessible_prefix(&self, region: Span, len: u32) -> Option<Span> {
        if len >= region.len() {
            return Some(region);
        }
        let len = align_down(len, GRANULE);
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
        // AttrIdx follows the slot number.
        self.registers
            .load(config, |i, [rbar, rlar]| [rbar, rlar | (i as u32) << 1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(base: u32, len: u32) -> Span {
        Span::new(base, len).unwrap()
    }

    #[test]
    fn fit_rounds_to_granule() {
        let mpu = ArmV8m::new();
        assert_eq!(
            mpu.fit_region(0x2000_0004, 0x2000_1000, 0x41),
            Some(span(0x2000_0020, 0x60))
        );
        assert_eq!(mpu.fit_region(0x2000_0000, 0x2000_0040, 0x41), None);
    }

    #[test]
    fn encodings() {
        let [rbar, rlar] =
            ArmV8m::encode(span(0x1000_0000, 0x800), RegionAttributes::FLASH)
                .unwrap();
        assert_eq!(rbar, 0x1000_0000 | 0b11 << 1);
        assert_eq!(rlar, 0x1000_07E1);

        let [rbar, rlar] =
            ArmV8m::encode(span(0x3000_0040, 0x60), RegionAttributes::RAM)
                .unwrap();
        assert_eq!(rbar, 0x3000_0040 | 0b01 << 1 | 1);
        assert_eq!(rlar, 0x3000_0081);

        assert!(
            ArmV8m::encode(span(0x3000_0010, 0x60), RegionAttributes::RAM)
                .is_err()
        );
    }

    #[test]
    fn apply_sets_attr_index() {
        let mut mpu = ArmV8m::new();
        let cfg = mpu
            .configure(span(0x1000_0000, 0x800), span(0x3000_0000, 0x100))
            .unwrap();
        mpu.apply(&cfg);
        assert_eq!(mpu.registers().slots()[1][1], 0x3000_00E1 | 1 << 1);
    }
}
