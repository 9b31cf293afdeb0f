// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the kernel scenario tests.

#![allow(dead_code)]

use kern::arch::armv8m::ArmV8m;
use kern::cap::{Capabilities, LoadCap};
use kern::config::LoaderConfig;
use kern::creds::CheckPolicy;
use kern::crypto::{CheckToken, CryptoEngine, EngineError, SoftCrypto, Verdict, VerifyJob};
use kern::diag::NullSink;
use kern::fault::FaultPolicy;
use kern::ident::{IdentityPolicy, NameHash};
use kern::kernel::Kernel;
use kern::loader::{FlashRegion, LoadReport, LoaderPolicies};
use kern::Span;

pub const FLASH_BASE: u32 = 0x1000_0000;
pub const RAM_BASE: u32 = 0x2000_0000;
pub const SLOTS: usize = 8;

pub type TestKernel<'f, 'p> = Kernel<'f, 'p, ArmV8m, SLOTS>;

pub fn kernel<'f, 'p>(
    policy: &'p dyn FaultPolicy,
    pool_len: u32,
    config: LoaderConfig,
) -> (TestKernel<'f, 'p>, Capabilities) {
    Kernel::new(
        ArmV8m::new(),
        Span::new(RAM_BASE, pool_len).unwrap(),
        policy,
        config,
    )
}

pub fn region(flash: &[u8]) -> FlashRegion<'_> {
    FlashRegion::new(FLASH_BASE, flash).unwrap()
}

/// Loads `flash` accepting unverified images, naming them by package name.
pub fn load_permissive<'f>(
    kernel: &mut TestKernel<'f, '_>,
    flash: &'f [u8],
    cap: &LoadCap,
) -> LoadReport {
    load_with(kernel, flash, CheckPolicy::PERMISSIVE, &NameHash, cap)
}

pub fn load_with<'f>(
    kernel: &mut TestKernel<'f, '_>,
    flash: &'f [u8],
    check: CheckPolicy<'_>,
    identity: &dyn IdentityPolicy,
    cap: &LoadCap,
) -> LoadReport {
    let mut engine = SoftCrypto::new();
    kernel.load_all(
        region(flash),
        LoaderPolicies { check, identity },
        &mut engine,
        &mut NullSink,
        cap,
    )
}

/// Engine that computes verdicts right away but only hands them out when
/// the test says so.
#[derive(Default)]
pub struct HeldEngine {
    inner: SoftCrypto,
    pub held: Vec<(CheckToken, Verdict)>,
    pub submitted: Vec<CheckToken>,
}

impl CryptoEngine for HeldEngine {
    fn begin(
        &mut self,
        token: CheckToken,
        job: VerifyJob<'_>,
    ) -> Result<(), EngineError> {
        self.inner.begin(token, job)?;
        self.submitted.push(token);
        while let Some(done) = self.inner.poll() {
            self.held.push(done);
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<(CheckToken, Verdict)> {
        None
    }
}
