// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding whether an image's credentials satisfy the board's policy.
//!
//! A check is a short conversation with the crypto engine. `begin_check`
//! finds the first credential the policy cares about and submits it; each
//! `on_check_complete` consumes one verdict and either submits the next job or
//! produces the final [`Verification`]. Credentials are visited in footer
//! order:
//!
//! - Records of a class the policy doesn't accept are passed over.
//! - The first record that verifies decides the outcome.
//! - A record of an accepted class that fails verification (a hash that
//!   doesn't match, or a signature no trusted key accepts) rejects the
//!   image. Such an image has been tampered with or signed by someone we
//!   don't trust, and a later, weaker credential shouldn't rescue it.
//!
//! Only one check is outstanding per checker at a time.

use abi::image::CredentialFormat;

use crate::crypto::{
    CheckToken, CryptoEngine, EngineError, HashAlgorithm, RawP256Key, Verdict,
    VerifyJob,
};
use crate::image::{CredentialRecord, Image};

/// A kind of credential the policy is willing to accept.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CredentialClass<'k> {
    /// An integrity hash. Proves the image is intact, not who built it.
    Hash(HashAlgorithm),
    /// An ECDSA P-256 signature by any of `keys`, tried in order.
    EcdsaP256 { keys: &'k [RawP256Key] },
}

impl CredentialClass<'_> {
    fn matches(&self, format: CredentialFormat) -> bool {
        matches!(
            (self, format),
            (Self::Hash(HashAlgorithm::Sha256), CredentialFormat::Sha256)
                | (Self::Hash(HashAlgorithm::Sha384), CredentialFormat::Sha384)
                | (Self::Hash(HashAlgorithm::Sha512), CredentialFormat::Sha512)
                | (Self::EcdsaP256 { .. }, CredentialFormat::EcdsaNistP256)
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CheckPolicy<'k> {
    pub accepted: &'k [CredentialClass<'k>],
    /// When set, an image with no acceptable credential is refused. When
    /// clear, it loads as `Unverified`.
    pub require_credentials: bool,
}

impl CheckPolicy<'static> {
    /// Accept anything, check nothing.
    pub const PERMISSIVE: Self = CheckPolicy {
        accepted: &[],
        require_credentials: false,
    };
}

impl<'k> CheckPolicy<'k> {
    fn class_for(&self, format: CredentialFormat) -> Option<&CredentialClass<'k>> {
        self.accepted.iter().find(|c| c.matches(format))
    }
}

/// Outcome of a successful check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verification {
    /// No credential was accepted, and the policy allows that.
    Unverified,
    Verified {
        /// Index of the accepting record among the image's credentials.
        record: u16,
        format: CredentialFormat,
        /// For signatures, which trusted key verified it.
        key_index: Option<u16>,
    },
}

impl Verification {
    pub fn key_index(&self) -> Option<u16> {
        match self {
            Self::Verified { key_index, .. } => *key_index,
            Self::Unverified => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckError {
    /// A check is already in progress.
    Busy,
    /// The completion doesn't belong to the check in progress.
    StaleToken,
    /// The policy requires a credential and none was acceptable.
    NoAcceptedCredential,
    /// An accepted-class credential failed verification.
    Rejected { record: u16 },
    Engine(EngineError),
    /// The engine never answered.
    TimedOut,
}

impl From<EngineError> for CheckError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckProgress {
    /// A job is with the engine; wait for the completion tagged with this
    /// token.
    Pending(CheckToken),
    Done(Verification),
}

/// Where in the image's credential list an outstanding check is.
#[derive(Copy, Clone, Debug)]
struct Cursor {
    token: CheckToken,
    record: u16,
    key: u16,
}

pub struct CredentialChecker<'k> {
    policy: CheckPolicy<'k>,
    next_token: CheckToken,
    active: Option<Cursor>,
}

impl<'k> CredentialChecker<'k> {
    pub fn new(policy: CheckPolicy<'k>) -> Self {
        Self {
            policy,
            next_token: CheckToken::first(),
            active: None,
        }
    }

    /// Mints this checker's tokens from `epoch` from now on. Anything still
    /// outstanding is abandoned.
    pub fn set_epoch(&mut self, epoch: u16) {
        self.active = None;
        self.next_token = CheckToken::first_of(epoch);
    }

    pub fn policy(&self) -> &CheckPolicy<'k> {
        &self.policy
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Starts checking `image`. If the image has nothing the policy cares
    /// about, the answer is immediate and no job is submitted.
    pub fn begin_check(
        &mut self,
        image: &Image<'_>,
        engine: &mut dyn CryptoEngine,
    ) -> Result<CheckProgress, CheckError> {
        if self.active.is_some() {
            return Err(CheckError::Busy);
        }
        self.submit_from(image, engine, 0, 0)
    }

    /// Consumes one engine completion for the check in progress.
    ///
    /// `image` must be the image passed to `begin_check`.
    pub fn on_check_complete(
        &mut self,
        token: CheckToken,
        verdict: Verdict,
        image: &Image<'_>,
        engine: &mut dyn CryptoEngine,
    ) -> Result<CheckProgress, CheckError> {
        let cursor = match self.active {
            Some(c) if c.token == token => c,
            _ => return Err(CheckError::StaleToken),
        };
        self.active = None;

        let Some(record) = image.credentials().nth(usize::from(cursor.record))
        else {
            return Err(CheckError::StaleToken);
        };
        let class = self.policy.class_for(record.format).copied();

        match (verdict, class) {
            (Verdict::Accept, class) => {
                let key_index = match class {
                    Some(CredentialClass::EcdsaP256 { .. }) => Some(cursor.key),
                    _ => None,
                };
                Ok(CheckProgress::Done(Verification::Verified {
                    record: record.index,
                    format: record.format,
                    key_index,
                }))
            }
            (Verdict::Reject, Some(CredentialClass::EcdsaP256 { keys }))
                if usize::from(cursor.key) + 1 < keys.len() =>
            {
                self.submit_from(image, engine, cursor.record, cursor.key + 1)
            }
            (Verdict::Reject, _) => Err(CheckError::Rejected {
                record: record.index,
            }),
        }
    }

    /// Abandons the check in progress, if any. A late completion for it
    /// will be refused as stale.
    pub fn cancel(&mut self) {
        self.active = None;
    }

    /// Submits the job for the first acceptable record at or after `record`,
    /// starting at key `key` for that record.
    fn submit_from(
        &mut self,
        image: &Image<'_>,
        engine: &mut dyn CryptoEngine,
        record: u16,
        key: u16,
    ) -> Result<CheckProgress, CheckError> {
        let candidate = image
            .credentials()
            .skip(usize::from(record))
            .find_map(|r| self.policy.class_for(r.format).map(|c| (r, *c)));

        let Some((rec, class)) = candidate else {
            return if self.policy.require_credentials {
                Err(CheckError::NoAcceptedCredential)
            } else {
                Ok(CheckProgress::Done(Verification::Unverified))
            };
        };

        // A record we skipped to is checked from its first key.
        let key = if rec.index == record { key } else { 0 };
        let Some(job) = job_for(image, &rec, &class, key) else {
            // A signature class with no trusted keys can never verify.
            return Err(CheckError::Rejected { record: rec.index });
        };

        let token = self.next_token;
        self.next_token = token.next();
        engine.begin(token, job)?;
        self.active = Some(Cursor {
            token,
            record: rec.index,
            key,
        });
        Ok(CheckProgress::Pending(token))
    }
}

fn job_for<'a>(
    image: &Image<'a>,
    record: &CredentialRecord<'a>,
    class: &CredentialClass<'a>,
    key: u16,
) -> Option<VerifyJob<'a>> {
    let message = image.integrity_region();
    match class {
        CredentialClass::Hash(algorithm) => Some(VerifyJob::Digest {
            algorithm: *algorithm,
            message,
            expected: record.data,
        }),
        CredentialClass::EcdsaP256 { keys } => {
            keys.get(usize::from(key)).map(|key| VerifyJob::EcdsaP256 {
                message,
                key,
                signature: record.data,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftCrypto;
    use crate::image::parse;
    use test_images::{raw_public_key, signing_key, ImageBuilder};

    const SHA256_ONLY: &[CredentialClass<'static>] =
        &[CredentialClass::Hash(HashAlgorithm::Sha256)];

    /// Runs a check to completion against a `SoftCrypto`.
    fn run(
        checker: &mut CredentialChecker<'_>,
        image: &Image<'_>,
    ) -> Result<Verification, CheckError> {
        let mut engine = SoftCrypto::new();
        let mut progress = checker.begin_check(image, &mut engine)?;
        loop {
            match progress {
                CheckProgress::Done(v) => return Ok(v),
                CheckProgress::Pending(_) => {
                    let (t, v) = engine.poll().expect("engine lost a job");
                    progress =
                        checker.on_check_complete(t, v, image, &mut engine)?;
                }
            }
        }
    }

    #[test]
    fn no_credentials_is_unverified_when_allowed() {
        let bytes = ImageBuilder::new("a").body(32).build();
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: SHA256_ONLY,
            require_credentials: false,
        });
        assert_eq!(run(&mut c, &image), Ok(Verification::Unverified));
        assert!(!c.is_busy());
    }

    #[test]
    fn no_credentials_is_refused_when_required() {
        let bytes = ImageBuilder::new("a").body(32).build();
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: SHA256_ONLY,
            require_credentials: true,
        });
        assert_eq!(run(&mut c, &image), Err(CheckError::NoAcceptedCredential));
    }

    #[test]
    fn matching_hash_verifies() {
        let bytes = ImageBuilder::new("a").body(32).sha256().build();
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: SHA256_ONLY,
            require_credentials: true,
        });
        assert_eq!(
            run(&mut c, &image),
            Ok(Verification::Verified {
                record: 0,
                format: CredentialFormat::Sha256,
                key_index: None,
            })
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let mut bytes = ImageBuilder::new("a").body(32).sha256().build();
        let image_len = bytes.len();
        // Corrupt the program body, leaving header and footer intact.
        bytes[image_len - 48] ^= 0xFF;
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: SHA256_ONLY,
            require_credentials: false,
        });
        assert_eq!(run(&mut c, &image), Err(CheckError::Rejected { record: 0 }));
    }

    #[test]
    fn unaccepted_classes_are_passed_over() {
        let bytes = ImageBuilder::new("a").body(32).sha512().sha256().build();
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: SHA256_ONLY,
            require_credentials: true,
        });
        assert!(matches!(
            run(&mut c, &image),
            Ok(Verification::Verified { record: 1, .. })
        ));
    }

    #[test]
    fn signature_tries_each_key_in_order() {
        let signer = signing_key(3);
        let keys = [
            raw_public_key(&signing_key(1)),
            raw_public_key(&signing_key(2)),
            raw_public_key(&signer),
        ];
        let classes = [CredentialClass::EcdsaP256 { keys: &keys }];
        let bytes = ImageBuilder::new("a").body(32).ecdsa(&signer).build();
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: &classes,
            require_credentials: true,
        });
        assert_eq!(
            run(&mut c, &image),
            Ok(Verification::Verified {
                record: 0,
                format: CredentialFormat::EcdsaNistP256,
                key_index: Some(2),
            })
        );
    }

    #[test]
    fn signature_by_untrusted_key_is_rejected() {
        let keys = [raw_public_key(&signing_key(1))];
        let classes = [CredentialClass::EcdsaP256 { keys: &keys }];
        let bytes =
            ImageBuilder::new("a").body(32).ecdsa(&signing_key(9)).build();
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: &classes,
            require_credentials: false,
        });
        assert_eq!(run(&mut c, &image), Err(CheckError::Rejected { record: 0 }));
    }

    #[test]
    fn one_check_at_a_time_and_stale_tokens_refused() {
        let bytes = ImageBuilder::new("a").body(32).sha256().build();
        let image = parse(&bytes).unwrap();
        let mut c = CredentialChecker::new(CheckPolicy {
            accepted: SHA256_ONLY,
            require_credentials: true,
        });
        let mut engine = SoftCrypto::new();
        let Ok(CheckProgress::Pending(first)) =
            c.begin_check(&image, &mut engine)
        else {
            panic!("expected a pending check");
        };
        assert_eq!(
            c.begin_check(&image, &mut engine),
            Err(CheckError::Busy)
        );

        c.cancel();
        let Ok(CheckProgress::Pending(second)) =
            c.begin_check(&image, &mut engine)
        else {
            panic!("expected a pending check");
        };
        assert_ne!(first, second);
        assert_eq!(
            c.on_check_complete(first, Verdict::Accept, &image, &mut engine),
            Err(CheckError::StaleToken)
        );
        assert!(matches!(
            c.on_check_complete(second, Verdict::Accept, &image, &mut engine),
            Ok(CheckProgress::Done(Verification::Verified { .. }))
        ));
    }

    #[test]
    fn tokens_from_an_earlier_epoch_are_stale() {
        let bytes = ImageBuilder::new("a").body(32).sha256().build();
        let image = parse(&bytes).unwrap();
        let policy = CheckPolicy {
            accepted: SHA256_ONLY,
            require_credentials: true,
        };
        let mut engine = SoftCrypto::new();

        let mut earlier = CredentialChecker::new(policy);
        earlier.set_epoch(1);
        let Ok(CheckProgress::Pending(old)) =
            earlier.begin_check(&image, &mut engine)
        else {
            panic!("expected a pending check");
        };

        let mut later = CredentialChecker::new(policy);
        later.set_epoch(2);
        let Ok(CheckProgress::Pending(new)) =
            later.begin_check(&image, &mut engine)
        else {
            panic!("expected a pending check");
        };
        assert_ne!(old, new);
        assert_eq!(
            later.on_check_complete(old, Verdict::Accept, &image, &mut engine),
            Err(CheckError::StaleToken)
        );
        assert!(later.is_busy());
    }
}
