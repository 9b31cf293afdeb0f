// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to whatever performs cryptographic verification on this board.
//!
//! The kernel never waits on the engine. It submits a job tagged with a
//! [`CheckToken`], goes on with other work, and later collects `(token,
//! verdict)` pairs from [`CryptoEngine::poll`]. An engine must not report a
//! completion from inside `begin`; even a software engine that finishes
//! instantly holds the result until the next poll.

use heapless::Deque;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Raw (uncompressed, unprefixed) P-256 public key: `x || y`.
pub type RawP256Key = [u8; 64];

/// Tag identifying one outstanding engine job.
///
/// Only this crate can mint tokens, so an engine can't invent a completion
/// for work it was never given. The top half is the epoch of the scan that
/// minted the token and the bottom half counts jobs within it, so a late
/// completion from an abandoned scan never matches a job of a later one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CheckToken(u32);

impl CheckToken {
    pub(crate) fn first() -> Self {
        Self::first_of(0)
    }

    pub(crate) fn first_of(epoch: u16) -> Self {
        Self(u32::from(epoch) << 16 | 1)
    }

    pub fn epoch(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The next token in the same epoch. Sequence zero is never used.
    pub(crate) fn next(self) -> Self {
        let seq = (self.0 as u16).wrapping_add(1).max(1);
        Self(self.0 & 0xFFFF_0000 | u32::from(seq))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

/// A verification request. Borrowed data only needs to live until `begin`
/// returns; an engine that works in the background must copy what it needs.
#[derive(Copy, Clone, Debug)]
pub enum VerifyJob<'a> {
    /// Does `message` hash to `expected`?
    Digest {
        algorithm: HashAlgorithm,
        message: &'a [u8],
        expected: &'a [u8],
    },
    /// Is `signature` a valid ECDSA P-256/SHA-256 signature of `message`
    /// under `key`?
    EcdsaP256 {
        message: &'a [u8],
        key: &'a RawP256Key,
        signature: &'a [u8],
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Accept,
    Reject,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EngineError {
    /// No room for another job right now.
    Busy,
    /// This engine doesn't implement the requested algorithm.
    Unsupported,
}

pub trait CryptoEngine {
    /// Submits a job. The result arrives later through `poll`.
    fn begin(
        &mut self,
        token: CheckToken,
        job: VerifyJob<'_>,
    ) -> Result<(), EngineError>;

    /// Collects one finished job, if any.
    fn poll(&mut self) -> Option<(CheckToken, Verdict)>;
}

impl<T: CryptoEngine + ?Sized> CryptoEngine for &mut T {
    fn begin(
        &mut self,
        token: CheckToken,
        job: VerifyJob<'_>,
    ) -> Result<(), EngineError> {
        (**self).begin(token, job)
    }

    fn poll(&mut self) -> Option<(CheckToken, Verdict)> {
        (**self).poll()
    }
}

/// Number of finished-but-uncollected jobs `SoftCrypto` will hold.
pub const SOFT_QUEUE_DEPTH: usize = 4;

/// Engine that does the math on the CPU with the RustCrypto implementations.
pub struct SoftCrypto {
    done: Deque<(CheckToken, Verdict), SOFT_QUEUE_DEPTH>,
}

impl Default for SoftCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftCrypto {
    pub const fn new() -> Self {
        Self { done: Deque::new() }
    }

    /// Number of completions waiting to be polled.
    pub fn pending(&self) -> usize {
        self.done.len()
    }

    fn verify(job: VerifyJob<'_>) -> Verdict {
        let ok = match job {
            VerifyJob::Digest {
                algorithm,
                message,
                expected,
            } => match algorithm {
                HashAlgorithm::Sha256 => {
                    Sha256::digest(message).as_slice() == expected
                }
                HashAlgorithm::Sha384 => {
                    Sha384::digest(message).as_slice() == expected
                }
                HashAlgorithm::Sha512 => {
                    Sha512::digest(message).as_slice() == expected
                }
            },
            VerifyJob::EcdsaP256 {
                message,
                key,
                signature,
            } => {
                let mut sec1 = [0u8; 65];
                sec1[0] = 0x04;
                sec1[1..].copy_from_slice(key);
                match (
                    VerifyingKey::from_sec1_bytes(&sec1),
                    Signature::from_slice(signature),
                ) {
                    (Ok(key), Ok(sig)) => key.verify(message, &sig).is_ok(),
                    _ => false,
                }
            }
        };
        if ok {
            Verdict::Accept
        } else {
            Verdict::Reject
        }
    }
}

impl CryptoEngine for SoftCrypto {
    fn begin(
        &mut self,
        token: CheckToken,
        job: VerifyJob<'_>,
    ) -> Result<(), EngineError> {
        if self.done.is_full() {
            return Err(EngineError::Busy);
        }
        let verdict = Self::verify(job);
        self.done
            .push_back((token, verdict))
            .map_err(|_| EngineError::Busy)
    }

    fn poll(&mut self) -> Option<(CheckToken, Verdict)> {
        self.done.pop_front()
    }
}
