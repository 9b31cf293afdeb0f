// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Naming applications.
//!
//! Every loaded process gets two names that outlive any single run of it:
//!
//! - an [`AppId`], a 32-byte identifier that is stable for a given image
//!   (and, depending on policy, a given signer), and
//! - a [`ShortId`], a 32-bit name used in access-control lists, unique among
//!   the processes currently loaded.
//!
//! How the two are derived is the board's choice, expressed as an
//! [`IdentityPolicy`]. Every policy here is a pure function of the image and
//! its verification outcome, so loading the same flash twice gives the same
//! names. Uniqueness is checked separately by [`assign`], which never
//! silently picks a different short id: depending on [`CollisionPolicy`] it
//! either refuses the image or renumbers and says so.

use abi::ShortId;
use crc::{Crc, CRC_32_CKSUM};
use sha2::{Digest, Sha256};

use crate::config::CollisionPolicy;
use crate::creds::Verification;
use crate::crypto::RawP256Key;
use crate::image::Image;

const CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

pub const APP_ID_LEN: usize = 32;

/// Long-lived application identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AppId([u8; APP_ID_LEN]);

impl AppId {
    pub const fn from_bytes(bytes: [u8; APP_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; APP_ID_LEN] {
        &self.0
    }

    /// SHA-256 over the concatenation of `parts`.
    fn digest_of(parts: &[&[u8]]) -> Self {
        let mut h = Sha256::new();
        for p in parts {
            h.update(p);
        }
        Self(h.finalize().into())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub app_id: AppId,
    pub short_id: ShortId,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdentityError {
    /// The short id is already held by a loaded process.
    Collision { short_id: ShortId },
    /// Renumbering found no free short id.
    Exhausted { short_id: ShortId },
    /// The policy names applications by package name and the image has
    /// none.
    MissingName,
    /// The policy names applications by their signing key and the image
    /// wasn't verified by one.
    NotSigned,
    /// The policy takes the short id from the image header and there isn't
    /// one.
    NoShortIdHint,
    /// The application isn't listed in the board's static table.
    NotInTable,
}

/// A rule for deriving names. Implementations must be deterministic.
pub trait IdentityPolicy {
    fn derive(
        &self,
        image: &Image<'_>,
        verification: &Verification,
    ) -> Result<Identity, IdentityError>;
}

impl<T: IdentityPolicy + ?Sized> IdentityPolicy for &T {
    fn derive(
        &self,
        image: &Image<'_>,
        verification: &Verification,
    ) -> Result<Identity, IdentityError> {
        (**self).derive(image, verification)
    }
}

/// Anything that can say whether a short id is taken.
pub trait ShortIdSet {
    fn contains(&self, id: ShortId) -> bool;
    /// Number of ids in the set; bounds how far renumbering has to look.
    fn len(&self) -> usize;
}

impl ShortIdSet for [ShortId] {
    fn contains(&self, id: ShortId) -> bool {
        self.iter().any(|&x| x == id)
    }

    fn len(&self) -> usize {
        <[ShortId]>::len(self)
    }
}

/// Result of [`assign`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Assigned {
    pub identity: Identity,
    /// Set when the derived short id was taken and we moved off it.
    pub renumbered_from: Option<ShortId>,
}

/// Derives an identity for `image` and checks its short id against `in_use`.
pub fn assign(
    policy: &dyn IdentityPolicy,
    image: &Image<'_>,
    verification: &Verification,
    in_use: &(impl ShortIdSet + ?Sized),
    collision: CollisionPolicy,
) -> Result<Assigned, IdentityError> {
    let identity = policy.derive(image, verification)?;
    if !in_use.contains(identity.short_id) {
        return Ok(Assigned {
            identity,
            renumbered_from: None,
        });
    }
    match collision {
        CollisionPolicy::Reject => Err(IdentityError::Collision {
            short_id: identity.short_id,
        }),
        CollisionPolicy::Renumber => {
            let fresh = renumber(identity.short_id, in_use).ok_or(
                IdentityError::Exhausted {
                    short_id: identity.short_id,
                },
            )?;
            Ok(Assigned {
                identity: Identity {
                    short_id: fresh,
                    ..identity
                },
                renumbered_from: Some(identity.short_id),
            })
        }
    }
}

/// Finds the next free short id above `id`, wrapping, skipping zero.
///
/// Only `in_use.len() + 1` candidates need to be tried before one must be
/// free, so this is bounded by the table size rather than the id space.
pub fn renumber(
    id: ShortId,
    in_use: &(impl ShortIdSet + ?Sized),
) -> Option<ShortId> {
    let mut candidate = id.0;
    for _ in 0..=in_use.len() {
        candidate = candidate.wrapping_add(1);
        if candidate == 0 {
            candidate = 1;
        }
        if !in_use.contains(ShortId(candidate)) {
            return Some(ShortId(candidate));
        }
    }
    None
}

fn name_of<'a>(image: &Image<'a>) -> Result<&'a str, IdentityError> {
    image.package_name().ok_or(IdentityError::MissingName)
}

fn name_crc(name: &str) -> u32 {
    CKSUM.checksum(name.as_bytes())
}

/// AppId is the SHA-256 of the package name; the short id is its CRC-32.
#[derive(Copy, Clone, Debug, Default)]
pub struct NameHash;

impl IdentityPolicy for NameHash {
    fn derive(
        &self,
        image: &Image<'_>,
        _verification: &Verification,
    ) -> Result<Identity, IdentityError> {
        let name = name_of(image)?;
        Ok(Identity {
            app_id: AppId::digest_of(&[name.as_bytes()]),
            short_id: ShortId(name_crc(name)),
        })
    }
}

/// Like [`NameHash`], but the top nibble of the short id records which
/// trusted key verified the image (`index + 1`; zero when unverified), so
/// that ACLs can tell builds by different signers apart.
#[derive(Copy, Clone, Debug, Default)]
pub struct KeyNibbleName;

impl IdentityPolicy for KeyNibbleName {
    fn derive(
        &self,
        image: &Image<'_>,
        verification: &Verification,
    ) -> Result<Identity, IdentityError> {
        let name = name_of(image)?;
        let nibble = verification
            .key_index()
            .map_or(0, |k| (u32::from(k) + 1) & 0xF);
        Ok(Identity {
            app_id: AppId::digest_of(&[name.as_bytes()]),
            short_id: ShortId(nibble << 28 | (name_crc(name) & 0x0FFF_FFFF)),
        })
    }
}

/// AppId binds the application to the key that signed it: SHA-256 of the
/// key followed by the package name. The short id is the first four bytes of
/// the AppId. Unsigned images can't be named this way.
#[derive(Copy, Clone, Debug)]
pub struct CredentialKey<'k> {
    pub keys: &'k [RawP256Key],
}

impl IdentityPolicy for CredentialKey<'_> {
    fn derive(
        &self,
        image: &Image<'_>,
        verification: &Verification,
    ) -> Result<Identity, IdentityError> {
        let name = name_of(image)?;
        let key = verification
            .key_index()
            .and_then(|k| self.keys.get(usize::from(k)))
            .ok_or(IdentityError::NotSigned)?;
        let app_id = AppId::digest_of(&[&key[..], name.as_bytes()]);
        let b = app_id.as_bytes();
        Ok(Identity {
            app_id,
            short_id: ShortId(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        })
    }
}

/// Short id comes straight from the image's `ShortId` TLV.
#[derive(Copy, Clone, Debug, Default)]
pub struct HeaderShortId;

impl IdentityPolicy for HeaderShortId {
    fn derive(
        &self,
        image: &Image<'_>,
        _verification: &Verification,
    ) -> Result<Identity, IdentityError> {
        let name = name_of(image)?;
        let id = image.short_id_hint().ok_or(IdentityError::NoShortIdHint)?;
        Ok(Identity {
            app_id: AppId::digest_of(&[name.as_bytes()]),
            short_id: ShortId(id),
        })
    }
}

/// Short ids assigned by a table of `(package name, short id)` pairs baked
/// into the board. Anything not in the table is refused.
#[derive(Copy, Clone, Debug)]
pub struct StaticTable<'t, S> {
    pub entries: &'t [(S, u32)],
}

impl<S: AsRef<str>> IdentityPolicy for StaticTable<'_, S> {
    fn derive(
        &self,
        image: &Image<'_>,
        _verification: &Verification,
    ) -> Result<Identity, IdentityError> {
        let name = name_of(image)?;
        let (_, id) = self
            .entries
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .ok_or(IdentityError::NotInTable)?;
        Ok(Identity {
            app_id: AppId::digest_of(&[name.as_bytes()]),
            short_id: ShortId(*id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::parse;
    use abi::image::CredentialFormat;
    use test_images::ImageBuilder;

    fn signed_by(key: u16) -> Verification {
        Verification::Verified {
            record: 0,
            format: CredentialFormat::EcdsaNistP256,
            key_index: Some(key),
        }
    }

    #[test]
    fn name_hash_is_deterministic_and_distinct() {
        let a = ImageBuilder::new("alpha").body(16).build();
        let b = ImageBuilder::new("bravo").body(16).build();
        let (a, b) = (parse(&a).unwrap(), parse(&b).unwrap());
        let v = Verification::Unverified;
        let a1 = NameHash.derive(&a, &v).unwrap();
        let a2 = NameHash.derive(&a, &v).unwrap();
        let b1 = NameHash.derive(&b, &v).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1.short_id, b1.short_id);
        assert_ne!(a1.app_id, b1.app_id);
        assert_eq!(a1.short_id, ShortId(CKSUM.checksum(b"alpha")));
    }

    #[test]
    fn nameless_images_cannot_be_named_by_name() {
        let bytes = ImageBuilder::unnamed().body(16).build();
        let image = parse(&bytes).unwrap();
        assert_eq!(
            NameHash.derive(&image, &Verification::Unverified),
            Err(IdentityError::MissingName)
        );
    }

    #[test]
    fn key_nibble_tracks_signer() {
        let bytes = ImageBuilder::new("alpha").body(16).build();
        let image = parse(&bytes).unwrap();
        let unsigned = KeyNibbleName
            .derive(&image, &Verification::Unverified)
            .unwrap();
        let k0 = KeyNibbleName.derive(&image, &signed_by(0)).unwrap();
        let k2 = KeyNibbleName.derive(&image, &signed_by(2)).unwrap();
        assert_eq!(unsigned.short_id.0 >> 28, 0);
        assert_eq!(k0.short_id.0 >> 28, 1);
        assert_eq!(k2.short_id.0 >> 28, 3);
        assert_eq!(
            k0.short_id.0 & 0x0FFF_FFFF,
            unsigned.short_id.0 & 0x0FFF_FFFF
        );
    }

    #[test]
    fn signer_bound_requires_signature_and_separates_signers() {
        let keys = [[1u8; 64], [2u8; 64]];
        let policy = CredentialKey { keys: &keys };
        let bytes = ImageBuilder::new("alpha").body(16).build();
        let image = parse(&bytes).unwrap();
        assert_eq!(
            policy.derive(&image, &Verification::Unverified),
            Err(IdentityError::NotSigned)
        );
        let a = policy.derive(&image, &signed_by(0)).unwrap();
        let b = policy.derive(&image, &signed_by(1)).unwrap();
        assert_ne!(a.app_id, b.app_id);
        assert_eq!(
            a.short_id.0.to_be_bytes(),
            a.app_id.as_bytes()[..4]
        );
    }

    #[test]
    fn header_and_table_policies() {
        let hinted = ImageBuilder::new("alpha").body(16).short_id(77).build();
        let plain = ImageBuilder::new("bravo").body(16).build();
        let (hinted, plain) = (parse(&hinted).unwrap(), parse(&plain).unwrap());
        let v = Verification::Unverified;

        assert_eq!(
            HeaderShortId.derive(&hinted, &v).unwrap().short_id,
            ShortId(77)
        );
        assert_eq!(
            HeaderShortId.derive(&plain, &v),
            Err(IdentityError::NoShortIdHint)
        );

        let table = StaticTable {
            entries: &[("bravo", 0x200)],
        };
        assert_eq!(table.derive(&plain, &v).unwrap().short_id, ShortId(0x200));
        assert_eq!(table.derive(&hinted, &v), Err(IdentityError::NotInTable));
    }

    #[test]
    fn collision_is_rejected_or_renumbered_by_policy() {
        let bytes = ImageBuilder::new("alpha").body(16).build();
        let image = parse(&bytes).unwrap();
        let v = Verification::Unverified;
        let natural = NameHash.derive(&image, &v).unwrap().short_id;
        let taken = [natural, ShortId(natural.0.wrapping_add(1))];

        assert_eq!(
            assign(&NameHash, &image, &v, &taken[..], CollisionPolicy::Reject),
            Err(IdentityError::Collision { short_id: natural })
        );

        let a = assign(
            &NameHash,
            &image,
            &v,
            &taken[..],
            CollisionPolicy::Renumber,
        )
        .unwrap();
        assert_eq!(a.renumbered_from, Some(natural));
        assert_eq!(a.identity.short_id, ShortId(natural.0.wrapping_add(2)));

        // No collision: no renumbering, whatever the policy.
        let none: &[ShortId] = &[];
        let a = assign(&NameHash, &image, &v, none, CollisionPolicy::Renumber)
            .unwrap();
        assert_eq!(a.renumbered_from, None);
        assert_eq!(a.identity.short_id, natural);
    }

    #[test]
    fn renumber_wraps_and_skips_zero() {
        let taken = [ShortId(u32::MAX)];
        assert_eq!(renumber(ShortId(u32::MAX), &taken[..]), Some(ShortId(1)));
    }
}
