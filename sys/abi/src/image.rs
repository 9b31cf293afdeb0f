// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format of an application image as it sits in flash.
//!
//! An image is a little-endian, word-aligned blob:
//!
//! ```text
//! +-------------+-----------------+----------------+-------------------+
//! | BaseHeader  | header TLVs ... | program binary | footer TLVs ...   |
//! +-------------+-----------------+----------------+-------------------+
//! 0             16          header_size     binary_end       total_size
//! ```
//!
//! The header checksum covers `[0, header_size)`. Credentials in the footer
//! cover `[0, binary_end)`. An image without a `Program` TLV has no footer,
//! and its binary runs to `total_size`.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The only header layout version this kernel understands.
pub const IMAGE_VERSION: u16 = 2;

/// Size of `BaseHeader`, and the smallest step the loader ever takes.
pub const BASE_HEADER_LEN: usize = 16;

/// What unprogrammed flash reads back as. An image can never start with this
/// word because its version field would be `0xFFFF`.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Value of a `FixedAddresses` field that does not constrain placement.
pub const UNSET_ADDRESS: u32 = 0xFFFF_FFFF;

/// Images, TLVs and footers are all padded to this alignment.
pub const IMAGE_ALIGN: usize = 4;

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BaseHeader {
    pub version: U16,
    pub header_size: U16,
    pub total_size: U32,
    pub flags: U32,
    pub checksum: U32,
}
const_assert_eq!(core::mem::size_of::<BaseHeader>(), BASE_HEADER_LEN);

/// Byte offset of `BaseHeader::checksum`, which is treated as zero when the
/// checksum is computed.
pub const CHECKSUM_OFFSET: usize = 12;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ImageFlags: u32 {
        /// The image should be loaded. Clear to keep an image in flash
        /// without running it.
        const ENABLED = 1 << 0;
        /// Tooling hint: do not erase this image casually.
        const STICKY = 1 << 1;
    }
}

/// Common prefix of every TLV, in the header and in the footer.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TlvHeader {
    pub kind: U16,
    pub length: U16,
}
const_assert_eq!(core::mem::size_of::<TlvHeader>(), 4);

/// Known TLV kinds. Anything else in a header is skipped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum TlvKind {
    Main = 1,
    PackageName = 3,
    FixedAddresses = 5,
    KernelVersion = 8,
    Program = 9,
    ShortId = 10,
    Credentials = 128,
}

impl TryFrom<u16> for TlvKind {
    type Error = u16;

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Main),
            3 => Ok(Self::PackageName),
            5 => Ok(Self::FixedAddresses),
            8 => Ok(Self::KernelVersion),
            9 => Ok(Self::Program),
            10 => Ok(Self::ShortId),
            128 => Ok(Self::Credentials),
            _ => Err(x),
        }
    }
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MainTlv {
    /// Offset of the first instruction, relative to the end of the
    /// protected area.
    pub init_fn_offset: U32,
    /// Bytes after the header that the process may not write.
    pub protected_trailer_size: U32,
    pub minimum_ram_size: U32,
}
const_assert_eq!(core::mem::size_of::<MainTlv>(), 12);

/// Superset of `MainTlv` that also locates the footer. Takes precedence over
/// `MainTlv` when both are present.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ProgramTlv {
    pub init_fn_offset: U32,
    pub protected_trailer_size: U32,
    pub minimum_ram_size: U32,
    pub binary_end_offset: U32,
    pub app_version: U32,
}
const_assert_eq!(core::mem::size_of::<ProgramTlv>(), 20);

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FixedAddressesTlv {
    pub start_process_ram: U32,
    pub start_process_flash: U32,
}
const_assert_eq!(core::mem::size_of::<FixedAddressesTlv>(), 8);

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct KernelVersionTlv {
    pub major: U16,
    pub minor: U16,
}
const_assert_eq!(core::mem::size_of::<KernelVersionTlv>(), 4);

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ShortIdTlv {
    /// Requested short id; zero means "no preference".
    pub short_id: U32,
}
const_assert_eq!(core::mem::size_of::<ShortIdTlv>(), 4);

/// Leading word of a `Credentials` footer; the credential data follows.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CredentialsHeader {
    pub format: U32,
}
const_assert_eq!(core::mem::size_of::<CredentialsHeader>(), 4);

/// Credential formats the kernel can check. Footers carrying any other
/// format are treated as padding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum CredentialFormat {
    Sha256 = 3,
    Sha384 = 4,
    Sha512 = 5,
    /// Raw `r || s` ECDSA NIST P-256 signature over the SHA-256 digest of
    /// the integrity region.
    EcdsaNistP256 = 8,
}

impl CredentialFormat {
    /// Bytes of credential data that follow the format word.
    pub const fn data_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
            Self::EcdsaNistP256 => 64,
        }
    }
}

impl TryFrom<u32> for CredentialFormat {
    type Error = u32;

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            3 => Ok(Self::Sha256),
            4 => Ok(Self::Sha384),
            5 => Ok(Self::Sha512),
            8 => Ok(Self::EcdsaNistP256),
            _ => Err(x),
        }
    }
}

/// Rounds a TLV value length up to the image alignment.
pub const fn padded_len(len: usize) -> usize {
    (len + IMAGE_ALIGN - 1) & !(IMAGE_ALIGN - 1)
}

/// Computes the header checksum over `header`, which should be exactly the
/// first `header_size` bytes of an image.
///
/// The checksum is the XOR of every little-endian word, with the checksum
/// word itself read as zero. A trailing partial word is zero-extended.
pub fn header_checksum(header: &[u8]) -> u32 {
    header
        .chunks(4)
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_OFFSET / 4)
        .fold(0, |acc, (_, chunk)| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            acc ^ u32::from_le_bytes(word)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_ignores_checksum_word() {
        let mut a = [0u8; 16];
        a[0] = 2;
        a[4] = 0x40;
        let before = header_checksum(&a);
        a[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
            .copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(header_checksum(&a), before);
        assert_eq!(before, 2 ^ 0x40);
    }

    #[test]
    fn tlv_padding() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(13), 16);
    }

    #[test]
    fn credential_formats_round_trip_through_their_codes() {
        for f in [
            CredentialFormat::Sha256,
            CredentialFormat::Sha384,
            CredentialFormat::Sha512,
            CredentialFormat::EcdsaNistP256,
        ] {
            assert_eq!(CredentialFormat::try_from(f as u32), Ok(f));
        }
        assert_eq!(CredentialFormat::try_from(1), Err(1));
    }
}
