// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image and flash builders for kernel tests.
//!
//! [`ImageBuilder`] produces well-formed images by default and can be told
//! to get specific things wrong. [`FlashBuilder`] lays images out the way a
//! board's tooling would: each one on an alignment boundary, gaps filled
//! with padding images, erased flash after the last.
//!
//! The program binary is padded so that it ends on a 32-byte boundary,
//! which lets an ARMv8-M protection unit cover it exactly. Use
//! [`ImageBuilder::pad_binary_to`] for the power-of-two sizes ARMv7-M
//! wants.

use abi::image::{
    BaseHeader, CredentialFormat, FixedAddressesTlv, ImageFlags,
    KernelVersionTlv, MainTlv, ProgramTlv, ShortIdTlv, TlvHeader, TlvKind,
    BASE_HEADER_LEN, IMAGE_ALIGN, IMAGE_VERSION, UNSET_ADDRESS,
    header_checksum, padded_len,
};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use zerocopy::little_endian::{U16, U32};
use zerocopy::IntoBytes;

/// Default alignment of the end of the program binary, and of images in a
/// [`FlashBuilder`].
pub const GRANULE: usize = 32;

/// Byte used to fill program bodies.
pub const BODY_FILL: u8 = 0x5A;

/// Makes a deterministic P-256 key from a small seed. Different seeds give
/// different keys.
pub fn signing_key(seed: u8) -> SigningKey {
    let mut scalar = [0x11u8; 32];
    scalar[31] = seed;
    SigningKey::from_slice(&scalar).expect("scalar is in range")
}

/// The `x || y` form of `key`'s public half, as a kernel policy holds it.
pub fn raw_public_key(key: &SigningKey) -> [u8; 64] {
    let point = key.verifying_key().to_encoded_point(false);
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&point.as_bytes()[1..]);
    raw
}

/// Raw `r || s` signature over the SHA-256 digest of `message`.
pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; 64] {
    let sig: Signature = key.sign(message);
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&sig.to_bytes());
    raw
}

#[derive(Clone)]
enum Footer {
    Sha256,
    Sha384,
    Sha512,
    Ecdsa(SigningKey),
    Raw(u32, Vec<u8>),
}

impl Footer {
    fn format(&self) -> u32 {
        match self {
            Self::Sha256 => CredentialFormat::Sha256 as u32,
            Self::Sha384 => CredentialFormat::Sha384 as u32,
            Self::Sha512 => CredentialFormat::Sha512 as u32,
            Self::Ecdsa(_) => CredentialFormat::EcdsaNistP256 as u32,
            Self::Raw(format, _) => *format,
        }
    }

    fn data(&self, covered: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(covered).to_vec(),
            Self::Sha384 => Sha384::digest(covered).to_vec(),
            Self::Sha512 => Sha512::digest(covered).to_vec(),
            Self::Ecdsa(key) => sign(key, covered).to_vec(),
            Self::Raw(_, data) => data.clone(),
        }
    }

    fn data_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 | Self::Ecdsa(_) => 64,
            Self::Raw(_, data) => data.len(),
        }
    }

    /// Bytes this footer takes, TLV header included.
    fn encoded_len(&self) -> usize {
        core::mem::size_of::<TlvHeader>() + padded_len(4 + self.data_len())
    }
}

#[derive(Clone)]
pub struct ImageBuilder {
    name: Option<String>,
    program: bool,
    body: usize,
    min_ram: u32,
    protected_trailer: u32,
    init_offset: u32,
    app_version: Option<u32>,
    version: u16,
    total_size: Option<u32>,
    enabled: bool,
    kernel_version: Option<(u16, u16)>,
    short_id: Option<u32>,
    fixed_ram: Option<u32>,
    fixed_flash: Option<u32>,
    binary_len: Option<usize>,
    footers: Vec<Footer>,
}

impl ImageBuilder {
    /// An enabled image named `name`, with an empty body and 256 bytes of
    /// RAM.
    pub fn new(name: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            ..Self::unnamed()
        }
    }

    /// Like `new`, without a package name TLV.
    pub fn unnamed() -> Self {
        Self {
            name: None,
            program: true,
            body: 0,
            min_ram: 256,
            protected_trailer: 0,
            init_offset: 0,
            app_version: None,
            version: IMAGE_VERSION,
            total_size: None,
            enabled: true,
            kernel_version: None,
            short_id: None,
            fixed_ram: None,
            fixed_flash: None,
            binary_len: None,
            footers: Vec::new(),
        }
    }

    /// An image with no program, occupying `total` bytes.
    pub fn padding(total: usize) -> Self {
        assert!(total >= BASE_HEADER_LEN && total % IMAGE_ALIGN == 0);
        Self {
            program: false,
            enabled: false,
            body: total - BASE_HEADER_LEN,
            ..Self::unnamed()
        }
    }

    /// Bytes of program code after the protected trailer.
    pub fn body(mut self, len: usize) -> Self {
        self.body = len;
        self
    }

    pub fn min_ram(mut self, len: u32) -> Self {
        self.min_ram = len;
        self
    }

    pub fn protected_trailer(mut self, len: u32) -> Self {
        self.protected_trailer = len;
        self
    }

    pub fn init_offset(mut self, offset: u32) -> Self {
        self.init_offset = offset;
        self
    }

    /// Forces a program TLV carrying `version`.
    pub fn app_version(mut self, version: u32) -> Self {
        self.app_version = Some(version);
        self
    }

    /// Header layout version.
    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Overrides the total size the header claims, leaving the bytes alone.
    pub fn total_size(mut self, total: u32) -> Self {
        self.total_size = Some(total);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn kernel_version(mut self, major: u16, minor: u16) -> Self {
        self.kernel_version = Some((major, minor));
        self
    }

    pub fn short_id(mut self, id: u32) -> Self {
        self.short_id = Some(id);
        self
    }

    pub fn fixed_ram(mut self, addr: u32) -> Self {
        self.fixed_ram = Some(addr);
        self
    }

    pub fn fixed_flash(mut self, addr: u32) -> Self {
        self.fixed_flash = Some(addr);
        self
    }

    /// Makes the program binary, header included, exactly `len` bytes.
    pub fn pad_binary_to(mut self, len: usize) -> Self {
        self.binary_len = Some(len);
        self
    }

    pub fn sha256(mut self) -> Self {
        self.footers.push(Footer::Sha256);
        self
    }

    pub fn sha384(mut self) -> Self {
        self.footers.push(Footer::Sha384);
        self
    }

    pub fn sha512(mut self) -> Self {
        self.footers.push(Footer::Sha512);
        self
    }

    pub fn ecdsa(mut self, key: &SigningKey) -> Self {
        self.footers.push(Footer::Ecdsa(key.clone()));
        self
    }

    /// A credentials footer with arbitrary format code and contents.
    pub fn footer_raw(mut self, format: u32, data: &[u8]) -> Self {
        self.footers.push(Footer::Raw(format, data.to_vec()));
        self
    }

    fn uses_program_tlv(&self) -> bool {
        !self.footers.is_empty() || self.app_version.is_some()
    }

    fn header_tlvs(&self, binary_end: u32) -> Vec<u8> {
        let mut out = Vec::new();
        if self.program {
            if self.uses_program_tlv() {
                let t = ProgramTlv {
                    init_fn_offset: U32::new(self.init_offset),
                    protected_trailer_size: U32::new(self.protected_trailer),
                    minimum_ram_size: U32::new(self.min_ram),
                    binary_end_offset: U32::new(binary_end),
                    app_version: U32::new(self.app_version.unwrap_or(0)),
                };
                push_tlv(&mut out, TlvKind::Program as u16, t.as_bytes());
            } else {
                let t = MainTlv {
                    init_fn_offset: U32::new(self.init_offset),
                    protected_trailer_size: U32::new(self.protected_trailer),
                    minimum_ram_size: U32::new(self.min_ram),
                };
                push_tlv(&mut out, TlvKind::Main as u16, t.as_bytes());
            }
        }
        if let Some(name) = &self.name {
            push_tlv(&mut out, TlvKind::PackageName as u16, name.as_bytes());
        }
        if self.fixed_ram.is_some() || self.fixed_flash.is_some() {
            let t = FixedAddressesTlv {
                start_process_ram: U32::new(
                    self.fixed_ram.unwrap_or(UNSET_ADDRESS),
                ),
                start_process_flash: U32::new(
                    self.fixed_flash.unwrap_or(UNSET_ADDRESS),
                ),
            };
            push_tlv(&mut out, TlvKind::FixedAddresses as u16, t.as_bytes());
        }
        if let Some((major, minor)) = self.kernel_version {
            let t = KernelVersionTlv {
                major: U16::new(major),
                minor: U16::new(minor),
            };
            push_tlv(&mut out, TlvKind::KernelVersion as u16, t.as_bytes());
        }
        if let Some(id) = self.short_id {
            let t = ShortIdTlv {
                short_id: U32::new(id),
            };
            push_tlv(&mut out, TlvKind::ShortId as u16, t.as_bytes());
        }
        out
    }

    pub fn build(&self) -> Vec<u8> {
        // TLV sizes don't depend on the binary end, so measure with zero.
        let header_size = BASE_HEADER_LEN + self.header_tlvs(0).len();
        let binary_end = if !self.program {
            header_size + self.body
        } else {
            let natural =
                header_size + self.protected_trailer as usize + self.body;
            match self.binary_len {
                Some(len) => {
                    assert!(len >= natural, "binary doesn't fit in {len}");
                    len
                }
                None => natural.next_multiple_of(GRANULE),
            }
        };
        let footer_len: usize =
            self.footers.iter().map(Footer::encoded_len).sum();
        let natural_total = binary_end + footer_len;

        let mut header = BaseHeader {
            version: U16::new(self.version),
            header_size: U16::new(header_size as u16),
            total_size: U32::new(
                self.total_size.unwrap_or(natural_total as u32),
            ),
            flags: U32::new(if self.enabled {
                ImageFlags::ENABLED.bits()
            } else {
                0
            }),
            checksum: U32::new(0),
        };
        let tlvs = self.header_tlvs(binary_end as u32);

        let mut bytes = Vec::with_capacity(natural_total);
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&tlvs);
        header.checksum = U32::new(header_checksum(&bytes));
        bytes[..BASE_HEADER_LEN].copy_from_slice(header.as_bytes());

        if self.program {
            bytes.resize(header_size + self.protected_trailer as usize, 0);
            bytes.resize(bytes.len() + self.body, BODY_FILL);
        }
        bytes.resize(binary_end, 0);

        for footer in &self.footers {
            let mut value = footer.format().to_le_bytes().to_vec();
            value.extend(footer.data(&bytes[..binary_end]));
            push_tlv(&mut bytes, TlvKind::Credentials as u16, &value);
        }
        debug_assert_eq!(bytes.len(), natural_total);
        bytes
    }
}

fn push_tlv(out: &mut Vec<u8>, kind: u16, value: &[u8]) {
    let h = TlvHeader {
        kind: U16::new(kind),
        length: U16::new(value.len() as u16),
    };
    out.extend_from_slice(h.as_bytes());
    out.extend_from_slice(value);
    out.resize(out.len() + padded_len(value.len()) - value.len(), 0);
}

/// Lays images out in a flash region.
pub struct FlashBuilder {
    bytes: Vec<u8>,
    align: usize,
}

impl Default for FlashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashBuilder {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            align: GRANULE,
        }
    }

    /// Alignment of each image pushed from now on.
    pub fn align(mut self, align: usize) -> Self {
        assert!(align.is_power_of_two() && align >= IMAGE_ALIGN);
        self.align = align;
        self
    }

    /// Offset the next image would land at, before alignment.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Fills up to the next alignment boundary with a padding image. A gap
    /// too small to hold a header is widened by a whole alignment unit.
    pub fn pad_to_alignment(&mut self) {
        let rem = self.bytes.len() % self.align;
        if rem == 0 {
            return;
        }
        let mut gap = self.align - rem;
        if gap < BASE_HEADER_LEN {
            gap += self.align;
        }
        let pad = ImageBuilder::padding(gap).build();
        self.bytes.extend_from_slice(&pad);
    }

    /// Appends `image` on an alignment boundary and returns its offset.
    pub fn push(&mut self, image: &[u8]) -> u32 {
        self.pad_to_alignment();
        self.push_raw(image)
    }

    /// Appends `bytes` right where the last thing ended.
    pub fn push_raw(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(bytes);
        offset
    }

    /// Finishes the region at `len` bytes, erased after the last image.
    pub fn build(mut self, len: usize) -> Vec<u8> {
        assert!(self.bytes.len() <= len, "images overflow the region");
        self.bytes.resize(len, 0xFF);
        self.bytes
    }
}
