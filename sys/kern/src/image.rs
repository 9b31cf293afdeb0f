// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing of application images.
//!
//! [`parse`] validates an image header and its TLVs and hands back an
//! [`Image`], which is a view onto the original flash bytes plus the handful
//! of fields the loader needs. Nothing is copied and nothing is allocated.
//!
//! The parser does not trust a single byte of its input. Sizes are checked
//! against each other and against the bytes actually available before they
//! are used to slice anything, so a hostile or corrupt image can only ever
//! produce a `ParseError`.

use abi::image::{
    header_checksum, padded_len, BaseHeader, CredentialFormat,
    CredentialsHeader, FixedAddressesTlv, ImageFlags, KernelVersionTlv,
    MainTlv, ProgramTlv, ShortIdTlv, TlvHeader, TlvKind, BASE_HEADER_LEN,
    ERASED_WORD, IMAGE_ALIGN, IMAGE_VERSION, UNSET_ADDRESS,
};
use zerocopy::FromBytes;

use crate::config::KernelVersion;

/// Reasons an image can fail to parse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Fewer bytes than a base header.
    Truncated,
    UnsupportedVersion(u16),
    /// Header length is shorter than the base header or not word-aligned.
    BadHeaderLength { header_size: u16 },
    /// Total size is smaller than the header or not word-aligned.
    InconsistentSize { header_size: u16, total_size: u32 },
    /// Total size runs past the end of the bytes we were given.
    SizeOverrun { total_size: u32, available: u32 },
    BadChecksum { expected: u32, computed: u32 },
    /// A header TLV is cut off or has the wrong length for its kind. The
    /// offset is relative to the start of the image.
    BadTlv { offset: u32 },
    BadPackageName,
    /// The program TLV puts the end of the binary outside the image.
    BadBinaryEnd { binary_end: u32 },
    /// The entry point is not inside the program binary.
    EntryOutOfBounds { entry_offset: u32 },
    /// A footer TLV is cut off, or a credential is shorter than its format.
    BadFooter { offset: u32 },
}

/// What the loader should make of the bytes at a scan position, before
/// attempting a full parse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Probe {
    /// Not enough bytes remain to hold a header.
    EndOfRegion,
    /// The next word is erased flash: there are no more images.
    Erased,
    /// Something is here; parse it.
    Candidate,
}

pub fn probe(bytes: &[u8]) -> Probe {
    let Some(word) = bytes.first_chunk::<4>() else {
        return Probe::EndOfRegion;
    };
    if bytes.len() < BASE_HEADER_LEN {
        Probe::EndOfRegion
    } else if u32::from_le_bytes(*word) == ERASED_WORD {
        Probe::Erased
    } else {
        Probe::Candidate
    }
}

/// Whether `bytes` open with something shaped like a base header: the
/// supported version with sane, aligned lengths. Says nothing about
/// whether the rest of the image holds up.
pub fn looks_like_header(bytes: &[u8]) -> bool {
    let Ok((header, _)) = BaseHeader::read_from_prefix(bytes) else {
        return false;
    };
    let header_size = usize::from(header.header_size.get());
    let total_size = header.total_size.get() as usize;
    header.version.get() == IMAGE_VERSION
        && header_size >= BASE_HEADER_LEN
        && header_size % IMAGE_ALIGN == 0
        && total_size >= header_size
        && total_size % IMAGE_ALIGN == 0
}

/// Whether a well-formed image should become a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Viability {
    Loadable,
    /// No program at all; the image only occupies space.
    Padding,
    /// The `ENABLED` flag is clear.
    Disabled,
    /// Built against a kernel version we can't promise to honor.
    IncompatibleKernel { major: u16, minor: u16 },
}

/// Fields shared by the `Main` and `Program` TLVs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProgramInfo {
    pub init_fn_offset: u32,
    pub protected_trailer_size: u32,
    pub minimum_ram_size: u32,
    pub binary_end: u32,
    pub app_version: u32,
}

/// Placement constraints from the `FixedAddresses` TLV. `None` means the
/// image doesn't care.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FixedAddresses {
    pub ram: Option<u32>,
    pub flash: Option<u32>,
}

/// One credential from an image footer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CredentialRecord<'a> {
    /// Position among the credential records of this image, counting only
    /// records in a format we understand.
    pub index: u16,
    pub format: CredentialFormat,
    pub data: &'a [u8],
}

/// A parsed, validated image. Borrows the flash it came from.
#[derive(Copy, Clone, Debug)]
pub struct Image<'a> {
    bytes: &'a [u8],
    header_size: u16,
    flags: ImageFlags,
    program: Option<ProgramInfo>,
    package_name: Option<&'a str>,
    fixed: FixedAddresses,
    kernel_version: Option<(u16, u16)>,
    short_id: Option<u32>,
}

/// Parses the image at the start of `bytes`. Bytes past the image's total
/// size are ignored.
pub fn parse(bytes: &[u8]) -> Result<Image<'_>, ParseError> {
    let (header, _) =
        BaseHeader::read_from_prefix(bytes).map_err(|_| ParseError::Truncated)?;

    let version = header.version.get();
    if version != IMAGE_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let header_size = header.header_size.get();
    if usize::from(header_size) < BASE_HEADER_LEN
        || usize::from(header_size) % IMAGE_ALIGN != 0
    {
        return Err(ParseError::BadHeaderLength { header_size });
    }

    let total_size = header.total_size.get();
    if total_size < u32::from(header_size) || total_size as usize % IMAGE_ALIGN != 0
    {
        return Err(ParseError::InconsistentSize {
            header_size,
            total_size,
        });
    }
    if total_size as usize > bytes.len() {
        return Err(ParseError::SizeOverrun {
            total_size,
            available: u32::try_from(bytes.len()).unwrap_or(u32::MAX),
        });
    }
    let bytes = &bytes[..total_size as usize];
    let header_bytes = &bytes[..usize::from(header_size)];

    let computed = header_checksum(header_bytes);
    let expected = header.checksum.get();
    if computed != expected {
        return Err(ParseError::BadChecksum { expected, computed });
    }

    let mut image = Image {
        bytes,
        header_size,
        flags: ImageFlags::from_bits_retain(header.flags.get()),
        program: None,
        package_name: None,
        fixed: FixedAddresses::default(),
        kernel_version: None,
        short_id: None,
    };

    let mut main = None;
    let mut program = None;
    for tlv in Tlvs::new(header_bytes, BASE_HEADER_LEN) {
        let (offset, kind, value) = tlv?;
        let bad = ParseError::BadTlv { offset };
        let Ok(kind) = TlvKind::try_from(kind) else {
            continue;
        };
        match kind {
            TlvKind::Main => {
                let t = MainTlv::read_from_bytes(value).map_err(|_| bad)?;
                main = Some(t);
            }
            TlvKind::Program => {
                let t = ProgramTlv::read_from_bytes(value).map_err(|_| bad)?;
                program = Some(t);
            }
            TlvKind::PackageName => {
                let name = core::str::from_utf8(value)
                    .map_err(|_| ParseError::BadPackageName)?;
                image.package_name = Some(name);
            }
            TlvKind::FixedAddresses => {
                let t = FixedAddressesTlv::read_from_bytes(value)
                    .map_err(|_| bad)?;
                let opt = |a: u32| (a != UNSET_ADDRESS).then_some(a);
                image.fixed = FixedAddresses {
                    ram: opt(t.start_process_ram.get()),
                    flash: opt(t.start_process_flash.get()),
                };
            }
            TlvKind::KernelVersion => {
                let t = KernelVersionTlv::read_from_bytes(value)
                    .map_err(|_| bad)?;
                image.kernel_version = Some((t.major.get(), t.minor.get()));
            }
            TlvKind::ShortId => {
                let t = ShortIdTlv::read_from_bytes(value).map_err(|_| bad)?;
                image.short_id =
                    Some(t.short_id.get()).filter(|&id| id != 0);
            }
            // Footers don't belong in the header. Skip, like any unknown.
            TlvKind::Credentials => {}
        }
    }

    image.program = match (program, main) {
        (Some(p), _) => Some(ProgramInfo {
            init_fn_offset: p.init_fn_offset.get(),
            protected_trailer_size: p.protected_trailer_size.get(),
            minimum_ram_size: p.minimum_ram_size.get(),
            binary_end: p.binary_end_offset.get(),
            app_version: p.app_version.get(),
        }),
        (None, Some(m)) => Some(ProgramInfo {
            init_fn_offset: m.init_fn_offset.get(),
            protected_trailer_size: m.protected_trailer_size.get(),
            minimum_ram_size: m.minimum_ram_size.get(),
            binary_end: total_size,
            app_version: 0,
        }),
        (None, None) => None,
    };

    if let Some(p) = &image.program {
        if p.binary_end < u32::from(header_size)
            || p.binary_end > total_size
            || p.binary_end as usize % IMAGE_ALIGN != 0
        {
            return Err(ParseError::BadBinaryEnd {
                binary_end: p.binary_end,
            });
        }
        let entry_offset = u32::from(header_size)
            .checked_add(p.protected_trailer_size)
            .and_then(|x| x.checked_add(p.init_fn_offset));
        match entry_offset {
            Some(e) if e < p.binary_end => (),
            _ => {
                return Err(ParseError::EntryOutOfBounds {
                    entry_offset: entry_offset.unwrap_or(u32::MAX),
                })
            }
        }

        // Walk the footer once now so that `credentials()` can't run into
        // anything malformed later.
        let footer = &bytes[p.binary_end as usize..];
        for tlv in Tlvs::new(footer, 0) {
            let (offset, kind, value) = match tlv {
                Ok((offset, kind, value)) => (offset + p.binary_end, kind, value),
                Err(ParseError::BadTlv { offset }) => {
                    return Err(ParseError::BadFooter {
                        offset: offset + p.binary_end,
                    })
                }
                Err(e) => return Err(e),
            };
            if TlvKind::try_from(kind) != Ok(TlvKind::Credentials) {
                continue;
            }
            let (h, data) = CredentialsHeader::read_from_prefix(value)
                .map_err(|_| ParseError::BadFooter { offset })?;
            if let Ok(format) = CredentialFormat::try_from(h.format.get()) {
                if data.len() < format.data_len() {
                    return Err(ParseError::BadFooter { offset });
                }
            }
        }
    }

    Ok(image)
}

impl<'a> Image<'a> {
    /// All bytes of the image, `[0, total_size)`.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn total_size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn header_size(&self) -> u16 {
        self.header_size
    }

    pub fn flags(&self) -> ImageFlags {
        self.flags
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.contains(ImageFlags::ENABLED)
    }

    pub fn program(&self) -> Option<&ProgramInfo> {
        self.program.as_ref()
    }

    pub fn package_name(&self) -> Option<&'a str> {
        self.package_name
    }

    pub fn fixed_addresses(&self) -> FixedAddresses {
        self.fixed
    }

    pub fn kernel_version(&self) -> Option<(u16, u16)> {
        self.kernel_version
    }

    /// Short id requested by the image, if it asked for a nonzero one.
    pub fn short_id_hint(&self) -> Option<u32> {
        self.short_id
    }

    pub fn app_version(&self) -> u32 {
        self.program.map_or(0, |p| p.app_version)
    }

    pub fn minimum_ram_size(&self) -> u32 {
        self.program.map_or(0, |p| p.minimum_ram_size)
    }

    /// Offset of the end of the area the process may execute but not write:
    /// the header plus the protected trailer.
    pub fn protected_size(&self) -> u32 {
        u32::from(self.header_size)
            + self.program.map_or(0, |p| p.protected_trailer_size)
    }

    /// Offset of the first instruction from the start of the image.
    pub fn entry_offset(&self) -> Option<u32> {
        self.program
            .map(|p| self.protected_size() + p.init_fn_offset)
    }

    /// The bytes covered by credentials: everything before the footer.
    pub fn integrity_region(&self) -> &'a [u8] {
        let end = self
            .program
            .map_or(self.bytes.len(), |p| p.binary_end as usize);
        &self.bytes[..end]
    }

    /// Credential records from the footer, in order. Footers in formats we
    /// don't understand are skipped, as is any non-credential footer.
    pub fn credentials(&self) -> Credentials<'a> {
        let start = self.integrity_region().len();
        Credentials {
            tlvs: Tlvs::new(&self.bytes[start..], 0),
            index: 0,
        }
    }

    pub fn viability(&self, kernel: KernelVersion) -> Viability {
        if self.program.is_none() {
            return Viability::Padding;
        }
        if !self.is_enabled() {
            return Viability::Disabled;
        }
        match self.kernel_version {
            Some((major, minor)) if !kernel.accepts(major, minor) => {
                Viability::IncompatibleKernel { major, minor }
            }
            _ => Viability::Loadable,
        }
    }
}

/// Iterator over the credentials of an image; see [`Image::credentials`].
#[derive(Clone, Debug)]
pub struct Credentials<'a> {
    tlvs: Tlvs<'a>,
    index: u16,
}

impl<'a> Iterator for Credentials<'a> {
    type Item = CredentialRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        // The footer was validated by `parse`, so errors can't occur here;
        // stop cleanly if one somehow does.
        for tlv in self.tlvs.by_ref() {
            let Ok((_, kind, value)) = tlv else {
                return None;
            };
            if TlvKind::try_from(kind) != Ok(TlvKind::Credentials) {
                continue;
            }
            let Ok((h, data)) = CredentialsHeader::read_from_prefix(value)
            else {
                continue;
            };
            let Ok(format) = CredentialFormat::try_from(h.format.get()) else {
                continue;
            };
            let index = self.index;
            self.index += 1;
            return Some(CredentialRecord {
                index,
                format,
                data: &data[..format.data_len()],
            });
        }
        None
    }
}

/// Walks a packed sequence of TLVs starting at `start` within `bytes`,
/// yielding `(offset, kind, value)` with the value trimmed to its declared
/// length.
#[derive(Clone, Debug)]
struct Tlvs<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tlvs<'a> {
    fn new(bytes: &'a [u8], start: usize) -> Self {
        Self { bytes, pos: start }
    }
}

impl<'a> Iterator for Tlvs<'a> {
    type Item = Result<(u32, u16, &'a [u8]), ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let offset = self.pos as u32;
        let rest = &self.bytes[self.pos..];
        let Ok((h, rest)) = TlvHeader::read_from_prefix(rest) else {
            self.pos = self.bytes.len();
            return Some(Err(ParseError::BadTlv { offset }));
        };
        let len = usize::from(h.length.get());
        let padded = padded_len(len);
        if padded > rest.len() {
            self.pos = self.bytes.len();
            return Some(Err(ParseError::BadTlv { offset }));
        }
        self.pos += core::mem::size_of::<TlvHeader>() + padded;
        Some(Ok((offset, h.kind.get(), &rest[..len])))
    }
}
