//! Firmware image manipulation and inspection utilities.
//!
//! This module offers tools to partition flash memory into image
//! slots and inspect the headers and trailing TLV records of the
//! images stored in them. Cryptographic checks live behind the
//! [`ImageValidator`] trait; everything here is structural.

use crate::devices::traits::Flash;
use crate::error::Error;
use crate::utilities::memory::{read_u16_le, read_u32_le, Address, Region};
use core::cmp::Ordering;
use nb::block;

/// Little endian word opening every firmware image header.
pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;
/// Bytes taken up by the fixed header fields. The header as a whole
/// occupies `ImageHeader::header_size` bytes, padding included.
pub const HEADER_SIZE: usize = 32;
/// Offset of the version record within the header.
pub(crate) const VERSION_OFFSET: usize = 20;

const TLV_INFO_MAGIC: u16 = 0x6907;
const TLV_PROTECTED_INFO_MAGIC: u16 = 0x6908;
const TLV_INFO_SIZE: usize = 4;
const TLV_ENTRY_SIZE: usize = 4;
/// TLV record holding the image's anti-rollback counter.
pub const TLV_SECURITY_COUNTER: u16 = 0x50;

/// Header flag marking an image meant to execute from RAM.
pub const FLAG_RAM_LOAD: u32 = 0x20;

/// Semantic firmware version as stored in the image header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build: u32,
}

impl Version {
    /// Precedence order between versions. The build number is
    /// informational only and does not participate.
    pub fn compare(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.revision).cmp(&(other.major, other.minor, other.revision))
    }
}

/// Fixed fields at the head of every firmware image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    /// Execution address for RAM loaded images.
    pub load_addr: u32,
    /// Full header size including padding; the image body starts
    /// this many bytes into the slot.
    pub header_size: u16,
    /// Size of the protected TLV area, zero if absent.
    pub protect_tlv_size: u16,
    /// Size of the image body, header excluded.
    pub image_size: u32,
    pub flags: u32,
    pub version: Version,
}

impl ImageHeader {
    /// Bytes occupied by the header and image body together, which is
    /// the range that gets copied to RAM or hashed for validation.
    /// Trailing TLV records are not included.
    pub fn loaded_size(&self) -> usize {
        usize::from(self.header_size) + self.image_size as usize
    }

    pub fn ram_loadable(&self) -> bool {
        self.flags & FLAG_RAM_LOAD != 0
    }
}

/// Flash range that may hold a single firmware image, its trailing
/// TLV records, and (for swap strategies) a trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot<A: Address> {
    /// Identifier of the flash device the slot lives on, reported
    /// back to the caller so it knows where to jump.
    pub device_id: u8,
    /// Address of the start of the slot.
    pub location: A,
    /// Size in bytes of the flash range occupied by the slot.
    pub size: usize,
}

impl<A: Address> Region<A> for Slot<A> {
    fn contains(&self, address: A) -> bool {
        let start: usize = self.location.into();
        let address: usize = address.into();
        (start <= address) && (start + self.size > address)
    }
}

/// The two slots backing one logical image: the primary one the
/// device boots from (or next to, for address based strategies) and
/// the secondary one updates are staged in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPair<A: Address> {
    pub image_index: u8,
    pub primary: Slot<A>,
    pub secondary: Slot<A>,
}

impl<A: Address> SlotPair<A> {
    pub fn slot(&self, index: u8) -> Slot<A> {
        match index {
            0 => self.primary,
            _ => self.secondary,
        }
    }
}

/// Outcome of image validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Verdict {
    /// The image is authentic and safe to boot or stage.
    Approved,
    /// The slot holds nothing that could be validated.
    NotBootable,
    /// The slot holds an image that fails authentication.
    Rejected,
}

/// Cryptographic image validation, supplied by the application.
///
/// Implementations must be deterministic: the bootloader calls
/// `validate` twice per decision and treats diverging verdicts as an
/// attack or hardware fault. `scratch` is working memory for hashing
/// and signature checks; it is borrowed for the duration of the call.
pub trait ImageValidator<F: Flash> {
    fn validate(
        &mut self,
        flash: &mut F,
        slot: Slot<F::Address>,
        header: &ImageHeader,
        image_index: u8,
        scratch: &mut [u8],
    ) -> Result<Verdict, Error>;
}

/// Reads and structurally checks the image header at the start of a
/// slot. A slot whose magic field reads erased reports
/// [`Error::SlotEmpty`]; headers that are present but malformed report
/// [`Error::HeaderInvalid`].
pub fn header_at<F: Flash>(flash: &mut F, slot: Slot<F::Address>) -> Result<ImageHeader, Error> {
    let mut bytes = [0u8; HEADER_SIZE];
    block!(flash.read(slot.location, &mut bytes))?;

    // An erased magic field alone marks the slot empty.
    let erased = flash.erased_value();
    if bytes[..4].iter().all(|byte| *byte == erased) {
        return Err(Error::SlotEmpty);
    }
    if read_u32_le(&bytes, 0) != IMAGE_MAGIC {
        return Err(Error::HeaderInvalid);
    }

    let header = decode_header(&bytes);
    if usize::from(header.header_size) < HEADER_SIZE {
        return Err(Error::HeaderInvalid);
    }
    let loaded = usize::from(header.header_size)
        .checked_add(header.image_size as usize)
        .ok_or(Error::HeaderInvalid)?;
    if loaded > slot.size {
        return Err(Error::ImageTooBig);
    }
    Ok(header)
}

/// Size of the image including header, body and all TLV records;
/// the footprint that must be preserved when swapping slots.
pub fn total_size<F: Flash>(
    flash: &mut F,
    slot: Slot<F::Address>,
    header: &ImageHeader,
) -> Result<usize, Error> {
    let mut offset = header.loaded_size();
    if header.protect_tlv_size > 0 {
        let info = read_tlv_info(flash, slot, offset)?;
        if info.magic != TLV_PROTECTED_INFO_MAGIC
            || usize::from(info.total) != usize::from(header.protect_tlv_size)
        {
            return Err(Error::HeaderInvalid);
        }
        offset += usize::from(header.protect_tlv_size);
    }
    let info = read_tlv_info(flash, slot, offset)?;
    if info.magic != TLV_INFO_MAGIC {
        return Err(Error::HeaderInvalid);
    }
    let total = offset + usize::from(info.total);
    if total > slot.size {
        return Err(Error::ImageTooBig);
    }
    Ok(total)
}

/// Retrieves the image's anti-rollback counter from its protected
/// TLV records, if it carries one.
pub fn security_counter<F: Flash>(
    flash: &mut F,
    slot: Slot<F::Address>,
    header: &ImageHeader,
) -> Result<Option<u32>, Error> {
    if header.protect_tlv_size == 0 {
        return Ok(None);
    }
    let base = header.loaded_size();
    let info = read_tlv_info(flash, slot, base)?;
    if info.magic != TLV_PROTECTED_INFO_MAGIC
        || usize::from(info.total) != usize::from(header.protect_tlv_size)
    {
        return Err(Error::HeaderInvalid);
    }
    let end = base + usize::from(info.total);
    if end > slot.size {
        return Err(Error::HeaderInvalid);
    }

    let mut offset = base + TLV_INFO_SIZE;
    while offset + TLV_ENTRY_SIZE <= end {
        let mut entry = [0u8; TLV_ENTRY_SIZE];
        block!(flash.read(slot.location + offset, &mut entry))?;
        let kind = read_u16_le(&entry, 0);
        let length = usize::from(read_u16_le(&entry, 2));
        let body = offset + TLV_ENTRY_SIZE;
        if body + length > end {
            return Err(Error::HeaderInvalid);
        }
        if kind == TLV_SECURITY_COUNTER {
            if length != 4 {
                return Err(Error::HeaderInvalid);
            }
            let mut value = [0u8; 4];
            block!(flash.read(slot.location + body, &mut value))?;
            return Ok(Some(u32::from_le_bytes(value)));
        }
        offset = body + length;
    }
    if offset != end {
        return Err(Error::HeaderInvalid);
    }
    Ok(None)
}

/// Erases a whole slot, image and trailer included.
pub fn erase_slot<F: Flash>(flash: &mut F, slot: Slot<F::Address>) -> Result<(), Error> {
    block!(flash.erase(slot.location, slot.size))?;
    Ok(())
}

/// Whether the slot's header area reads as erased. Cheaper than
/// [`header_at`]; used to tell an unprogrammed device apart from a
/// corrupted one.
pub fn slot_blank<F: Flash>(flash: &mut F, slot: Slot<F::Address>) -> Result<bool, Error> {
    let mut magic = [0u8; 4];
    block!(flash.read(slot.location, &mut magic))?;
    let erased = flash.erased_value();
    Ok(magic.iter().all(|byte| *byte == erased))
}

pub(crate) fn decode_version(bytes: &[u8]) -> Version {
    Version {
        major: bytes[0],
        minor: bytes[1],
        revision: read_u16_le(bytes, 2),
        build: read_u32_le(bytes, 4),
    }
}

fn decode_header(bytes: &[u8; HEADER_SIZE]) -> ImageHeader {
    ImageHeader {
        load_addr: read_u32_le(bytes, 4),
        header_size: read_u16_le(bytes, 8),
        protect_tlv_size: read_u16_le(bytes, 10),
        image_size: read_u32_le(bytes, 12),
        flags: read_u32_le(bytes, 16),
        version: decode_version(&bytes[VERSION_OFFSET..VERSION_OFFSET + 8]),
    }
}

struct TlvInfo {
    magic: u16,
    total: u16,
}

fn read_tlv_info<F: Flash>(
    flash: &mut F,
    slot: Slot<F::Address>,
    offset: usize,
) -> Result<TlvInfo, Error> {
    if offset + TLV_INFO_SIZE > slot.size {
        return Err(Error::HeaderInvalid);
    }
    let mut bytes = [0u8; TLV_INFO_SIZE];
    block!(flash.read(slot.location + offset, &mut bytes))?;
    Ok(TlvInfo { magic: read_u16_le(&bytes, 0), total: read_u16_le(&bytes, 2) })
}

#[cfg(not(target_arch = "arm"))]
#[doc(hidden)]
pub mod doubles {
    use super::*;
    use crate::utilities::memory::{write_u16_le, write_u32_le};

    /// Recipe for a syntactically valid firmware image: fixed header,
    /// deterministic body, a protected TLV area holding the security
    /// counter (when present) and an unprotected TLV area standing in
    /// for the signature records.
    pub struct FakeImage {
        pub version: Version,
        pub body_size: usize,
        pub security_counter: Option<u32>,
        pub flags: u32,
        pub load_addr: u32,
    }

    impl Default for FakeImage {
        fn default() -> Self {
            FakeImage {
                version: Version { major: 1, minor: 0, revision: 0, build: 0 },
                body_size: 120,
                security_counter: None,
                flags: 0,
                load_addr: 0,
            }
        }
    }

    const SHAM_SIGNATURE_TLV: u16 = 0x10;
    const SHAM_SIGNATURE_SIZE: usize = 8;

    /// Exact bytes such an image occupies on flash.
    pub fn render_image(image: &FakeImage) -> Vec<u8> {
        let protect_tlv_size: u16 = match image.security_counter {
            Some(_) => (TLV_INFO_SIZE + TLV_ENTRY_SIZE + 4) as u16,
            None => 0,
        };
        let unprotected_size = (TLV_INFO_SIZE + TLV_ENTRY_SIZE + SHAM_SIGNATURE_SIZE) as u16;

        let mut header = [0u8; HEADER_SIZE];
        write_u32_le(IMAGE_MAGIC, &mut header, 0);
        write_u32_le(image.load_addr, &mut header, 4);
        write_u16_le(HEADER_SIZE as u16, &mut header, 8);
        write_u16_le(protect_tlv_size, &mut header, 10);
        write_u32_le(image.body_size as u32, &mut header, 12);
        write_u32_le(image.flags, &mut header, 16);
        header[20] = image.version.major;
        header[21] = image.version.minor;
        write_u16_le(image.version.revision, &mut header, 22);
        write_u32_le(image.version.build, &mut header, 24);

        let mut bytes = header.to_vec();
        bytes.extend((0..image.body_size).map(|index| (index as u8) ^ image.version.minor));

        if let Some(counter) = image.security_counter {
            let mut protected = [0u8; TLV_INFO_SIZE + TLV_ENTRY_SIZE + 4];
            write_u16_le(TLV_PROTECTED_INFO_MAGIC, &mut protected, 0);
            write_u16_le(protect_tlv_size, &mut protected, 2);
            write_u16_le(TLV_SECURITY_COUNTER, &mut protected, 4);
            write_u16_le(4, &mut protected, 6);
            write_u32_le(counter, &mut protected, 8);
            bytes.extend(protected);
        }

        let mut unprotected = [0u8; TLV_INFO_SIZE + TLV_ENTRY_SIZE + SHAM_SIGNATURE_SIZE];
        write_u16_le(TLV_INFO_MAGIC, &mut unprotected, 0);
        write_u16_le(unprotected_size, &mut unprotected, 2);
        write_u16_le(SHAM_SIGNATURE_TLV, &mut unprotected, 4);
        write_u16_le(SHAM_SIGNATURE_SIZE as u16, &mut unprotected, 6);
        unprotected[8..].fill(0xAB);
        bytes.extend(unprotected);

        bytes
    }

    /// Erases `slot` and programs `image` into it. Panics on driver
    /// errors, which fakes only produce on purpose.
    pub fn write_image<F: Flash>(flash: &mut F, slot: Slot<F::Address>, image: &FakeImage) {
        use nb::block;
        let rendered = render_image(image);
        assert!(rendered.len() <= slot.size, "fake image larger than its slot");
        block!(flash.erase(slot.location, slot.size)).unwrap();

        let alignment = flash.write_alignment();
        let erased = flash.erased_value();
        let mut padded = rendered;
        padded.resize(crate::utilities::memory::align_up(padded.len(), alignment), erased);
        block!(flash.write(slot.location, &padded)).unwrap();
    }

    /// Scripted stand-in for the application's validator.
    pub enum ValidatorScript {
        AcceptAll,
        RejectAll,
        /// Rejects only the image starting at this flash offset.
        RejectAt(usize),
        /// Approves on odd calls and rejects on even ones, violating
        /// the determinism the bootloader insists on.
        Alternating,
    }

    pub struct FakeValidator {
        pub script: ValidatorScript,
        pub calls: usize,
    }

    impl FakeValidator {
        pub fn new(script: ValidatorScript) -> Self {
            FakeValidator { script, calls: 0 }
        }

        pub fn accept_all() -> Self {
            Self::new(ValidatorScript::AcceptAll)
        }
    }

    impl<F: Flash> ImageValidator<F> for FakeValidator {
        fn validate(
            &mut self,
            _flash: &mut F,
            slot: Slot<F::Address>,
            _header: &ImageHeader,
            _image_index: u8,
            _scratch: &mut [u8],
        ) -> Result<Verdict, Error> {
            self.calls += 1;
            Ok(match self.script {
                ValidatorScript::AcceptAll => Verdict::Approved,
                ValidatorScript::RejectAll => Verdict::Rejected,
                ValidatorScript::RejectAt(address) => {
                    if slot.location.into() == address {
                        Verdict::Rejected
                    } else {
                        Verdict::Approved
                    }
                }
                ValidatorScript::Alternating => {
                    if self.calls % 2 == 0 {
                        Verdict::Rejected
                    } else {
                        Verdict::Approved
                    }
                }
            })
        }
    }
}
