//! Fat-container demultiplexing.
//!
//! A driver hands us one of three things: a fat container (a directory of
//! per-architecture sub-images, possibly LZ4-compressed), a bare machine
//! image (one architecture's ELF), or textual IR. Host binaries embed
//! their fat container behind a small wrapper header, so library loads
//! arrive wrapped. [`split`] turns any of these into lists of owned
//! [`MachineImage`]s and [`IrImage`]s.

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::elf;
use crate::error::Error;
use crate::image::{IrImage, MachineImage};
use crate::lz4;

pub const FATBIN_MAGIC: u32 = 0xba55_ed50;
pub const WRAPPER_MAGIC: u32 = 0x4662_43b1;

pub const ENTRY_KIND_IR: u16 = 1;
pub const ENTRY_KIND_ELF: u16 = 2;
pub const ENTRY_FLAG_COMPRESSED: u16 = 0x2000;

/// Container header, at offset 0 of a fat binary.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct FatHeader {
    pub magic: U32,
    pub version: U16,
    /// Offset of the first entry.
    pub header_size: U16,
    /// Total size of all entries following the header.
    pub body_size: U64,
}

/// One sub-image entry of the container directory.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct FatEntryHeader {
    pub kind: U16,
    pub flags: U16,
    /// Offset of the payload, relative to this entry header.
    pub header_size: U32,
    /// Stored payload size.
    pub payload_size: U64,
    /// Payload size after decompression; zero for stored entries.
    pub uncompressed_size: U64,
    /// SM number of the target architecture.
    pub arch: U32,
    /// 0 = no variant suffix, 1 = "a", 2 = "f".
    pub variant: U32,
}

/// Wrapper header a host executable puts in front of its embedded fat
/// container.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct WrapperHeader {
    pub magic: U32,
    pub version: U32,
    pub body_offset: U64,
    pub body_size: U64,
}

/// What a driver-loaded blob turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    FatContainer,
    WrappedFatContainer,
    MachineImage,
    IrText,
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))
}

/// Identify a blob by its leading bytes.
pub fn identify(bytes: &[u8]) -> Result<BlobKind, Error> {
    match read_u32(bytes) {
        Some(FATBIN_MAGIC) => return Ok(BlobKind::FatContainer),
        Some(WRAPPER_MAGIC) => return Ok(BlobKind::WrappedFatContainer),
        _ => {}
    }
    if bytes.starts_with(elf::ELF_MAGIC) {
        return Ok(BlobKind::MachineImage);
    }
    if looks_like_ir_text(bytes) {
        return Ok(BlobKind::IrText);
    }
    Err(Error::UnrecognizedBlob)
}

fn looks_like_ir_text(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(256)];
    if !head
        .iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7f).contains(&b))
    {
        return false;
    }
    memchr::memmem::find(head, b".version").is_some() || head.starts_with(b"//")
}

/// Copy out the container (or single image) a driver blob refers to.
///
/// The driver does not tell us the blob's length, so the exact extent is
/// recovered from the headers: the fat header for containers, the
/// estimated ELF layout for bare machine images.
pub fn unwrap_container(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    match identify(bytes)? {
        BlobKind::WrappedFatContainer => {
            let (wrapper, _) = WrapperHeader::read_from_prefix(bytes)
                .map_err(|_| Error::TruncatedHeader("wrapper"))?;
            let start = wrapper.body_offset.get() as usize;
            let end = start + wrapper.body_size.get() as usize;
            let body = bytes.get(start..end).ok_or(Error::EntryOutOfBounds {
                offset: wrapper.body_offset.get(),
                size: bytes.len() as u64,
            })?;
            // The wrapper body is itself a fat container.
            unwrap_container(body)
        }
        BlobKind::FatContainer => {
            let (header, _) = FatHeader::read_from_prefix(bytes)
                .map_err(|_| Error::TruncatedHeader("fat container"))?;
            let total = header.header_size.get() as usize + header.body_size.get() as usize;
            let container = bytes.get(..total).ok_or(Error::EntryOutOfBounds {
                offset: total as u64,
                size: bytes.len() as u64,
            })?;
            Ok(container.to_vec())
        }
        BlobKind::MachineImage => {
            let size = elf::estimate_elf_size(bytes)? as usize;
            let image = bytes.get(..size).ok_or(Error::TruncatedHeader("ELF"))?;
            Ok(image.to_vec())
        }
        BlobKind::IrText => Ok(bytes.to_vec()),
    }
}

/// The decoded sub-images of one container.
#[derive(Debug, Default)]
pub struct SplitContainer {
    pub machine_images: Vec<MachineImage>,
    pub ir_images: Vec<IrImage>,
}

/// Split a blob into its machine-code and IR images.
///
/// Malformed sub-images are skipped with a warning; the rest of the
/// container is still processed.
pub fn split(bytes: &[u8]) -> Result<SplitContainer, Error> {
    let mut result = SplitContainer::default();
    match identify(bytes)? {
        BlobKind::WrappedFatContainer => {
            let inner = unwrap_container(bytes)?;
            return split(&inner);
        }
        BlobKind::MachineImage => {
            elf::validate_elf(bytes)?;
            let arch = elf::arch_from_elf(bytes)?;
            result.machine_images.push(MachineImage {
                arch,
                bytes: bytes.to_vec(),
            });
            return Ok(result);
        }
        BlobKind::IrText => {
            result.ir_images.push(IrImage {
                arch: String::new(),
                text: bytes.to_vec(),
            });
            return Ok(result);
        }
        BlobKind::FatContainer => {}
    }

    let (header, _) =
        FatHeader::read_from_prefix(bytes).map_err(|_| Error::TruncatedHeader("fat container"))?;
    let body_end = header.header_size.get() as u64 + header.body_size.get();
    let mut offset = header.header_size.get() as u64;

    while offset < body_end {
        let entry_bytes = bytes.get(offset as usize..).ok_or(Error::EntryOutOfBounds {
            offset,
            size: bytes.len() as u64,
        })?;
        let (entry, _) = FatEntryHeader::read_from_prefix(entry_bytes)
            .map_err(|_| Error::TruncatedHeader("fat entry"))?;

        let payload_start = offset + entry.header_size.get() as u64;
        let payload_end = payload_start + entry.payload_size.get();
        if payload_end > body_end || payload_end > bytes.len() as u64 {
            return Err(Error::EntryOutOfBounds {
                offset,
                size: body_end,
            });
        }
        let payload = &bytes[payload_start as usize..payload_end as usize];

        let decoded = if entry.flags.get() & ENTRY_FLAG_COMPRESSED != 0 {
            let want = entry.uncompressed_size.get();
            let decoded = lz4::decompress(payload, want as usize);
            if decoded.len() as u64 != want {
                log::warn!(
                    "skipping sub-image at offset {offset:#x}: {}",
                    Error::DecompressedSizeMismatch {
                        got: decoded.len() as u64,
                        want,
                    }
                );
                offset = payload_end;
                continue;
            }
            decoded
        } else {
            payload.to_vec()
        };

        let arch = arch_tag(entry.arch.get(), entry.variant.get());
        match entry.kind.get() {
            ENTRY_KIND_ELF => match elf::validate_elf(&decoded) {
                Ok(()) => {
                    log::debug!(
                        "container sub-image: arch {arch}, {} bytes of machine code",
                        decoded.len()
                    );
                    result.machine_images.push(MachineImage {
                        arch,
                        bytes: decoded,
                    });
                }
                Err(e) => {
                    log::warn!("skipping malformed machine image for arch {arch}: {e}");
                }
            },
            ENTRY_KIND_IR => {
                result.ir_images.push(IrImage {
                    arch,
                    text: decoded,
                });
            }
            kind => {
                log::warn!("skipping sub-image of unknown kind {kind} at offset {offset:#x}");
            }
        }
        offset = payload_end;
    }

    Ok(result)
}

fn arch_tag(arch: u32, variant: u32) -> String {
    match variant {
        1 => format!("{arch}a"),
        2 => format!("{arch}f"),
        _ => format!("{arch}"),
    }
}
