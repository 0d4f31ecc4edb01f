//! ELF-level access to machine-code images.
//!
//! Section and symbol walking go through the `object` crate; the
//! validation and size-estimation paths read the headers by hand because
//! they must work on blobs whose exact length is unknown (a driver hands
//! us a pointer, not a file).

use byteorder::{ByteOrder, LittleEndian};
use object::read::{Object, ObjectSection, ObjectSymbol};

use crate::error::Error;

pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const SHT_NOBITS: u32 = 8;

/// SM number of the target architecture, in the low ELF flag byte.
pub const EF_SM_MASK: u32 = 0xff;
/// Architecture variant bits, mapping to the "a"/"f" tag suffixes.
pub const EF_VARIANT_A: u32 = 0x100;
pub const EF_VARIANT_F: u32 = 0x200;

/// Validate that a blob is a machine image we can analyze: ELF magic,
/// a known class, little-endian data, a parsable section table, and a
/// section-header string table.
pub fn validate_elf(bytes: &[u8]) -> Result<(), Error> {
    if bytes.len() < 64 {
        return Err(Error::TruncatedHeader("ELF"));
    }
    if &bytes[..4] != ELF_MAGIC {
        return Err(Error::InvalidElf("bad magic"));
    }
    let class = bytes[EI_CLASS];
    if class != ELFCLASS32 && class != ELFCLASS64 {
        return Err(Error::InvalidElf("unknown ELF class"));
    }
    if bytes[EI_DATA] != ELFDATA2LSB {
        return Err(Error::InvalidElf("not little-endian"));
    }

    let (shnum, shstrndx) = if class == ELFCLASS64 {
        (
            LittleEndian::read_u16(&bytes[60..62]),
            LittleEndian::read_u16(&bytes[62..64]),
        )
    } else {
        (
            LittleEndian::read_u16(&bytes[48..50]),
            LittleEndian::read_u16(&bytes[50..52]),
        )
    };
    if shnum == 0 {
        return Err(Error::InvalidElf("no sections"));
    }
    if shstrndx >= shnum {
        return Err(Error::InvalidElf("section header string table index out of range"));
    }

    // Let object check the rest of the identification and the tables.
    object::File::parse(bytes).map_err(Error::ObjectParseError)?;
    Ok(())
}

/// Estimate the file extent of an ELF whose true length is unknown:
/// the maximum of the program-segment ends, the non-NOBITS section ends,
/// and the end of the section-header table.
pub fn estimate_elf_size(bytes: &[u8]) -> Result<u64, Error> {
    if bytes.len() < 64 || &bytes[..4] != ELF_MAGIC {
        return Err(Error::InvalidElf("bad magic"));
    }
    let is_64 = bytes[EI_CLASS] == ELFCLASS64;

    let (ehsize, phoff, phentsize, phnum, shoff, shentsize, shnum) = if is_64 {
        (
            64u64,
            LittleEndian::read_u64(&bytes[32..40]),
            LittleEndian::read_u16(&bytes[54..56]) as u64,
            LittleEndian::read_u16(&bytes[56..58]) as u64,
            LittleEndian::read_u64(&bytes[40..48]),
            LittleEndian::read_u16(&bytes[58..60]) as u64,
            LittleEndian::read_u16(&bytes[60..62]) as u64,
        )
    } else {
        (
            52u64,
            LittleEndian::read_u32(&bytes[28..32]) as u64,
            LittleEndian::read_u16(&bytes[42..44]) as u64,
            LittleEndian::read_u16(&bytes[44..46]) as u64,
            LittleEndian::read_u32(&bytes[32..36]) as u64,
            LittleEndian::read_u16(&bytes[46..48]) as u64,
            LittleEndian::read_u16(&bytes[48..50]) as u64,
        )
    };

    let mut max_offset = ehsize;

    if phnum > 0 {
        max_offset = max_offset.max(phoff + phnum * phentsize);
        for i in 0..phnum {
            let base = (phoff + i * phentsize) as usize;
            let Some(phdr) = bytes.get(base..base + phentsize as usize) else {
                return Err(Error::TruncatedHeader("program header"));
            };
            let (p_offset, p_filesz) = if is_64 {
                (
                    LittleEndian::read_u64(&phdr[8..16]),
                    LittleEndian::read_u64(&phdr[32..40]),
                )
            } else {
                (
                    LittleEndian::read_u32(&phdr[4..8]) as u64,
                    LittleEndian::read_u32(&phdr[16..20]) as u64,
                )
            };
            max_offset = max_offset.max(p_offset + p_filesz);
        }
    }

    if shnum > 0 {
        max_offset = max_offset.max(shoff + shnum * shentsize);
        for i in 0..shnum {
            let base = (shoff + i * shentsize) as usize;
            let Some(shdr) = bytes.get(base..base + shentsize as usize) else {
                return Err(Error::TruncatedHeader("section header"));
            };
            let (sh_type, sh_offset, sh_size) = if is_64 {
                (
                    LittleEndian::read_u32(&shdr[4..8]),
                    LittleEndian::read_u64(&shdr[24..32]),
                    LittleEndian::read_u64(&shdr[32..40]),
                )
            } else {
                (
                    LittleEndian::read_u32(&shdr[4..8]),
                    LittleEndian::read_u32(&shdr[16..20]) as u64,
                    LittleEndian::read_u32(&shdr[20..24]) as u64,
                )
            };
            if sh_type != SHT_NOBITS {
                max_offset = max_offset.max(sh_offset + sh_size);
            }
        }
    }

    Ok(max_offset)
}

/// Read the architecture tag out of a machine image's ELF flags.
pub fn arch_from_elf(bytes: &[u8]) -> Result<String, Error> {
    if bytes.len() < 64 || &bytes[..4] != ELF_MAGIC {
        return Err(Error::InvalidElf("bad magic"));
    }
    let flags = if bytes[EI_CLASS] == ELFCLASS64 {
        LittleEndian::read_u32(&bytes[48..52])
    } else {
        LittleEndian::read_u32(&bytes[36..40])
    };
    let sm = flags & EF_SM_MASK;
    let suffix = if flags & EF_VARIANT_A != 0 {
        "a"
    } else if flags & EF_VARIANT_F != 0 {
        "f"
    } else {
        ""
    };
    Ok(format!("{sm}{suffix}"))
}

pub fn parse_object(bytes: &[u8]) -> Result<object::File<'_>, Error> {
    object::File::parse(bytes).map_err(Error::ObjectParseError)
}

/// Bytes of the named section.
pub fn section_bytes<'data>(
    file: &object::File<'data>,
    name: &str,
) -> Result<&'data [u8], Error> {
    let section = file
        .section_by_name(name)
        .ok_or_else(|| Error::SectionNotFound(name.to_string()))?;
    section.data().map_err(Error::ObjectParseError)
}

/// File offset and size of the named section.
pub fn section_file_range(file: &object::File<'_>, name: &str) -> Result<(u64, u64), Error> {
    let section = file
        .section_by_name(name)
        .ok_or_else(|| Error::SectionNotFound(name.to_string()))?;
    section
        .file_range()
        .ok_or(Error::InvalidElf("section has no file data"))
}

/// Names of all defined function symbols in the image.
pub fn function_symbol_names(file: &object::File<'_>) -> Vec<String> {
    file.symbols()
        .filter(|symbol| symbol.kind() == object::SymbolKind::Text && symbol.is_definition())
        .filter_map(|symbol| symbol.name().ok().map(str::to_string))
        .collect()
}

/// Whether the image defines a symbol with this exact name.
pub fn has_symbol(file: &object::File<'_>, name: &str) -> bool {
    file.symbols()
        .any(|symbol| symbol.is_definition() && symbol.name().is_ok_and(|n| n == name))
}
