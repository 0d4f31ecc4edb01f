//! Fixture builders for tests, behind the `test-helpers` feature:
//! synthetic machine images and fat containers with the exact layout the
//! parsers expect.

use object::write::{Object, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, FileFlags, SectionKind, SymbolFlags, SymbolKind,
    SymbolScope,
};

use crate::container::{
    FatEntryHeader, FatHeader, WrapperHeader, ENTRY_FLAG_COMPRESSED, ENTRY_KIND_ELF,
    ENTRY_KIND_IR, FATBIN_MAGIC, WRAPPER_MAGIC,
};
use crate::elf::{EF_VARIANT_A, EF_VARIANT_F};

/// ELF flags for an architecture tag like `"90"` or `"90a"`.
pub fn e_flags_for_arch(tag: &str) -> u32 {
    let sm: u32 = tag
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0);
    let suffix: String = tag.chars().skip_while(char::is_ascii_digit).collect();
    let variant = match suffix.as_str() {
        "a" => EF_VARIANT_A,
        "f" => EF_VARIANT_F,
        _ => 0,
    };
    sm | variant
}

/// One kernel to place into a synthetic machine image.
pub struct KernelSpec<'a> {
    pub name: &'a str,
    pub code: Vec<u8>,
    pub param_sizes: Vec<u32>,
}

/// Build a machine image holding the given kernels, tagged for `arch`.
pub fn build_machine_image(arch: &str, kernels: &[KernelSpec<'_>]) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    obj.flags = FileFlags::Elf {
        os_abi: 0x33,
        abi_version: 0x7,
        e_flags: e_flags_for_arch(arch),
    };

    for kernel in kernels {
        let text_id = obj.add_section(
            Vec::new(),
            format!(".text.{}", kernel.name).into_bytes(),
            SectionKind::Text,
        );
        obj.set_section_data(text_id, kernel.code.clone(), 16);
        obj.add_symbol(Symbol {
            name: kernel.name.as_bytes().to_vec(),
            value: 0,
            size: kernel.code.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text_id),
            flags: SymbolFlags::None,
        });

        if !kernel.param_sizes.is_empty() {
            let info_id = obj.add_section(
                Vec::new(),
                format!(".nv.info.{}", kernel.name).into_bytes(),
                SectionKind::ReadOnlyData,
            );
            obj.set_section_data(info_id, param_info_section(&kernel.param_sizes), 4);
        }
    }

    obj.write().expect("synthetic image always writes")
}

/// Encode kernel-parameter records the way `.nv.info.<name>` carries
/// them.
pub fn param_info_section(param_sizes: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut offset = 0u16;
    for (ordinal, &size) in param_sizes.iter().enumerate() {
        bytes.extend_from_slice(&[0x04, 0x17]);
        bytes.extend_from_slice(&12u16.to_le_bytes());
        bytes.extend_from_slice(&(ordinal as u32).to_le_bytes());
        bytes.extend_from_slice(&(ordinal as u16).to_le_bytes());
        bytes.extend_from_slice(&offset.to_le_bytes());
        bytes.extend_from_slice(&(size << 18).to_le_bytes());
        offset += size as u16;
    }
    bytes
}

/// One entry to place into a synthetic fat container.
pub struct EntrySpec {
    pub kind: u16,
    pub arch: String,
    pub payload: Vec<u8>,
    pub compress: bool,
}

impl EntrySpec {
    pub fn machine(arch: &str, payload: Vec<u8>) -> Self {
        EntrySpec {
            kind: ENTRY_KIND_ELF,
            arch: arch.to_string(),
            payload,
            compress: false,
        }
    }

    pub fn ir(arch: &str, text: &str) -> Self {
        EntrySpec {
            kind: ENTRY_KIND_IR,
            arch: arch.to_string(),
            payload: text.as_bytes().to_vec(),
            compress: false,
        }
    }
}

fn split_arch(tag: &str) -> (u32, u32) {
    let sm: u32 = tag
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0);
    let variant = match tag.chars().skip_while(char::is_ascii_digit).collect::<String>().as_str() {
        "a" => 1,
        "f" => 2,
        _ => 0,
    };
    (sm, variant)
}

/// Store bytes as a literal-only LZ4 token stream. The decoder accepts a
/// final token with no match section, which is exactly what this emits.
pub fn lz4_store(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let len = data.len();
    if len < 15 {
        out.push((len as u8) << 4);
    } else {
        out.push(0xf0);
        let mut rest = len - 15;
        while rest >= 255 {
            out.push(0xff);
            rest -= 255;
        }
        out.push(rest as u8);
    }
    out.extend_from_slice(data);
    out
}

/// Serialize a fat container from entries.
pub fn build_container(entries: &[EntrySpec]) -> Vec<u8> {
    let mut body = Vec::new();
    for entry in entries {
        let (stored, flags, uncompressed) = if entry.compress {
            (
                lz4_store(&entry.payload),
                ENTRY_FLAG_COMPRESSED,
                entry.payload.len() as u64,
            )
        } else {
            (entry.payload.clone(), 0, 0)
        };
        let (sm, variant) = split_arch(&entry.arch);
        body.extend_from_slice(&entry.kind.to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&(std::mem::size_of::<FatEntryHeader>() as u32).to_le_bytes());
        body.extend_from_slice(&(stored.len() as u64).to_le_bytes());
        body.extend_from_slice(&uncompressed.to_le_bytes());
        body.extend_from_slice(&sm.to_le_bytes());
        body.extend_from_slice(&variant.to_le_bytes());
        body.extend_from_slice(&stored);
    }

    let mut container = Vec::new();
    container.extend_from_slice(&FATBIN_MAGIC.to_le_bytes());
    container.extend_from_slice(&1u16.to_le_bytes());
    container.extend_from_slice(&(std::mem::size_of::<FatHeader>() as u16).to_le_bytes());
    container.extend_from_slice(&(body.len() as u64).to_le_bytes());
    container.extend_from_slice(&body);
    container
}

/// Wrap a container behind the host-executable wrapper header, with some
/// leading junk after the header to prove the offset is honored.
pub fn build_wrapped_container(container: &[u8]) -> Vec<u8> {
    let header_size = std::mem::size_of::<WrapperHeader>() as u64;
    let body_offset = header_size + 8;
    let mut out = Vec::new();
    out.extend_from_slice(&WRAPPER_MAGIC.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&body_offset.to_le_bytes());
    out.extend_from_slice(&(container.len() as u64).to_le_bytes());
    out.extend_from_slice(&[0xeeu8; 8]);
    out.extend_from_slice(container);
    out
}
