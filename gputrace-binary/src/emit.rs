//! Re-emission of a machine image with one rewritten text section.
//!
//! Instrumentation grows a kernel's `.text.<name>` section. The emitter
//! splices the new bytes into the image and shifts everything that lived
//! after the old section data (later section contents, the section
//! header table, program segments), preserving every unrelated byte.
//! Only 64-bit little-endian images are supported, which is the only
//! flavor the driver produces.

use byteorder::{ByteOrder, LittleEndian};
use object::read::{Object, ObjectSection};

use crate::elf;
use crate::error::Error;

struct SectionLayout {
    shdr_pos: usize,
    sh_type: u32,
    sh_offset: u64,
    sh_size: u64,
    sh_addralign: u64,
}

const SHT_NOBITS: u32 = 8;

/// Replace the contents of `section_name` with `new_bytes`, returning a
/// new image. The result is a valid ELF: offsets, sizes, the section
/// header table position, program headers, and the section's symbol
/// sizes are all updated.
pub fn replace_section(
    image: &[u8],
    section_name: &str,
    new_bytes: &[u8],
) -> Result<Vec<u8>, Error> {
    elf::validate_elf(image)?;
    if image[4] != 2 {
        return Err(Error::EmitLayout {
            section: section_name.to_string(),
            reason: "only 64-bit images can be re-emitted",
        });
    }

    let (old_offset, old_size) = {
        let file = elf::parse_object(image)?;
        elf::section_file_range(&file, section_name)?
    };
    let old_end = old_offset + old_size;

    let shoff = LittleEndian::read_u64(&image[40..48]);
    let shentsize = LittleEndian::read_u16(&image[58..60]) as u64;
    let shnum = LittleEndian::read_u16(&image[60..62]) as u64;
    let phoff = LittleEndian::read_u64(&image[32..40]);
    let phentsize = LittleEndian::read_u16(&image[54..56]) as u64;
    let phnum = LittleEndian::read_u16(&image[56..58]) as u64;

    // Collect section layouts and find the rewritten one.
    let mut sections = Vec::with_capacity(shnum as usize);
    let mut target_index = None;
    for i in 0..shnum {
        let pos = (shoff + i * shentsize) as usize;
        let shdr = image
            .get(pos..pos + shentsize as usize)
            .ok_or(Error::TruncatedHeader("section header"))?;
        let layout = SectionLayout {
            shdr_pos: pos,
            sh_type: LittleEndian::read_u32(&shdr[4..8]),
            sh_offset: LittleEndian::read_u64(&shdr[24..32]),
            sh_size: LittleEndian::read_u64(&shdr[32..40]),
            sh_addralign: LittleEndian::read_u64(&shdr[48..56]).max(1),
        };
        if layout.sh_offset == old_offset && layout.sh_size == old_size {
            target_index = Some(i as usize);
        }
        sections.push(layout);
    }
    let target_index = target_index.ok_or_else(|| Error::SectionNotFound(section_name.to_string()))?;

    // Everything at or after the old section end shifts by a multiple of
    // the largest alignment of any shifted section, so alignments hold.
    let delta = new_bytes.len() as i64 - old_size as i64;
    let mut max_align = 1u64;
    for section in &sections {
        if section.sh_offset >= old_end && section.sh_type != SHT_NOBITS {
            max_align = max_align.max(section.sh_addralign);
        }
    }
    let shift = if delta <= 0 {
        // Never shrink the layout; pad the section region instead.
        0
    } else {
        crate::kernel::align_up(delta as u64, max_align)
    };
    let pad = (old_size as i64 + shift as i64 - new_bytes.len() as i64) as usize;

    // Assemble: prefix, new section bytes (padded to the shifted span),
    // then the rest of the original file.
    let mut out = Vec::with_capacity(image.len() + shift as usize);
    out.extend_from_slice(&image[..old_offset as usize]);
    out.extend_from_slice(new_bytes);
    out.extend(std::iter::repeat_n(0u8, pad));
    out.extend_from_slice(&image[old_end as usize..]);

    let move_offset = |offset: u64| -> u64 {
        if offset >= old_end {
            offset + shift
        } else {
            offset
        }
    };

    // Header table positions.
    let new_shoff = move_offset(shoff);
    LittleEndian::write_u64(&mut out[40..48], new_shoff);
    LittleEndian::write_u64(&mut out[32..40], move_offset(phoff));

    // Section headers: the target's size, everyone's offsets.
    for (index, section) in sections.iter().enumerate() {
        let pos = (new_shoff + (section.shdr_pos as u64 - shoff)) as usize;
        let shdr = &mut out[pos..pos + shentsize as usize];
        if index == target_index {
            LittleEndian::write_u64(&mut shdr[32..40], new_bytes.len() as u64);
        }
        let new_offset = move_offset(section.sh_offset);
        LittleEndian::write_u64(&mut shdr[24..32], new_offset);
    }

    // Program headers: shift offsets, widen any segment spanning the
    // rewritten section.
    for i in 0..phnum {
        let pos = (move_offset(phoff) + i * phentsize) as usize;
        let phdr = &mut out[pos..pos + phentsize as usize];
        let p_offset = LittleEndian::read_u64(&phdr[8..16]);
        let p_filesz = LittleEndian::read_u64(&phdr[32..40]);
        let p_memsz = LittleEndian::read_u64(&phdr[40..48]);
        if p_offset >= old_end {
            LittleEndian::write_u64(&mut phdr[8..16], p_offset + shift);
        } else if p_offset <= old_offset && p_offset + p_filesz >= old_end {
            LittleEndian::write_u64(&mut phdr[32..40], p_filesz + shift);
            LittleEndian::write_u64(&mut phdr[40..48], p_memsz + shift);
        }
    }

    // Symbols defined in the rewritten section: a symbol covering the
    // whole old section now covers the whole new one.
    patch_symtab_sizes(&mut out, image, target_index, old_size, new_bytes.len() as u64)?;

    Ok(out)
}

/// Update `st_size` of symbols that covered the whole rewritten section.
fn patch_symtab_sizes(
    out: &mut [u8],
    original: &[u8],
    target_section: usize,
    old_size: u64,
    new_size: u64,
) -> Result<(), Error> {
    // Locate the symbol table through the original image; its contents
    // sit at the (possibly shifted) offset recorded in the new headers.
    let file = elf::parse_object(original)?;
    let Some(symtab) = file.section_by_name(".symtab") else {
        return Ok(());
    };
    let Some((symtab_offset, symtab_size)) = symtab.file_range() else {
        return Ok(());
    };

    // Find the table's new offset from the rewritten headers.
    let shoff = LittleEndian::read_u64(&out[40..48]);
    let shentsize = LittleEndian::read_u16(&out[58..60]) as u64;
    let shnum = LittleEndian::read_u16(&out[60..62]) as u64;
    let mut new_symtab_offset = None;
    for i in 0..shnum {
        let pos = (shoff + i * shentsize) as usize;
        let sh_type = LittleEndian::read_u32(&out[pos + 4..pos + 8]);
        let sh_size = LittleEndian::read_u64(&out[pos + 32..pos + 40]);
        // SHT_SYMTAB
        if sh_type == 2 && sh_size == symtab_size {
            new_symtab_offset = Some(LittleEndian::read_u64(&out[pos + 24..pos + 32]));
            break;
        }
    }
    let Some(new_symtab_offset) = new_symtab_offset else {
        return Ok(());
    };

    const SYM_ENTSIZE: u64 = 24;
    let count = symtab_size / SYM_ENTSIZE;
    for i in 0..count {
        let old_pos = (symtab_offset + i * SYM_ENTSIZE) as usize;
        let st_shndx = LittleEndian::read_u16(&original[old_pos + 6..old_pos + 8]);
        let st_size = LittleEndian::read_u64(&original[old_pos + 16..old_pos + 24]);
        if st_shndx as usize == target_section && st_size == old_size {
            let new_pos = (new_symtab_offset + i * SYM_ENTSIZE) as usize;
            LittleEndian::write_u64(&mut out[new_pos + 16..new_pos + 24], new_size);
        }
    }
    Ok(())
}
