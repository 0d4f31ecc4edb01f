//! Kernel extraction and the parsed [`Kernel`] object.
//!
//! A kernel is located inside a machine image by its mangled symbol
//! name: its code lives in `.text.<name>`, its parameter records in
//! `.nv.info.<name>`, and its source-line mapping in the image's DWARF
//! line programs. The parsed object owns the typed instruction stream,
//! the control-flow graph, and lazily computed register liveness.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use gputrace_isa::{Arch, Instruction, RegClass};
use object::read::{Object, ObjectSection};

use crate::cfg::{self, BasicBlock, Cfg};
use crate::debug_line::{self, DebugInfo};
use crate::elf;
use crate::error::Error;
use crate::image::MachineImage;
use crate::liveness::{self, ClassLiveness, DefineUse, DefineUseCache};

/// Launch parameters live in the constant bank at this base offset.
pub const PARAM_BASE_OFFSET: u64 = 0x160;
/// Parameters align to their natural alignment, capped at this.
pub const MAX_PARAM_ALIGN: u64 = 8;

/// Attribute record formats in `.nv.info.<name>` sections.
const EIFMT_NVAL: u8 = 0x01;
const EIFMT_HVAL: u8 = 0x03;
const EIFMT_SVAL: u8 = 0x04;
/// The kernel-parameter attribute.
const EIATTR_KPARAM_INFO: u8 = 0x17;

/// One kernel parameter, as described by the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    pub ordinal: u16,
    pub offset: u16,
    pub size: u32,
}

/// Compute parameter offsets by natural-alignment packing.
///
/// Offsets start at [`PARAM_BASE_OFFSET`]; each parameter aligns to its
/// size rounded up to a power of two, capped at [`MAX_PARAM_ALIGN`]; the
/// end offset rounds up to the struct alignment. Returns the offsets and
/// the packed block size.
pub fn param_layout(sizes: &[u64]) -> (Vec<u64>, u64) {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut cursor = PARAM_BASE_OFFSET;
    let mut struct_align = 1u64;
    for &size in sizes {
        let align = size
            .max(1)
            .next_power_of_two()
            .min(MAX_PARAM_ALIGN);
        cursor = align_up(cursor, align);
        offsets.push(cursor);
        cursor += size;
        struct_align = struct_align.max(align);
    }
    let end = align_up(cursor, struct_align);
    (offsets, end - PARAM_BASE_OFFSET)
}

pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Parse the kernel-parameter records out of a `.nv.info.<name>`
/// section. Records are `(format, attr, u16)` headers; `SVAL` records
/// carry a payload of the given size, `NVAL`/`HVAL` records carry their
/// value inline.
pub fn parse_param_info(section_name: &str, bytes: &[u8]) -> Result<Vec<ParamInfo>, Error> {
    let mut params = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= bytes.len() {
        let format = bytes[offset];
        let attr = bytes[offset + 1];
        let value = LittleEndian::read_u16(&bytes[offset + 2..offset + 4]);
        offset += 4;

        let payload_size = match format {
            EIFMT_NVAL | EIFMT_HVAL => 0,
            EIFMT_SVAL => value as usize,
            _ => {
                return Err(Error::MalformedParamInfo {
                    section: section_name.to_string(),
                    reason: "unknown record format",
                })
            }
        };
        let Some(payload) = bytes.get(offset..offset + payload_size) else {
            return Err(Error::MalformedParamInfo {
                section: section_name.to_string(),
                reason: "record payload overruns the section",
            });
        };

        if attr == EIATTR_KPARAM_INFO {
            if payload.len() < 12 {
                return Err(Error::MalformedParamInfo {
                    section: section_name.to_string(),
                    reason: "parameter record shorter than 12 bytes",
                });
            }
            let ordinal = LittleEndian::read_u16(&payload[4..6]);
            let param_offset = LittleEndian::read_u16(&payload[6..8]);
            let packed = LittleEndian::read_u32(&payload[8..12]);
            params.push(ParamInfo {
                ordinal,
                offset: param_offset,
                size: (packed >> 18) & 0x3fff,
            });
        }
        offset += payload_size;
    }
    params.sort_by_key(|param| param.ordinal);
    Ok(params)
}

#[derive(Default)]
struct Analysis {
    liveness: HashMap<RegClass, ClassLiveness>,
    define_use: DefineUseCache,
}

/// A parsed GPU kernel.
pub struct Kernel {
    pub mangled_name: String,
    /// Architecture tag of the image the kernel came from.
    pub arch: String,
    /// Parameter sizes in declaration order, and the reversed copies the
    /// launch marshaller consumes.
    pub param_sizes: Vec<u64>,
    pub param_offsets: Vec<u64>,
    pub param_sizes_reversed: Vec<u64>,
    pub param_offsets_reversed: Vec<u64>,
    /// Packed size of the launch-parameter block.
    pub param_block_size: u64,
    pub instructions: Vec<Instruction>,
    pcs: Vec<u64>,
    pc_to_index: BTreeMap<u64, usize>,
    cfg: Cfg,
    /// The kernel's machine-code bytes (`.text.<name>` contents).
    pub raw_bytes: Vec<u8>,
    /// File offset of the text section within the image.
    pub text_offset: u64,
    pub debug: DebugInfo,
    analysis: Mutex<Analysis>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("mangled_name", &self.mangled_name)
            .field("arch", &self.arch)
            .field("instructions", &self.instructions.len())
            .field("blocks", &self.cfg.blocks.len())
            .finish()
    }
}

impl Kernel {
    /// Locate and parse one kernel of a machine image.
    pub fn extract(
        image: &MachineImage,
        mangled_name: &str,
        arch: &dyn Arch,
    ) -> Result<Kernel, Error> {
        let file = elf::parse_object(&image.bytes)?;
        if !elf::has_symbol(&file, mangled_name) {
            return Err(Error::SymbolNotFound(mangled_name.to_string()));
        }

        let text_name = format!(".text.{mangled_name}");
        let raw_bytes = elf::section_bytes(&file, &text_name)?.to_vec();
        let (text_offset, _) = elf::section_file_range(&file, &text_name)?;

        let word = arch.word_size();
        if raw_bytes.len() as u64 % word != 0 {
            return Err(Error::RaggedCodeSize {
                size: raw_bytes.len() as u64,
                word,
            });
        }

        let mut instructions = Vec::with_capacity(raw_bytes.len() / word as usize);
        for chunk in raw_bytes.chunks_exact(word as usize) {
            instructions.push(arch.decode_one(chunk)?);
        }

        let cfg = cfg::build_cfg(&instructions, arch)?;

        // Parameter metadata is optional; kernels without parameters have
        // no records.
        let info_name = format!(".nv.info.{mangled_name}");
        let params = match elf::section_bytes(&file, &info_name) {
            Ok(bytes) => parse_param_info(&info_name, bytes)?,
            Err(Error::SectionNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let param_sizes: Vec<u64> = params.iter().map(|param| param.size as u64).collect();
        let (param_offsets, param_block_size) = param_layout(&param_sizes);

        // Debug line info is optional too.
        let debug = {
            let section = file.section_by_name(&text_name);
            let text_address = section.as_ref().map(|s| s.address()).unwrap_or(0);
            match debug_line::line_rows(&file, text_address, raw_bytes.len() as u64) {
                Ok(rows) => debug_line::build_debug_info(&rows, word),
                Err(e) => {
                    log::warn!("failed to read line programs for {mangled_name}: {e}");
                    DebugInfo::default()
                }
            }
        };

        let mut pcs = Vec::with_capacity(instructions.len());
        let mut pc_to_index = BTreeMap::new();
        let mut pc = 0u64;
        for (index, instr) in instructions.iter().enumerate() {
            pcs.push(pc);
            pc_to_index.insert(pc, index);
            pc += instr.size();
        }

        log::debug!(
            "extracted kernel {mangled_name}: arch({}), {} instructions, {} blocks, {} params",
            image.arch,
            instructions.len(),
            cfg.blocks.len(),
            param_sizes.len()
        );

        Ok(Kernel {
            mangled_name: mangled_name.to_string(),
            arch: image.arch.clone(),
            param_sizes_reversed: param_sizes.iter().rev().copied().collect(),
            param_offsets_reversed: param_offsets.iter().rev().copied().collect(),
            param_sizes,
            param_offsets,
            param_block_size,
            instructions,
            pcs,
            pc_to_index,
            cfg,
            raw_bytes,
            text_offset,
            debug,
            analysis: Mutex::new(Analysis::default()),
        })
    }

    /// Parse every kernel defined by the image.
    pub fn extract_all(image: &MachineImage, arch: &dyn Arch) -> Result<Vec<Kernel>, Error> {
        let file = elf::parse_object(&image.bytes)?;
        let names = elf::function_symbol_names(&file);
        drop(file);
        let mut kernels = Vec::with_capacity(names.len());
        for name in names {
            match Kernel::extract(image, &name, arch) {
                Ok(kernel) => kernels.push(kernel),
                Err(e) => log::warn!("skipping kernel {name}: {e}"),
            }
        }
        Ok(kernels)
    }

    pub fn code_size(&self) -> u64 {
        self.raw_bytes.len() as u64
    }

    pub fn word_size(&self) -> u64 {
        self.instructions.first().map(|i| i.size()).unwrap_or(16)
    }

    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    pub fn pc_of(&self, index: usize) -> u64 {
        self.pcs[index]
    }

    pub fn instruction_at(&self, pc: u64) -> Option<&Instruction> {
        self.pc_to_index
            .get(&pc)
            .map(|&index| &self.instructions[index])
    }

    pub fn instruction_index_at(&self, pc: u64) -> Option<usize> {
        self.pc_to_index.get(&pc).copied()
    }

    pub fn block_at(&self, pc: u64) -> Result<&BasicBlock, Error> {
        self.cfg.block_at(pc).ok_or_else(|| Error::NoBlockAtPc {
            name: self.mangled_name.clone(),
            pc,
        })
    }

    /// Every register index of `class` the kernel touches.
    pub fn used_registers(&self, class: RegClass) -> BTreeSet<u64> {
        let mut used = BTreeSet::new();
        for instr in &self.instructions {
            if let Some(reads) = instr.regs_in(class) {
                used.extend(reads.iter().copied());
            }
            if let Some(writes) = instr.regs_out(class) {
                used.extend(writes.iter().copied());
            }
        }
        used
    }

    fn ensure_liveness<'a>(
        &self,
        analysis: &'a mut Analysis,
        class: RegClass,
    ) -> &'a ClassLiveness {
        analysis
            .liveness
            .entry(class)
            .or_insert_with(|| liveness::compute_liveness(&self.cfg, &self.instructions, class))
    }

    /// Live-in set of the block containing `pc`. Computed on first use
    /// and cached; the fill is idempotent.
    pub fn live_in(&self, block_id: usize, class: RegClass) -> BTreeSet<u64> {
        let mut analysis = self.analysis.lock().unwrap();
        self.ensure_liveness(&mut analysis, class).live_in[block_id].clone()
    }

    pub fn live_out(&self, block_id: usize, class: RegClass) -> BTreeSet<u64> {
        let mut analysis = self.analysis.lock().unwrap();
        self.ensure_liveness(&mut analysis, class).live_out[block_id].clone()
    }

    /// Define/use of the block containing `base_pc`, scanning from
    /// `base_pc` to the block end.
    pub fn define_use_from(&self, base_pc: u64, class: RegClass) -> Result<DefineUse, Error> {
        let block_id = self.block_at(base_pc)?.id as usize;
        let mut analysis = self.analysis.lock().unwrap();
        analysis
            .define_use
            .define_use(&self.cfg, &self.instructions, block_id, base_pc, class)
            .cloned()
    }

    /// Registers of `class` live anywhere across `[start_pc, end_pc]`.
    pub fn live_across(&self, start_pc: u64, end_pc: u64, class: RegClass) -> BTreeSet<u64> {
        let mut analysis = self.analysis.lock().unwrap();
        let liveness = self.ensure_liveness(&mut analysis, class).clone();
        liveness::live_across(
            &self.cfg,
            &self.instructions,
            &liveness,
            class,
            start_pc,
            end_pc,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_alignment_packing() {
        // (u64, u32, u32, struct of 12) at the parameter base.
        let (offsets, total) = param_layout(&[8, 4, 4, 12]);
        assert_eq!(
            offsets,
            vec![
                PARAM_BASE_OFFSET,
                PARAM_BASE_OFFSET + 8,
                PARAM_BASE_OFFSET + 12,
                PARAM_BASE_OFFSET + 16,
            ]
        );
        // 16 + 12 = 28, rounded to the struct alignment of 8.
        assert_eq!(total, 32);
    }

    #[test]
    fn packing_inserts_padding_for_alignment() {
        let (offsets, total) = param_layout(&[4, 8, 1, 2]);
        assert_eq!(
            offsets,
            vec![
                PARAM_BASE_OFFSET,
                PARAM_BASE_OFFSET + 8,
                PARAM_BASE_OFFSET + 16,
                PARAM_BASE_OFFSET + 18,
            ]
        );
        assert_eq!(total, 24);
    }

    #[test]
    fn empty_parameter_list() {
        let (offsets, total) = param_layout(&[]);
        assert!(offsets.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn param_records_parse_and_sort_by_ordinal() {
        // Two SVAL KPARAM_INFO records, deliberately out of order, with
        // an HVAL record in between that must be skipped.
        fn push_param(section: &mut Vec<u8>, ordinal: u16, offset: u16, size: u32) {
            section.extend_from_slice(&[EIFMT_SVAL, EIATTR_KPARAM_INFO]);
            section.extend_from_slice(&12u16.to_le_bytes());
            section.extend_from_slice(&0u32.to_le_bytes());
            section.extend_from_slice(&ordinal.to_le_bytes());
            section.extend_from_slice(&offset.to_le_bytes());
            section.extend_from_slice(&(size << 18).to_le_bytes());
        }
        let mut section = Vec::new();
        push_param(&mut section, 1, 8, 8);
        section.extend_from_slice(&[EIFMT_HVAL, 0x1b]);
        section.extend_from_slice(&255u16.to_le_bytes());
        push_param(&mut section, 0, 0, 4);

        let params = parse_param_info(".nv.info.k", &section).unwrap();
        assert_eq!(
            params,
            vec![
                ParamInfo {
                    ordinal: 0,
                    offset: 0,
                    size: 4
                },
                ParamInfo {
                    ordinal: 1,
                    offset: 8,
                    size: 8
                },
            ]
        );
    }

    #[test]
    fn truncated_param_record_is_rejected() {
        let mut section = Vec::new();
        section.extend_from_slice(&[EIFMT_SVAL, EIATTR_KPARAM_INFO]);
        section.extend_from_slice(&12u16.to_le_bytes());
        section.extend_from_slice(&[0u8; 4]);
        assert!(matches!(
            parse_param_info(".nv.info.k", &section),
            Err(Error::MalformedParamInfo { .. })
        ));
    }
}
