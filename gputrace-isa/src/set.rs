//! The instruction set: every definition of one architecture family,
//! indexed for decoding and for construction by name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bitfield::{self, Endian, SortOrder};
use crate::def::InstructionDef;
use crate::error::Error;
use crate::instruction::Instruction;

/// On-disk shape of one descriptor file: a family of instruction
/// definitions sharing one word size and endian.
#[derive(Debug, Serialize, Deserialize)]
pub struct FamilyDescriptor {
    pub family: String,
    pub instructions: Vec<InstructionDef>,
}

/// An immutable set of instruction definitions for one architecture.
///
/// Lookup is by name (unique) or by opcode (a multimap: families share
/// opcode bits and are disambiguated by discriminator fields). The set is
/// built once at startup and shared read-only across threads.
#[derive(Debug)]
pub struct InstructionSet {
    arch: String,
    word_size: u32,
    endian: Endian,
    opcode_ranges: Vec<(u64, u64)>,
    defs: Vec<Arc<InstructionDef>>,
    by_name: HashMap<String, usize>,
    by_opcode: HashMap<u64, Vec<usize>>,
}

impl InstructionSet {
    /// Build a set from definitions. Validates each definition and the
    /// set-wide invariants: one word size, one endian, one opcode field
    /// position, unique names.
    pub fn from_defs(arch: &str, defs: Vec<InstructionDef>) -> Result<Self, Error> {
        let first = defs.first().ok_or(Error::EmptyInstructionSet)?;
        let word_size = first.size;
        let endian = first.endian;
        let opcode_ranges = first.opcode_ranges.clone();

        let mut set = InstructionSet {
            arch: arch.to_string(),
            word_size,
            endian,
            opcode_ranges,
            defs: Vec::with_capacity(defs.len()),
            by_name: HashMap::new(),
            by_opcode: HashMap::new(),
        };
        for def in defs {
            def.validate()?;
            if def.size != word_size
                || def.endian != endian
                || def.opcode_ranges != set.opcode_ranges
            {
                return Err(Error::InconsistentOpcodeField {
                    name: def.name.clone(),
                });
            }
            let index = set.defs.len();
            if set.by_name.insert(def.name.clone(), index).is_some() {
                log::warn!("duplicate instruction definition {}, keeping the last", def.name);
            }
            set.by_opcode.entry(def.opcode).or_default().push(index);
            set.defs.push(Arc::new(def));
        }
        Ok(set)
    }

    /// Load every `*.json` descriptor file in a directory. Files are
    /// visited in name order so the set layout is reproducible.
    pub fn load_dir(arch: &str, dir: &Path) -> Result<Self, Error> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| Error::DescriptorIo {
                path: dir.display().to_string(),
                source: e,
            })?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut defs = Vec::new();
        for path in paths {
            let text = std::fs::read_to_string(&path).map_err(|e| Error::DescriptorIo {
                path: path.display().to_string(),
                source: e,
            })?;
            let family: FamilyDescriptor =
                serde_json::from_str(&text).map_err(|e| Error::DescriptorParse {
                    path: path.display().to_string(),
                    source: e,
                })?;
            log::debug!(
                "loaded ISA family {} ({} definitions) from {}",
                family.family,
                family.instructions.len(),
                path.display()
            );
            defs.extend(family.instructions);
        }
        Self::from_defs(arch, defs)
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Instruction word size in bytes. Uniform across the set.
    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn defs(&self) -> impl Iterator<Item = &Arc<InstructionDef>> {
        self.defs.iter()
    }

    pub fn def_by_name(&self, name: &str) -> Option<&Arc<InstructionDef>> {
        self.by_name.get(name).map(|&index| &self.defs[index])
    }

    /// All definitions sharing an opcode value.
    pub fn defs_by_opcode(&self, opcode: u64) -> &[usize] {
        self.by_opcode
            .get(&opcode)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Decode one instruction word. Candidates are the definitions with
    /// the word's opcode; among those whose discriminators all match, the
    /// most discriminated one wins.
    pub fn decode(&self, bytes: &[u8]) -> Result<Instruction, Error> {
        let word_bits = self.word_size as u64 * 8;
        let opcode_bits = bitfield::extract_ranges(
            bytes,
            &self.opcode_ranges,
            word_bits,
            self.endian,
            SortOrder::Ascending,
        )?;
        let opcode = bitfield::bits_to_u64(&opcode_bits);

        let best = self
            .defs_by_opcode(opcode)
            .iter()
            .map(|&index| &self.defs[index])
            .filter(|def| def.matches(bytes))
            .max_by_key(|def| def.discriminators.len())
            .ok_or(Error::UnknownOpcode { opcode })?;
        best.disassemble(bytes)
    }

    /// Create an empty instance of the named instruction.
    pub fn shell(&self, name: &str) -> Result<Instruction, Error> {
        let def = self
            .def_by_name(name)
            .ok_or_else(|| Error::UnknownInstruction(name.to_string()))?;
        Ok(def.shell())
    }
}
