//! Instruction definitions: the per-opcode entries of an instruction set.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bitfield::{self, Endian, SortOrder};
use crate::error::Error;
use crate::instruction::Instruction;
use crate::schema::{ControlFlow, FieldAttr, MemoryOp, ModifierSchema, OperandSchema};

/// Definition of one machine instruction: its opcode, its size, and the
/// schemas and bit locations of everything that can be encoded into it.
///
/// Definitions are immutable once the containing [`crate::InstructionSet`]
/// has been built, and are shared via `Arc` by every decoded
/// [`Instruction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionDef {
    pub name: String,
    /// Instruction size in bytes.
    pub size: u32,
    pub endian: Endian,
    /// Opcode value, and the bit ranges it occupies.
    pub opcode: u64,
    pub opcode_ranges: Vec<(u64, u64)>,
    /// Additional field/value pairs disambiguating definitions that share
    /// the opcode. Decoding picks the candidate whose discriminators all
    /// match; the most discriminated candidate wins.
    #[serde(default)]
    pub discriminators: Vec<(String, u64)>,
    pub operands: Vec<OperandSchema>,
    #[serde(default)]
    pub modifiers: Vec<ModifierSchema>,
    /// Field label -> bit ranges within the instruction word.
    pub fields: BTreeMap<String, FieldAttr>,
    #[serde(default)]
    pub control_flow: ControlFlow,
    #[serde(default)]
    pub memory_op: MemoryOp,
    /// Name of the operand carrying the branch displacement, for
    /// control-flow definitions with an encoded target.
    #[serde(default)]
    pub target_operand: Option<String>,
}

impl InstructionDef {
    pub fn word_bits(&self) -> u64 {
        self.size as u64 * 8
    }

    /// Check the definition invariants: every referenced field label
    /// exists, and no two bit ranges overlap anywhere in the word.
    pub fn validate(&self) -> Result<(), Error> {
        for schema in &self.operands {
            let wanted_fields = match schema.kind {
                crate::schema::OperandKind::Memory { .. } => 2,
                _ => 1,
            };
            if schema.fields.len() != wanted_fields {
                return Err(Error::MalformedOperandSchema {
                    instr: self.name.clone(),
                    operand: schema.name.clone(),
                    got: schema.fields.len(),
                    want: wanted_fields,
                });
            }
            for label in &schema.fields {
                self.field(label)?;
            }
        }
        for schema in &self.modifiers {
            self.field(&schema.field)?;
        }
        for (label, _) in &self.discriminators {
            self.field(label)?;
        }

        let mut ranges: Vec<(u64, u64)> = self.opcode_ranges.clone();
        for attr in self.fields.values() {
            ranges.extend_from_slice(&attr.ranges);
        }
        for range in &mut ranges {
            *range = (range.0.min(range.1), range.0.max(range.1));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 >= pair[1].0 {
                return Err(Error::OverlappingFields {
                    name: self.name.clone(),
                    a: pair[0],
                    b: pair[1],
                });
            }
        }
        Ok(())
    }

    pub fn operand(&self, name: &str) -> Option<&OperandSchema> {
        self.operands.iter().find(|schema| schema.name == name)
    }

    pub fn modifier(&self, name: &str) -> Option<&ModifierSchema> {
        self.modifiers.iter().find(|schema| schema.name == name)
    }

    pub fn field(&self, label: &str) -> Result<&FieldAttr, Error> {
        self.fields.get(label).ok_or_else(|| Error::UnknownField {
            instr: self.name.clone(),
            field: label.to_string(),
        })
    }

    /// The base byte pattern of this instruction: a zeroed word with the
    /// opcode and all discriminator fields set.
    pub fn opcode_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size as usize];
        let opcode_bits =
            bitfield::u64_to_bits(self.opcode, bitfield::ranges_bit_count(&self.opcode_ranges));
        // Infallible on a well-formed definition.
        let _ = bitfield::set_ranges(
            &mut bytes,
            &self.opcode_ranges,
            self.word_bits(),
            &opcode_bits,
            self.endian,
            SortOrder::Ascending,
        );
        for (label, value) in &self.discriminators {
            if let Ok(attr) = self.field(label) {
                let bits = bitfield::u64_to_bits(*value, attr.bit_len());
                let _ = bitfield::set_ranges(
                    &mut bytes,
                    &attr.ranges,
                    self.word_bits(),
                    &bits,
                    self.endian,
                    SortOrder::Ascending,
                );
            }
        }
        bytes
    }

    /// Read one field of an instruction word as an unsigned value.
    pub fn read_field(&self, bytes: &[u8], label: &str) -> Result<u64, Error> {
        let attr = self.field(label)?;
        let bits = bitfield::extract_ranges(
            bytes,
            &attr.ranges,
            self.word_bits(),
            self.endian,
            SortOrder::Ascending,
        )?;
        Ok(bitfield::bits_to_u64(&bits))
    }

    /// Write one field of an instruction word.
    pub fn write_field(&self, bytes: &mut [u8], label: &str, value: u64) -> Result<(), Error> {
        let attr = self.field(label)?;
        let bit_len = attr.bit_len();
        if bit_len < 64 && value >= (1u64 << bit_len) {
            return Err(Error::ValueOutOfRange {
                instr: self.name.clone(),
                field: label.to_string(),
                value,
                bits: bit_len,
            });
        }
        let bits = bitfield::u64_to_bits(value, bit_len);
        bitfield::set_ranges(
            bytes,
            &attr.ranges,
            self.word_bits(),
            &bits,
            self.endian,
            SortOrder::Ascending,
        )
    }

    /// Whether the given word carries this definition's opcode and all of
    /// its discriminators.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        if bytes.len() < self.size as usize {
            return false;
        }
        let opcode_bits = match bitfield::extract_ranges(
            bytes,
            &self.opcode_ranges,
            self.word_bits(),
            self.endian,
            SortOrder::Ascending,
        ) {
            Ok(bits) => bits,
            Err(_) => return false,
        };
        if bitfield::bits_to_u64(&opcode_bits) != self.opcode {
            return false;
        }
        self.discriminators
            .iter()
            .all(|(label, value)| matches!(self.read_field(bytes, label), Ok(v) if v == *value))
    }

    /// Decode an instruction instance from a full word. Individual
    /// malformed operands are reported and marked invalid; they do not
    /// abort the instruction.
    pub fn disassemble(self: &Arc<Self>, bytes: &[u8]) -> Result<Instruction, Error> {
        if bytes.len() != self.size as usize {
            return Err(Error::WrongWordSize {
                name: self.name.clone(),
                got: bytes.len(),
                want: self.size as usize,
            });
        }
        Instruction::decode(self.clone(), bytes)
    }

    /// Create an empty instance of this instruction: the opcode word with
    /// every operand present but unset.
    pub fn shell(self: &Arc<Self>) -> Instruction {
        Instruction::shell(self.clone())
    }
}
