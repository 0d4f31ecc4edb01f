//! Decoded instruction instances and their operands.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bitfield;
use crate::def::InstructionDef;
use crate::error::Error;
use crate::schema::{ModifierSchema, OperandKind, OperandSchema, RegClass};

/// A decoded operand value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperandValue {
    Unsigned(u64),
    Signed(i64),
}

impl OperandValue {
    pub fn as_u64(self) -> u64 {
        match self {
            OperandValue::Unsigned(v) => v,
            OperandValue::Signed(v) => v as u64,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            OperandValue::Unsigned(v) => v as i64,
            OperandValue::Signed(v) => v,
        }
    }
}

/// One operand of an instruction instance.
///
/// `value` is the register index, immediate, or predicate index; memory
/// descriptors keep their base register index in `value` and their signed
/// displacement in `offset`. `valid` is false for operands of a fresh
/// shell and for operands whose bit ranges could not be read.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub schema: OperandSchema,
    pub value: OperandValue,
    pub offset: Option<i64>,
    pub valid: bool,
}

impl Operand {
    fn unset(schema: OperandSchema) -> Self {
        Operand {
            schema,
            value: OperandValue::Unsigned(0),
            offset: None,
            valid: false,
        }
    }

    pub fn render(&self) -> String {
        if !self.valid {
            return format!("<{}>", self.schema.name);
        }
        match &self.schema.kind {
            OperandKind::Register { class } => class.render(self.value.as_u64()),
            OperandKind::Predicate => RegClass::Predicate.render(self.value.as_u64()),
            OperandKind::Immediate { signed: true, .. } => format!("{}", self.value.as_i64()),
            OperandKind::Immediate { signed: false, .. } => {
                format!("{:#x}", self.value.as_u64())
            }
            OperandKind::Memory { base_class, .. } => {
                let base = base_class.render(self.value.as_u64());
                match self.offset.unwrap_or(0) {
                    0 => format!("[{base}]"),
                    off if off < 0 => format!("[{base}-{:#x}]", -off),
                    off => format!("[{base}+{off:#x}]"),
                }
            }
        }
    }
}

/// One modifier of an instruction instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Modifier {
    pub schema: ModifierSchema,
    pub value: u64,
}

impl Modifier {
    pub fn render(&self) -> Option<String> {
        match self.schema.value_names.get(self.value as usize) {
            Some(name) if name.is_empty() => None,
            Some(name) => Some(name.clone()),
            None if self.value == 0 => None,
            None => Some(format!("{}={}", self.schema.name, self.value)),
        }
    }
}

/// A decoded or constructed machine instruction.
///
/// `bytes` always holds an encodable word: decode keeps the original
/// word (including bits no field describes), and every mutation writes
/// its bits into the word in place. [`Instruction::encode`] instead
/// rebuilds a canonical word from the opcode and the tracked values.
#[derive(Debug, Clone)]
pub struct Instruction {
    def: Arc<InstructionDef>,
    pub bytes: Vec<u8>,
    operands: BTreeMap<String, Operand>,
    modifiers: BTreeMap<String, Modifier>,
    constraints: BTreeMap<String, u64>,
    reg_operands: BTreeMap<RegClass, BTreeSet<String>>,
    regs_in: BTreeMap<RegClass, BTreeSet<u64>>,
    regs_out: BTreeMap<RegClass, BTreeSet<u64>>,
}

/// Structural equality: same definition and the same decoded values.
/// Raw bytes are deliberately not compared, so a canonical re-encode of
/// a word with stray reserved bits still compares equal.
impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.def.name == other.def.name
            && self.operands == other.operands
            && self.modifiers == other.modifiers
            && self.constraints == other.constraints
    }
}

impl Instruction {
    pub(crate) fn decode(def: Arc<InstructionDef>, bytes: &[u8]) -> Result<Self, Error> {
        let mut instr = Instruction {
            bytes: bytes.to_vec(),
            operands: BTreeMap::new(),
            modifiers: BTreeMap::new(),
            constraints: BTreeMap::new(),
            reg_operands: BTreeMap::new(),
            regs_in: BTreeMap::new(),
            regs_out: BTreeMap::new(),
            def,
        };
        for schema in instr.def.operands.clone() {
            let operand = match Self::decode_operand(&instr.def, &schema, bytes) {
                Ok(operand) => operand,
                Err(e) => {
                    log::warn!(
                        "failed to decode operand {} of {}: {e}",
                        schema.name,
                        instr.def.name
                    );
                    Operand::unset(schema)
                }
            };
            instr.operands.insert(operand.schema.name.clone(), operand);
        }
        for schema in instr.def.modifiers.clone() {
            match instr.def.read_field(bytes, &schema.field) {
                Ok(value) => {
                    instr
                        .modifiers
                        .insert(schema.name.clone(), Modifier { schema, value });
                }
                Err(e) => {
                    log::warn!(
                        "failed to decode modifier {} of {}: {e}",
                        schema.name,
                        instr.def.name
                    );
                }
            }
        }
        instr.rebuild_register_sets();
        Ok(instr)
    }

    pub(crate) fn shell(def: Arc<InstructionDef>) -> Self {
        let bytes = def.opcode_bytes();
        let operands = def
            .operands
            .iter()
            .map(|schema| (schema.name.clone(), Operand::unset(schema.clone())))
            .collect();
        // Modifiers start at their zeroed-word value, matching the bytes.
        let modifiers = def
            .modifiers
            .iter()
            .map(|schema| {
                (
                    schema.name.clone(),
                    Modifier {
                        schema: schema.clone(),
                        value: 0,
                    },
                )
            })
            .collect();
        Instruction {
            bytes,
            operands,
            modifiers,
            constraints: BTreeMap::new(),
            reg_operands: BTreeMap::new(),
            regs_in: BTreeMap::new(),
            regs_out: BTreeMap::new(),
            def,
        }
    }

    fn decode_operand(
        def: &InstructionDef,
        schema: &OperandSchema,
        bytes: &[u8],
    ) -> Result<Operand, Error> {
        let primary = def.read_field(bytes, &schema.fields[0])?;
        let (value, offset) = match &schema.kind {
            OperandKind::Register { .. } | OperandKind::Predicate => {
                (OperandValue::Unsigned(primary), None)
            }
            OperandKind::Immediate { signed, .. } => {
                let bit_len = def.field(&schema.fields[0])?.bit_len();
                if *signed {
                    (
                        OperandValue::Signed(bitfield::sign_extend(primary, bit_len)),
                        None,
                    )
                } else {
                    (OperandValue::Unsigned(primary), None)
                }
            }
            OperandKind::Memory { .. } => {
                let offset_field = &schema.fields[1];
                let raw = def.read_field(bytes, offset_field)?;
                let bit_len = def.field(offset_field)?.bit_len();
                (
                    OperandValue::Unsigned(primary),
                    Some(bitfield::sign_extend(raw, bit_len)),
                )
            }
        };
        Ok(Operand {
            schema: schema.clone(),
            value,
            offset,
            valid: true,
        })
    }

    pub fn def(&self) -> &Arc<InstructionDef> {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Instruction size in bytes.
    pub fn size(&self) -> u64 {
        self.def.size as u64
    }

    pub fn operand(&self, name: &str) -> Option<&Operand> {
        self.operands.get(name)
    }

    pub fn modifier(&self, name: &str) -> Option<&Modifier> {
        self.modifiers.get(name)
    }

    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        // Schema order, not map order.
        self.def
            .operands
            .iter()
            .filter_map(|schema| self.operands.get(&schema.name))
    }

    /// The guard predicate register index, if this instruction has a
    /// guard operand.
    pub fn guard_predicate(&self) -> Option<u64> {
        self.operands
            .values()
            .find(|op| matches!(op.schema.kind, OperandKind::Predicate) && op.valid)
            .map(|op| op.value.as_u64())
    }

    fn operand_schema(&self, name: &str) -> Result<OperandSchema, Error> {
        self.def
            .operand(name)
            .cloned()
            .ok_or_else(|| Error::UnknownOperand {
                instr: self.def.name.clone(),
                operand: name.to_string(),
            })
    }

    fn store_operand(&mut self, schema: OperandSchema, value: OperandValue, offset: Option<i64>) {
        self.operands.insert(
            schema.name.clone(),
            Operand {
                schema,
                value,
                offset,
                valid: true,
            },
        );
        self.rebuild_register_sets();
    }

    pub fn set_operand_unsigned(&mut self, name: &str, value: u64) -> Result<(), Error> {
        let schema = self.operand_schema(name)?;
        if let Some(class) = schema.kind.reg_class() {
            if value > class.hardwired_index() {
                return Err(Error::RegisterOutOfRange {
                    class,
                    index: value,
                    max: class.hardwired_index(),
                });
            }
        }
        let def = self.def.clone();
        def.write_field(&mut self.bytes, &schema.fields[0], value)?;
        self.store_operand(schema, OperandValue::Unsigned(value), None);
        Ok(())
    }

    pub fn set_operand_signed(&mut self, name: &str, value: i64) -> Result<(), Error> {
        let schema = self.operand_schema(name)?;
        let def = self.def.clone();
        let field = &schema.fields[0];
        let bit_len = def.field(field)?.bit_len();
        if !bitfield::fits_in(value, bit_len, true) {
            return Err(Error::ValueOutOfRange {
                instr: def.name.clone(),
                field: field.clone(),
                value: value as u64,
                bits: bit_len,
            });
        }
        let truncated = (value as u64) & mask(bit_len);
        def.write_field(&mut self.bytes, field, truncated)?;
        self.store_operand(schema, OperandValue::Signed(value), None);
        Ok(())
    }

    /// Set a memory-descriptor operand: base register and signed
    /// displacement.
    pub fn set_memory_operand(&mut self, name: &str, base: u64, offset: i64) -> Result<(), Error> {
        let schema = self.operand_schema(name)?;
        let OperandKind::Memory { base_class, .. } = schema.kind else {
            return Err(Error::NotAMemoryOperand {
                instr: self.def.name.clone(),
                operand: name.to_string(),
            });
        };
        if base > base_class.hardwired_index() {
            return Err(Error::RegisterOutOfRange {
                class: base_class,
                index: base,
                max: base_class.hardwired_index(),
            });
        }
        let def = self.def.clone();
        let offset_field = &schema.fields[1];
        let bit_len = def.field(offset_field)?.bit_len();
        if !bitfield::fits_in(offset, bit_len, true) {
            return Err(Error::ValueOutOfRange {
                instr: def.name.clone(),
                field: offset_field.clone(),
                value: offset as u64,
                bits: bit_len,
            });
        }
        def.write_field(&mut self.bytes, &schema.fields[0], base)?;
        def.write_field(&mut self.bytes, offset_field, (offset as u64) & mask(bit_len))?;
        self.store_operand(schema, OperandValue::Unsigned(base), Some(offset));
        Ok(())
    }

    pub fn set_modifier(&mut self, name: &str, value: u64) -> Result<(), Error> {
        let schema = self
            .def
            .modifier(name)
            .cloned()
            .ok_or_else(|| Error::UnknownModifier {
                instr: self.def.name.clone(),
                modifier: name.to_string(),
            })?;
        let def = self.def.clone();
        def.write_field(&mut self.bytes, &schema.field, value)?;
        self.modifiers
            .insert(schema.name.clone(), Modifier { schema, value });
        Ok(())
    }

    /// Set a raw constraint field by label (fields not owned by an
    /// operand or a modifier, e.g. reuse flags).
    pub fn set_constraint_unsigned(&mut self, label: &str, value: u64) -> Result<(), Error> {
        let def = self.def.clone();
        def.write_field(&mut self.bytes, label, value)?;
        self.constraints.insert(label.to_string(), value);
        Ok(())
    }

    pub fn set_constraint_signed(&mut self, label: &str, value: i64) -> Result<(), Error> {
        let def = self.def.clone();
        let bit_len = def.field(label)?.bit_len();
        if !bitfield::fits_in(value, bit_len, true) {
            return Err(Error::ValueOutOfRange {
                instr: def.name.clone(),
                field: label.to_string(),
                value: value as u64,
                bits: bit_len,
            });
        }
        def.write_field(&mut self.bytes, label, (value as u64) & mask(bit_len))?;
        self.constraints.insert(label.to_string(), value as u64);
        Ok(())
    }

    /// Rebuild a canonical word from the opcode bytes and every tracked
    /// operand, modifier, and constraint. Unlike `bytes`, the result does
    /// not carry bits that no field describes.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = self.def.opcode_bytes();
        for operand in self.operands.values() {
            if !operand.valid {
                continue;
            }
            match &operand.schema.kind {
                OperandKind::Memory { .. } => {
                    self.def.write_field(
                        &mut bytes,
                        &operand.schema.fields[0],
                        operand.value.as_u64(),
                    )?;
                    let offset_field = &operand.schema.fields[1];
                    let bit_len = self.def.field(offset_field)?.bit_len();
                    self.def.write_field(
                        &mut bytes,
                        offset_field,
                        (operand.offset.unwrap_or(0) as u64) & mask(bit_len),
                    )?;
                }
                OperandKind::Immediate { signed: true, .. } => {
                    let field = &operand.schema.fields[0];
                    let bit_len = self.def.field(field)?.bit_len();
                    self.def.write_field(
                        &mut bytes,
                        field,
                        (operand.value.as_i64() as u64) & mask(bit_len),
                    )?;
                }
                _ => {
                    self.def.write_field(
                        &mut bytes,
                        &operand.schema.fields[0],
                        operand.value.as_u64(),
                    )?;
                }
            }
        }
        for modifier in self.modifiers.values() {
            self.def
                .write_field(&mut bytes, &modifier.schema.field, modifier.value)?;
        }
        for (label, value) in &self.constraints {
            self.def.write_field(&mut bytes, label, *value)?;
        }
        Ok(bytes)
    }

    /// Register indices read by this instruction, per class.
    pub fn regs_in(&self, class: RegClass) -> Option<&BTreeSet<u64>> {
        self.regs_in.get(&class)
    }

    /// Register indices written by this instruction, per class.
    pub fn regs_out(&self, class: RegClass) -> Option<&BTreeSet<u64>> {
        self.regs_out.get(&class)
    }

    /// Register-valued operands of the given class, in schema order.
    pub fn register_operands(&self, class: RegClass) -> impl Iterator<Item = &Operand> {
        let names = self.reg_operands.get(&class);
        self.def
            .operands
            .iter()
            .filter(move |schema| names.is_some_and(|set| set.contains(&schema.name)))
            .filter_map(|schema| self.operands.get(&schema.name))
    }

    fn rebuild_register_sets(&mut self) {
        self.reg_operands.clear();
        self.regs_in.clear();
        self.regs_out.clear();
        for operand in self.operands.values() {
            if !operand.valid {
                continue;
            }
            let Some(class) = operand.schema.kind.reg_class() else {
                continue;
            };
            self.reg_operands
                .entry(class)
                .or_default()
                .insert(operand.schema.name.clone());
            let index = operand.value.as_u64();
            // The hardwired zero/true register is not a live value.
            if index == class.hardwired_index() {
                continue;
            }
            match &operand.schema.kind {
                // The base register of a memory descriptor is read for
                // address generation no matter which way the data moves.
                OperandKind::Memory { .. } | OperandKind::Predicate => {
                    self.regs_in.entry(class).or_default().insert(index);
                }
                OperandKind::Register { .. } => {
                    if operand.schema.direction.reads() {
                        self.regs_in.entry(class).or_default().insert(index);
                    }
                    if operand.schema.direction.writes() {
                        self.regs_out.entry(class).or_default().insert(index);
                    }
                }
                OperandKind::Immediate { .. } => {}
            }
        }
    }
}

fn mask(bits: u64) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(guard) = self.guard_predicate() {
            if guard != RegClass::Predicate.hardwired_index() {
                write!(f, "@{} ", RegClass::Predicate.render(guard))?;
            }
        }
        write!(f, "{}", self.def.name)?;
        for schema in &self.def.modifiers {
            if let Some(modifier) = self.modifiers.get(&schema.name) {
                if let Some(rendered) = modifier.render() {
                    write!(f, ".{rendered}")?;
                }
            }
        }
        let mut first = true;
        for operand in self.operands() {
            if matches!(operand.schema.kind, OperandKind::Predicate) {
                continue;
            }
            if first {
                write!(f, " {}", operand.render())?;
                first = false;
            } else {
                write!(f, ", {}", operand.render())?;
            }
        }
        Ok(())
    }
}
