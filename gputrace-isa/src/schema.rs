//! Schema types for ISA metadata: register classes, operand and modifier
//! descriptions, and the bit-range field table each instruction definition
//! carries. These are deserialized from the per-family descriptor files
//! and are immutable once an [`crate::InstructionSet`] has been built.

use serde::{Deserialize, Serialize};

/// A register file. Each class has its own index space; the highest index
/// of every class is the hardwired zero/true register and is never
/// allocatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegClass {
    General,
    Predicate,
    Uniform,
    UniformPredicate,
}

impl RegClass {
    pub const ALL: [RegClass; 4] = [
        RegClass::General,
        RegClass::Predicate,
        RegClass::Uniform,
        RegClass::UniformPredicate,
    ];

    /// Index of the hardwired register of this class (RZ / PT / URZ / UPT).
    pub fn hardwired_index(self) -> u64 {
        match self {
            RegClass::General => 255,
            RegClass::Predicate => 7,
            RegClass::Uniform => 63,
            RegClass::UniformPredicate => 7,
        }
    }

    /// Largest index the allocator may hand out.
    pub fn max_alloc_index(self) -> u64 {
        self.hardwired_index() - 1
    }

    pub fn prefix(self) -> &'static str {
        match self {
            RegClass::General => "R",
            RegClass::Predicate => "P",
            RegClass::Uniform => "UR",
            RegClass::UniformPredicate => "UP",
        }
    }

    /// Render a register of this class, using the hardwired name for the
    /// top index.
    pub fn render(self, index: u64) -> String {
        if index == self.hardwired_index() {
            match self {
                RegClass::General => "RZ".into(),
                RegClass::Predicate => "PT".into(),
                RegClass::Uniform => "URZ".into(),
                RegClass::UniformPredicate => "UPT".into(),
            }
        } else {
            format!("{}{}", self.prefix(), index)
        }
    }
}

/// Direction of an operand access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessDir {
    Read,
    Write,
    ReadWrite,
    #[default]
    None,
}

impl AccessDir {
    pub fn reads(self) -> bool {
        matches!(self, AccessDir::Read | AccessDir::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessDir::Write | AccessDir::ReadWrite)
    }
}

/// What an operand is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OperandKind {
    /// A register of the given class.
    Register { class: RegClass },
    /// An immediate of the given bit width, sign-extended if `signed`.
    Immediate { signed: bool, bits: u32 },
    /// A memory descriptor: a base register plus a signed displacement.
    /// The schema's field list names the base field first, then the
    /// displacement field.
    Memory { base_class: RegClass, offset_bits: u32 },
    /// A guard predicate. Reads a register of the predicate class; the
    /// hardwired true register makes the instruction unconditional.
    Predicate,
}

impl OperandKind {
    /// Register class this operand contributes to, if any.
    pub fn reg_class(&self) -> Option<RegClass> {
        match self {
            OperandKind::Register { class } => Some(*class),
            OperandKind::Memory { base_class, .. } => Some(*base_class),
            OperandKind::Predicate => Some(RegClass::Predicate),
            OperandKind::Immediate { .. } => None,
        }
    }
}

/// Description of one operand slot of an instruction definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandSchema {
    pub name: String,
    #[serde(flatten)]
    pub kind: OperandKind,
    #[serde(default)]
    pub direction: AccessDir,
    /// Field labels consumed by this operand, in sub-operand order: one
    /// for registers/immediates/predicates, base then displacement for
    /// memory descriptors.
    pub fields: Vec<String>,
}

/// Description of one modifier (a small unsigned flag/selector field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierSchema {
    pub name: String,
    /// Field label holding the modifier bits.
    pub field: String,
    /// Symbolic names for modifier values, used for rendering; index is
    /// the encoded value.
    #[serde(default)]
    pub value_names: Vec<String>,
}

/// Where a value lives in the instruction word: an ordered list of
/// inclusive `[lo, hi]` bit ranges. Multi-range fields are packed
/// low-range-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAttr {
    pub ranges: Vec<(u64, u64)>,
}

impl FieldAttr {
    pub fn new(ranges: Vec<(u64, u64)>) -> Self {
        FieldAttr { ranges }
    }

    /// Total number of bits covered by this field.
    pub fn bit_len(&self) -> u64 {
        crate::bitfield::ranges_bit_count(&self.ranges)
    }
}

/// Control-flow class of an instruction definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlFlow {
    #[default]
    None,
    /// A branch; conditionality is a per-instance property of the guard
    /// predicate.
    Branch,
    Call,
    Ret,
    Exit,
}

/// Memory behavior of an instruction definition, as far as the tracer
/// cares: whether it loads from or stores to device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOp {
    #[default]
    None,
    Load,
    Store,
    Atomic,
}
