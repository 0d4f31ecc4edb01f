use thiserror::Error;

use crate::schema::RegClass;

/// The error type used in this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid bit range [{lo}, {hi}] for a {word_bits}-bit word")]
    InvalidBitRange { lo: u64, hi: u64, word_bits: u64 },

    #[error("Empty bit range list")]
    EmptyBitRanges,

    #[error("Value of {value_bits} bits is too short for a range of {range_bits} bits")]
    ValueTooShort { value_bits: u64, range_bits: u64 },

    #[error("Instruction word has {got} bytes, the definition {name} wants {want}")]
    WrongWordSize { name: String, got: usize, want: usize },

    #[error("Unknown instruction name: {0}")]
    UnknownInstruction(String),

    #[error("No instruction definition matches opcode {opcode:#x}")]
    UnknownOpcode { opcode: u64 },

    #[error("Instruction {instr} has no operand named {operand}")]
    UnknownOperand { instr: String, operand: String },

    #[error("Instruction {instr} has no modifier named {modifier}")]
    UnknownModifier { instr: String, modifier: String },

    #[error("Instruction {instr} has no field labeled {field}")]
    UnknownField { instr: String, field: String },

    #[error("Operand {operand} of {instr} is not a memory descriptor")]
    NotAMemoryOperand { instr: String, operand: String },

    #[error("Value {value:#x} does not fit in the {bits}-bit field {field} of {instr}")]
    ValueOutOfRange {
        instr: String,
        field: String,
        value: u64,
        bits: u64,
    },

    #[error("Register index {index} exceeds the {class:?} register file (max {max})")]
    RegisterOutOfRange {
        class: RegClass,
        index: u64,
        max: u64,
    },

    #[error("Operand {operand} of {instr} names {got} field(s), its kind wants {want}")]
    MalformedOperandSchema {
        instr: String,
        operand: String,
        got: usize,
        want: usize,
    },

    #[error("Overlapping bit ranges in definition {name}: {a:?} and {b:?}")]
    OverlappingFields {
        name: String,
        a: (u64, u64),
        b: (u64, u64),
    },

    #[error("All definitions of one instruction set must share the opcode bit ranges; {name} deviates")]
    InconsistentOpcodeField { name: String },

    #[error("Instruction set has no definitions")]
    EmptyInstructionSet,

    #[error("Relative branch displacement {displacement} does not fit in the target field of {instr}")]
    DisplacementOverflow { instr: String, displacement: i64 },

    #[error("Could not read ISA descriptor {path}: {source}")]
    DescriptorIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse ISA descriptor {path}: {source}")]
    DescriptorParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// A compact name for the error variant, for event metadata.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Error::InvalidBitRange { .. } => "InvalidBitRange",
            Error::EmptyBitRanges => "EmptyBitRanges",
            Error::ValueTooShort { .. } => "ValueTooShort",
            Error::WrongWordSize { .. } => "WrongWordSize",
            Error::UnknownInstruction(_) => "UnknownInstruction",
            Error::UnknownOpcode { .. } => "UnknownOpcode",
            Error::UnknownOperand { .. } => "UnknownOperand",
            Error::UnknownModifier { .. } => "UnknownModifier",
            Error::UnknownField { .. } => "UnknownField",
            Error::NotAMemoryOperand { .. } => "NotAMemoryOperand",
            Error::ValueOutOfRange { .. } => "ValueOutOfRange",
            Error::RegisterOutOfRange { .. } => "RegisterOutOfRange",
            Error::MalformedOperandSchema { .. } => "MalformedOperandSchema",
            Error::OverlappingFields { .. } => "OverlappingFields",
            Error::InconsistentOpcodeField { .. } => "InconsistentOpcodeField",
            Error::EmptyInstructionSet => "EmptyInstructionSet",
            Error::DisplacementOverflow { .. } => "DisplacementOverflow",
            Error::DescriptorIo { .. } => "DescriptorIo",
            Error::DescriptorParse { .. } => "DescriptorParse",
        }
    }
}
