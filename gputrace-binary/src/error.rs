use thiserror::Error;

/// The error type used in this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Blob is too small to carry a {0} header")]
    TruncatedHeader(&'static str),

    #[error("Unrecognized blob: no container magic, ELF magic, or IR text")]
    UnrecognizedBlob,

    #[error("Fat container entry at offset {offset:#x} overruns the container (size {size:#x})")]
    EntryOutOfBounds { offset: u64, size: u64 },

    #[error("Fat container entry has unknown kind {kind}")]
    UnknownEntryKind { kind: u16 },

    #[error("LZ4 segment inflated to {got} bytes, the entry header promised {want}")]
    DecompressedSizeMismatch { got: u64, want: u64 },

    #[error("Invalid ELF image: {0}")]
    InvalidElf(&'static str),

    #[error("Object could not parse the image: {0}")]
    ObjectParseError(#[source] object::read::Error),

    #[error("No symbol named {0} in the image")]
    SymbolNotFound(String),

    #[error("No section named {0} in the image")]
    SectionNotFound(String),

    #[error("Kernel {name} has no instruction at pc {pc:#x}")]
    NoInstructionAtPc { name: String, pc: u64 },

    #[error("Branch at pc {from_pc:#x} targets pc {to_pc:#x} outside the kernel code range")]
    BranchTargetOutOfRange { from_pc: u64, to_pc: u64 },

    #[error("Block leader pc {pc:#x} falls inside a multi-byte instruction")]
    LeaderInsideInstruction { pc: u64 },

    #[error("Kernel {name} has no basic block at pc {pc:#x}")]
    NoBlockAtPc { name: String, pc: u64 },

    #[error("Malformed kernel-parameter record in {section}: {reason}")]
    MalformedParamInfo {
        section: String,
        reason: &'static str,
    },

    #[error("DWARF line program error: {0}")]
    DwarfError(#[from] gimli::Error),

    #[error("Instruction stream error: {0}")]
    Isa(#[from] gputrace_isa::Error),

    #[error("Kernel code size {size:#x} is not a multiple of the {word:#x}-byte instruction word")]
    RaggedCodeSize { size: u64, word: u64 },

    #[error("Section {section} rewrite would overflow its file layout: {reason}")]
    EmitLayout {
        section: String,
        reason: &'static str,
    },
}

impl Error {
    /// A compact name for the error variant, for event metadata.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Error::TruncatedHeader(_) => "TruncatedHeader",
            Error::UnrecognizedBlob => "UnrecognizedBlob",
            Error::EntryOutOfBounds { .. } => "EntryOutOfBounds",
            Error::UnknownEntryKind { .. } => "UnknownEntryKind",
            Error::DecompressedSizeMismatch { .. } => "DecompressedSizeMismatch",
            Error::InvalidElf(_) => "InvalidElf",
            Error::ObjectParseError(_) => "ObjectParseError",
            Error::SymbolNotFound(_) => "SymbolNotFound",
            Error::SectionNotFound(_) => "SectionNotFound",
            Error::NoInstructionAtPc { .. } => "NoInstructionAtPc",
            Error::BranchTargetOutOfRange { .. } => "BranchTargetOutOfRange",
            Error::LeaderInsideInstruction { .. } => "LeaderInsideInstruction",
            Error::NoBlockAtPc { .. } => "NoBlockAtPc",
            Error::MalformedParamInfo { .. } => "MalformedParamInfo",
            Error::DwarfError(_) => "DwarfError",
            Error::Isa(_) => "Isa",
            Error::RaggedCodeSize { .. } => "RaggedCodeSize",
            Error::EmitLayout { .. } => "EmitLayout",
        }
    }
}
