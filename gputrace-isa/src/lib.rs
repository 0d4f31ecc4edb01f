//! Machine-code instruction model for the gputrace profiler.
//!
//! This crate knows how to describe a GPU instruction set (opcode tables,
//! operand schemas, bit-range field maps), how to decode byte words into
//! typed [`Instruction`] values, and how to encode them back. The
//! descriptions come from per-family descriptor files loaded at startup;
//! nothing in this crate is specific to one architecture generation.
//!
//! Decoding and encoding go through the bit-field codec in [`bitfield`],
//! which understands non-contiguous bit ranges under either endian. The
//! analysis layers upstream (CFG construction, liveness, instrumentation)
//! talk to an architecture through the [`Arch`] capability trait;
//! [`MetadataArch`] is the implementation driven by the loaded metadata.

pub mod arch;
pub mod bitfield;
mod def;
mod error;
mod instruction;
mod schema;
mod set;
#[cfg(feature = "test-helpers")]
pub mod testing;

pub use arch::{Arch, BranchKind, MetadataArch};
pub use bitfield::{Endian, SortOrder};
pub use def::InstructionDef;
pub use error::Error;
pub use instruction::{Instruction, Modifier, Operand, OperandValue};
pub use schema::{
    AccessDir, ControlFlow, FieldAttr, MemoryOp, ModifierSchema, OperandKind, OperandSchema,
    RegClass,
};
pub use set::{FamilyDescriptor, InstructionSet};
