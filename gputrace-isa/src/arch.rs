//! The per-architecture capability seam.
//!
//! The disassembler, CFG builder, and instrumentation engine are generic
//! over [`Arch`]; one implementation exists per architecture family.
//! [`MetadataArch`] is the implementation driven entirely by the loaded
//! ISA metadata, which covers every family whose semantics the descriptor
//! files can express. A family with quirks the metadata cannot express
//! gets its own implementation without touching the analysis code.

use std::sync::Arc;

use crate::error::Error;
use crate::instruction::Instruction;
use crate::schema::{ControlFlow, MemoryOp, RegClass};
use crate::set::InstructionSet;

/// Control-flow behavior of one instruction instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    NotBranch,
    Unconditional,
    Conditional,
    Call,
    Ret,
    Exit,
}

impl BranchKind {
    /// Whether an instruction of this kind terminates a basic block.
    pub fn ends_block(self) -> bool {
        !matches!(self, BranchKind::NotBranch)
    }
}

/// Capabilities one architecture family provides to the analysis layers.
pub trait Arch: Send + Sync {
    /// Architecture family tag, e.g. `"90"`.
    fn arch(&self) -> &str;

    /// Instruction word size in bytes.
    fn word_size(&self) -> u64;

    fn reg_classes(&self) -> &[RegClass];

    fn instruction_set(&self) -> &Arc<InstructionSet>;

    fn decode_one(&self, bytes: &[u8]) -> Result<Instruction, Error>;

    fn encode_one(&self, instr: &Instruction) -> Result<Vec<u8>, Error>;

    fn branch_kind(&self, instr: &Instruction) -> BranchKind;

    /// Absolute target pc of a direct branch/call at `pc`, if the target
    /// is encoded in the instruction.
    fn branch_target(&self, pc: u64, instr: &Instruction) -> Option<u64>;

    /// Re-aim a direct branch/call at `pc` to an absolute `target`.
    fn set_branch_target(
        &self,
        pc: u64,
        instr: &mut Instruction,
        target: u64,
    ) -> Result<(), Error>;

    fn memory_op(&self, instr: &Instruction) -> MemoryOp;
}

/// [`Arch`] implementation backed by the loaded ISA metadata.
pub struct MetadataArch {
    set: Arc<InstructionSet>,
}

impl MetadataArch {
    pub fn new(set: Arc<InstructionSet>) -> Self {
        MetadataArch { set }
    }

    fn displacement_operand<'i>(
        &self,
        instr: &'i Instruction,
    ) -> Option<(&'i str, i64)> {
        let name = instr.def().target_operand.as_deref()?;
        let operand = instr.operand(name)?;
        if !operand.valid {
            return None;
        }
        Some((name, operand.value.as_i64()))
    }
}

impl Arch for MetadataArch {
    fn arch(&self) -> &str {
        self.set.arch()
    }

    fn word_size(&self) -> u64 {
        self.set.word_size() as u64
    }

    fn reg_classes(&self) -> &[RegClass] {
        &RegClass::ALL
    }

    fn instruction_set(&self) -> &Arc<InstructionSet> {
        &self.set
    }

    fn decode_one(&self, bytes: &[u8]) -> Result<Instruction, Error> {
        self.set.decode(bytes)
    }

    fn encode_one(&self, instr: &Instruction) -> Result<Vec<u8>, Error> {
        instr.encode()
    }

    fn branch_kind(&self, instr: &Instruction) -> BranchKind {
        match instr.def().control_flow {
            ControlFlow::None => BranchKind::NotBranch,
            ControlFlow::Call => BranchKind::Call,
            ControlFlow::Ret => BranchKind::Ret,
            ControlFlow::Exit => BranchKind::Exit,
            ControlFlow::Branch => {
                // A branch guarded by the hardwired true predicate (or not
                // guarded at all) is unconditional.
                match instr.guard_predicate() {
                    Some(guard) if guard != RegClass::Predicate.hardwired_index() => {
                        BranchKind::Conditional
                    }
                    _ => BranchKind::Unconditional,
                }
            }
        }
    }

    fn branch_target(&self, pc: u64, instr: &Instruction) -> Option<u64> {
        let (_, displacement) = self.displacement_operand(instr)?;
        let next = pc + instr.size();
        Some(next.wrapping_add_signed(displacement))
    }

    fn set_branch_target(
        &self,
        pc: u64,
        instr: &mut Instruction,
        target: u64,
    ) -> Result<(), Error> {
        let name = instr
            .def()
            .target_operand
            .clone()
            .ok_or_else(|| Error::UnknownOperand {
                instr: instr.name().to_string(),
                operand: "<target>".to_string(),
            })?;
        let next = pc + instr.size();
        let displacement = target.wrapping_sub(next) as i64;
        instr
            .set_operand_signed(&name, displacement)
            .map_err(|e| match e {
                Error::ValueOutOfRange { instr, .. } => Error::DisplacementOverflow {
                    instr,
                    displacement,
                },
                other => other,
            })
    }

    fn memory_op(&self, instr: &Instruction) -> MemoryOp {
        instr.def().memory_op
    }
}
