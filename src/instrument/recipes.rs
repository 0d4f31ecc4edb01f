//! Built-in instrumentation recipes.
//!
//! A recipe materializes its sequences from the loaded ISA metadata by
//! instruction name, so it works on any family that defines the handful
//! of instructions it needs. A family that lacks one makes the recipe
//! inapplicable for that kernel, which the orchestrator reports and
//! skips.

use gputrace_isa::{AccessDir, Arch, Instruction, MemoryOp, OperandKind, RegClass};
use serde_json::json;

use super::{added_param_offset, Recipe, RecipePlan, RegAllocator, SplicePoint, TraceResults};
use crate::driver::LaunchRequest;
use crate::error::Error;
use gputrace_binary::Kernel;

fn not_applicable(recipe: &str, kernel: &Kernel, reason: impl Into<String>) -> Error {
    Error::RecipeNotApplicable {
        recipe: recipe.to_string(),
        kernel: kernel.mangled_name.clone(),
        reason: reason.into(),
    }
}

/// Preset the guard of a materialized instruction to the hardwired true
/// predicate so it executes unconditionally.
fn unconditional(mut instr: Instruction) -> Result<Instruction, Error> {
    let guard = instr
        .def()
        .operands
        .iter()
        .find(|schema| matches!(schema.kind, OperandKind::Predicate))
        .map(|schema| schema.name.clone());
    if let Some(name) = guard {
        instr.set_operand_unsigned(&name, RegClass::Predicate.hardwired_index())?;
    }
    Ok(instr)
}

fn require_defs(
    recipe: &str,
    kernel: &Kernel,
    arch: &dyn Arch,
    names: &[&str],
) -> Result<(), Error> {
    for name in names {
        if arch.instruction_set().def_by_name(name).is_none() {
            return Err(not_applicable(
                recipe,
                kernel,
                format!("instruction set has no {name}"),
            ));
        }
    }
    Ok(())
}

/// Counts how many threads executed each basic block.
///
/// At every block head: load the counter-buffer base from the appended
/// pointer parameter, materialize the constant one, and atomically add
/// it to the block's slot.
pub struct CountControlFlow;

const COUNT_PANEL: &str = "block_execution_count";

impl Recipe for CountControlFlow {
    fn name(&self) -> &'static str {
        "sass::count_control_flow"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn plan(
        &self,
        kernel: &Kernel,
        arch: &dyn Arch,
        alloc: &mut RegAllocator<'_>,
        _launch: &LaunchRequest,
    ) -> Result<RecipePlan, Error> {
        require_defs(self.name(), kernel, arch, &["LDC", "MOV", "RED"])?;
        let set = arch.instruction_set().clone();

        let regs = alloc.alloc_extra(RegClass::General, 2)?;
        let (r_base, r_one) = (regs[0], regs[1]);
        let param_off = added_param_offset(kernel, 0);

        let mut splice_points = Vec::with_capacity(kernel.cfg().blocks.len());
        let mut block_meta = Vec::new();
        for block in &kernel.cfg().blocks {
            let pc = block.base_pc;

            let mut ldc = unconditional(set.shell("LDC")?)?;
            ldc.set_operand_unsigned("Rd", r_base)?;
            ldc.set_operand_unsigned("off", param_off)?;
            alloc.record_operation(RegClass::General, r_base, pc, AccessDir::Write);

            let mut mov = unconditional(set.shell("MOV")?)?;
            mov.set_operand_unsigned("Rd", r_one)?;
            mov.set_operand_unsigned("imm", 1)?;
            alloc.record_operation(RegClass::General, r_one, pc, AccessDir::Write);

            let mut red = unconditional(set.shell("RED")?)?;
            red.set_memory_operand("desc", r_base, (block.id * 8) as i64)?;
            red.set_operand_unsigned("Rb", r_one)?;
            alloc.record_operation(RegClass::General, r_base, pc, AccessDir::Read);
            alloc.record_operation(RegClass::General, r_one, pc, AccessDir::Read);

            splice_points.push(SplicePoint {
                pc,
                priority: self.priority(),
                instructions: vec![ldc, mov, red],
            });
            block_meta.push(json!({
                "id": block.id,
                "base_pc": block.base_pc,
                "end_pc": block.end_pc,
            }));
        }

        Ok(RecipePlan {
            splice_points,
            scratch_sizes: vec![kernel.cfg().blocks.len() as u64 * 8],
            scalar_params: Vec::new(),
            added_shared_memory: 0,
            metadata: json!({ "blocks": block_meta }),
        })
    }

    fn collect(
        &self,
        _kernel: &Kernel,
        plan: &RecipePlan,
        buffers: &[Vec<u8>],
        results: &mut TraceResults,
    ) -> Result<(), Error> {
        let counters = &buffers[0];
        let blocks = plan.metadata["blocks"].as_array().cloned().unwrap_or_default();
        let panel = results.entry(COUNT_PANEL.to_string()).or_default();
        for (slot, block) in blocks.iter().enumerate() {
            let count = u64::from_le_bytes(
                counters[slot * 8..slot * 8 + 8]
                    .try_into()
                    .expect("slot within buffer"),
            );
            let id = block["id"].as_u64().unwrap_or(slot as u64);
            panel.insert(
                id.to_string(),
                json!({
                    "base_pc": block["base_pc"],
                    "end_pc": block["end_pc"],
                    "count": count,
                }),
            );
        }
        Ok(())
    }
}

/// Records, per global-store site, the pc and the address base the last
/// executing thread stored through.
pub struct TraceDmemStore;

const STORE_PANEL: &str = "dmem_store";

impl Recipe for TraceDmemStore {
    fn name(&self) -> &'static str {
        "sass::trace_dmem_store"
    }

    fn plan(
        &self,
        kernel: &Kernel,
        arch: &dyn Arch,
        alloc: &mut RegAllocator<'_>,
        _launch: &LaunchRequest,
    ) -> Result<RecipePlan, Error> {
        require_defs(self.name(), kernel, arch, &["LDC", "MOV", "STG", "IADD3"])?;
        let set = arch.instruction_set().clone();

        // Every global-store site, with the register its address is
        // based on.
        let mut stores = Vec::new();
        for (index, instr) in kernel.instructions.iter().enumerate() {
            if arch.memory_op(instr) != MemoryOp::Store {
                continue;
            }
            let Some(base) = instr
                .operands()
                .find(|op| matches!(op.schema.kind, OperandKind::Memory { .. }))
                .map(|op| op.value.as_u64())
            else {
                continue;
            };
            stores.push((kernel.pc_of(index), base));
        }

        let regs = alloc.alloc_extra(RegClass::General, 2)?;
        let (r_buf, r_val) = (regs[0], regs[1]);
        let param_off = added_param_offset(kernel, 0);
        let zero = RegClass::General.hardwired_index();

        let mut splice_points = Vec::with_capacity(stores.len());
        let mut store_meta = Vec::new();
        for (slot, &(pc, base)) in stores.iter().enumerate() {
            let mut ldc = unconditional(set.shell("LDC")?)?;
            ldc.set_operand_unsigned("Rd", r_buf)?;
            ldc.set_operand_unsigned("off", param_off)?;
            alloc.record_operation(RegClass::General, r_buf, pc, AccessDir::Write);

            let mut mov = unconditional(set.shell("MOV")?)?;
            mov.set_operand_unsigned("Rd", r_val)?;
            mov.set_operand_unsigned("imm", pc)?;
            alloc.record_operation(RegClass::General, r_val, pc, AccessDir::Write);

            let mut store_pc = unconditional(set.shell("STG")?)?;
            store_pc.set_memory_operand("desc", r_buf, (slot * 16) as i64)?;
            store_pc.set_operand_unsigned("Rb", r_val)?;

            let mut copy_base = unconditional(set.shell("IADD3")?)?;
            copy_base.set_operand_unsigned("Rd", r_val)?;
            copy_base.set_operand_unsigned("Ra", base)?;
            copy_base.set_operand_unsigned("Rb", zero)?;
            alloc.record_operation(RegClass::General, r_val, pc, AccessDir::ReadWrite);

            let mut store_base = unconditional(set.shell("STG")?)?;
            store_base.set_memory_operand("desc", r_buf, (slot * 16 + 8) as i64)?;
            store_base.set_operand_unsigned("Rb", r_val)?;
            alloc.record_operation(RegClass::General, r_buf, pc, AccessDir::Read);

            splice_points.push(SplicePoint {
                pc,
                priority: self.priority(),
                instructions: vec![ldc, mov, store_pc, copy_base, store_base],
            });
            store_meta.push(json!({ "pc": pc, "slot": slot }));
        }

        Ok(RecipePlan {
            splice_points,
            scratch_sizes: vec![(stores.len().max(1) as u64) * 16],
            scalar_params: Vec::new(),
            added_shared_memory: 0,
            metadata: json!({ "stores": store_meta }),
        })
    }

    fn collect(
        &self,
        _kernel: &Kernel,
        plan: &RecipePlan,
        buffers: &[Vec<u8>],
        results: &mut TraceResults,
    ) -> Result<(), Error> {
        let records = &buffers[0];
        let stores = plan.metadata["stores"].as_array().cloned().unwrap_or_default();
        let panel = results.entry(STORE_PANEL.to_string()).or_default();
        for store in &stores {
            let slot = store["slot"].as_u64().unwrap_or(0) as usize;
            let pc_value = u64::from_le_bytes(
                records[slot * 16..slot * 16 + 8]
                    .try_into()
                    .expect("slot within buffer"),
            );
            let address = u64::from_le_bytes(
                records[slot * 16 + 8..slot * 16 + 16]
                    .try_into()
                    .expect("slot within buffer"),
            );
            panel.insert(
                format!("{:#x}", store["pc"].as_u64().unwrap_or(0)),
                json!({ "recorded_pc": pc_value, "address_base": address }),
            );
        }
        Ok(())
    }
}
