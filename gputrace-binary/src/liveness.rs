//! Per-block register define/use sets and the live-in/live-out fixpoint.
//!
//! Define/use is computed by a single forward scan per block: a register
//! written before any read is a define, a register read before any write
//! is a use. Scans may start mid-block (the instrumentation allocator
//! asks from arbitrary pcs); results are cached per `(block, base_pc)`
//! origin. The dataflow itself is the standard backward fixpoint over a
//! worklist seeded in reverse post-order.

use std::collections::{BTreeSet, HashMap};

use gputrace_isa::{Instruction, RegClass};

use crate::cfg::Cfg;
use crate::error::Error;

/// Registers written (define) and read-before-written (use) by a scan of
/// one block from a given origin pc.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefineUse {
    pub define: BTreeSet<u64>,
    pub uses: BTreeSet<u64>,
}

/// Live-in/live-out sets per block, for one register class.
#[derive(Debug, Clone, Default)]
pub struct ClassLiveness {
    pub live_in: Vec<BTreeSet<u64>>,
    pub live_out: Vec<BTreeSet<u64>>,
}

/// Fold the per-instruction register sets of a straight-line instruction
/// run into define/use.
pub fn scan_define_use(
    instructions: &[Instruction],
    class: RegClass,
) -> DefineUse {
    let mut result = DefineUse::default();
    for instr in instructions {
        if let Some(reads) = instr.regs_in(class) {
            for &reg in reads {
                if !result.define.contains(&reg) {
                    result.uses.insert(reg);
                }
            }
        }
        if let Some(writes) = instr.regs_out(class) {
            for &reg in writes {
                result.define.insert(reg);
            }
        }
    }
    result
}

/// Cache of define/use scans, keyed by `(block, origin pc, class)`.
#[derive(Debug, Default)]
pub struct DefineUseCache {
    records: HashMap<(usize, u64, RegClass), DefineUse>,
}

impl DefineUseCache {
    /// Define/use of `block` scanning from `base_pc` to the block end.
    /// `base_pc` must lie on an instruction boundary inside the block.
    pub fn define_use(
        &mut self,
        cfg: &Cfg,
        instructions: &[Instruction],
        block_index: usize,
        base_pc: u64,
        class: RegClass,
    ) -> Result<&DefineUse, Error> {
        let key = (block_index, base_pc, class);
        if !self.records.contains_key(&key) {
            let block = &cfg.blocks[block_index];
            let word = instructions
                .get(block.first_instr)
                .map(|i| i.size())
                .unwrap_or(1);
            if base_pc < block.base_pc
                || base_pc >= block.end_pc
                || (base_pc - block.base_pc) % word != 0
            {
                return Err(Error::NoInstructionAtPc {
                    name: String::new(),
                    pc: base_pc,
                });
            }
            let skip = ((base_pc - block.base_pc) / word) as usize;
            let range = block.first_instr + skip..block.first_instr + block.instr_count;
            let record = scan_define_use(&instructions[range], class);
            self.records.insert(key, record);
        }
        Ok(&self.records[&key])
    }
}

/// Compute live-in/live-out for every block, for one register class.
///
/// One iteration of the transfer function never shrinks a set, so the
/// worklist terminates once no block changes.
pub fn compute_liveness(
    cfg: &Cfg,
    instructions: &[Instruction],
    class: RegClass,
) -> ClassLiveness {
    let block_count = cfg.blocks.len();
    let mut result = ClassLiveness {
        live_in: vec![BTreeSet::new(); block_count],
        live_out: vec![BTreeSet::new(); block_count],
    };

    let define_use: Vec<DefineUse> = cfg
        .blocks
        .iter()
        .map(|block| {
            let range = block.first_instr..block.first_instr + block.instr_count;
            scan_define_use(&instructions[range], class)
        })
        .collect();

    // Backward problem: draining the stack visits blocks in post-order
    // (successors before predecessors), so most blocks settle in one
    // pass and loops iterate to their fixpoint.
    let mut worklist: Vec<usize> = cfg.reverse_post_order();
    let mut queued = vec![true; block_count];

    while let Some(block) = worklist.pop() {
        queued[block] = false;

        let mut out = BTreeSet::new();
        for edge in cfg.successors(block) {
            out.extend(result.live_in[edge.to_block].iter().copied());
        }

        let du = &define_use[block];
        let mut live_in: BTreeSet<u64> = du.uses.clone();
        live_in.extend(out.difference(&du.define).copied());

        let changed = live_in != result.live_in[block] || out != result.live_out[block];
        result.live_out[block] = out;
        if changed {
            result.live_in[block] = live_in;
            for edge in cfg.predecessors(block) {
                if !queued[edge.from_block] {
                    queued[edge.from_block] = true;
                    worklist.push(edge.from_block);
                }
            }
        }
    }

    result
}

/// Registers of `class` live anywhere in `[start_pc, end_pc]`.
///
/// Conservative per-block view: a register is considered live across the
/// span if it is live-in or live-out of any block the span touches, or
/// read or written by any instruction in the span.
pub fn live_across(
    cfg: &Cfg,
    instructions: &[Instruction],
    liveness: &ClassLiveness,
    class: RegClass,
    start_pc: u64,
    end_pc: u64,
) -> BTreeSet<u64> {
    let mut live = BTreeSet::new();
    for (index, block) in cfg.blocks.iter().enumerate() {
        if block.end_pc <= start_pc || block.base_pc > end_pc {
            continue;
        }
        live.extend(liveness.live_in[index].iter().copied());
        live.extend(liveness.live_out[index].iter().copied());
        let range = block.first_instr..block.first_instr + block.instr_count;
        for instr in &instructions[range] {
            if let Some(reads) = instr.regs_in(class) {
                live.extend(reads.iter().copied());
            }
            if let Some(writes) = instr.regs_out(class) {
                live.extend(writes.iter().copied());
            }
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use gputrace_isa::testing::{build, demo_arch};
    use gputrace_isa::Arch;

    #[test]
    fn straight_line_liveness() {
        let arch = demo_arch();
        let set = arch.instruction_set().clone();

        // R1 = R0 + R0; R2 = R1 + R1; ret (R2 unread afterwards)
        let mut i0 = build(&set, "IADD3");
        i0.set_operand_unsigned("Rd", 1).unwrap();
        i0.set_operand_unsigned("Ra", 0).unwrap();
        i0.set_operand_unsigned("Rb", 0).unwrap();
        let mut i1 = build(&set, "IADD3");
        i1.set_operand_unsigned("Rd", 2).unwrap();
        i1.set_operand_unsigned("Ra", 1).unwrap();
        i1.set_operand_unsigned("Rb", 1).unwrap();
        let instructions = vec![i0, i1, build(&set, "RET")];

        let cfg = build_cfg(&instructions, &*arch).unwrap();
        let liveness = compute_liveness(&cfg, &instructions, RegClass::General);

        assert_eq!(
            liveness.live_in[0].iter().copied().collect::<Vec<_>>(),
            vec![0]
        );
        assert!(liveness.live_out[0].is_empty());
    }

    #[test]
    fn loop_propagates_liveness_to_fixpoint() {
        let arch = demo_arch();
        let set = arch.instruction_set().clone();
        let isize = arch.word_size();

        // 0: ISETP P1 <- R7, R8
        // 1: IADD3 R1 <- R2, R3
        // 2: @P1 BRA 1         (loop back edge)
        // 3: EXIT
        let mut i0 = build(&set, "ISETP");
        i0.set_operand_unsigned("Pd", 1).unwrap();
        i0.set_operand_unsigned("Ra", 7).unwrap();
        i0.set_operand_unsigned("Rb", 8).unwrap();
        let mut i1 = build(&set, "IADD3");
        i1.set_operand_unsigned("Rd", 1).unwrap();
        i1.set_operand_unsigned("Ra", 2).unwrap();
        i1.set_operand_unsigned("Rb", 3).unwrap();
        let mut bra = build(&set, "BRA");
        bra.set_operand_unsigned("Pg", 1).unwrap();
        let mut instructions = vec![i0, i1, bra, build(&set, "EXIT")];
        arch.set_branch_target(2 * isize, &mut instructions[2], isize)
            .unwrap();

        let cfg = build_cfg(&instructions, &*arch).unwrap();
        let liveness = compute_liveness(&cfg, &instructions, RegClass::General);
        let predicates = compute_liveness(&cfg, &instructions, RegClass::Predicate);

        // R2/R3 are re-read on every iteration, so they are live around
        // the back edge and into the entry.
        let entry_in = &liveness.live_in[0];
        assert!(entry_in.contains(&2) && entry_in.contains(&3));
        assert!(entry_in.contains(&7) && entry_in.contains(&8));
        // P1 is consumed by the branch in the loop block.
        let loop_block = cfg.block_at(isize).unwrap().id as usize;
        assert!(predicates.live_in[loop_block].contains(&1));

        // Monotonicity: re-running the transfer function changes nothing.
        let again = compute_liveness(&cfg, &instructions, RegClass::General);
        assert_eq!(again.live_in, liveness.live_in);
        assert_eq!(again.live_out, liveness.live_out);
    }

    #[test]
    fn define_use_cache_scans_from_mid_block() {
        let arch = demo_arch();
        let set = arch.instruction_set().clone();
        let isize = arch.word_size();

        // R1 = R0+R0 ; R0 = R1+R1 ; EXIT
        let mut i0 = build(&set, "IADD3");
        i0.set_operand_unsigned("Rd", 1).unwrap();
        i0.set_operand_unsigned("Ra", 0).unwrap();
        i0.set_operand_unsigned("Rb", 0).unwrap();
        let mut i1 = build(&set, "IADD3");
        i1.set_operand_unsigned("Rd", 0).unwrap();
        i1.set_operand_unsigned("Ra", 1).unwrap();
        i1.set_operand_unsigned("Rb", 1).unwrap();
        let instructions = vec![i0, i1, build(&set, "EXIT")];
        let cfg = build_cfg(&instructions, &*arch).unwrap();

        let mut cache = DefineUseCache::default();
        let from_start = cache
            .define_use(&cfg, &instructions, 0, 0, RegClass::General)
            .unwrap()
            .clone();
        assert_eq!(from_start.uses.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(
            from_start.define.iter().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );

        // From the second instruction, R1 is a use (no preceding write
        // in the scan).
        let mid = cache
            .define_use(&cfg, &instructions, 0, isize, RegClass::General)
            .unwrap();
        assert_eq!(mid.uses.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(mid.define.iter().copied().collect::<Vec<_>>(), vec![0]);
    }
}
