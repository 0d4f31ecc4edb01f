//! Control-flow graph construction over a kernel's instruction list.

use gputrace_isa::{Arch, BranchKind, Instruction};
use rangemap::RangeMap;

use crate::error::Error;

/// One basic block: a maximal straight-line run of instructions.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Monotonically assigned id, equal to the block's index.
    pub id: u64,
    /// Covered pc range, `[base_pc, end_pc)`.
    pub base_pc: u64,
    pub end_pc: u64,
    /// Index of the first instruction in the kernel's instruction list.
    pub first_instr: usize,
    pub instr_count: usize,
}

/// One edge of the graph. Edges carry the precise branch source and
/// target pcs, not just the block pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgEdge {
    pub from_block: usize,
    pub to_block: usize,
    pub from_pc: u64,
    pub to_pc: u64,
}

/// The control-flow graph. Blocks hold no references to each other;
/// edges live in one flat vector with per-block adjacency index lists.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<CfgEdge>,
    /// Outgoing edge indices per block.
    pub succ: Vec<Vec<usize>>,
    /// Incoming edge indices per block.
    pub pred: Vec<Vec<usize>>,
    block_by_pc: RangeMap<u64, usize>,
}

impl Cfg {
    /// Block covering `pc`, if any.
    pub fn block_at(&self, pc: u64) -> Option<&BasicBlock> {
        self.block_by_pc.get(&pc).map(|&index| &self.blocks[index])
    }

    pub fn successors(&self, block: usize) -> impl Iterator<Item = &CfgEdge> {
        self.succ[block].iter().map(|&edge| &self.edges[edge])
    }

    pub fn predecessors(&self, block: usize) -> impl Iterator<Item = &CfgEdge> {
        self.pred[block].iter().map(|&edge| &self.edges[edge])
    }

    /// Blocks in reverse post-order over the successor relation.
    pub fn reverse_post_order(&self) -> Vec<usize> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.blocks.len());
        // Iterative DFS from every unvisited block, entry first.
        for start in 0..self.blocks.len() {
            if visited[start] {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            visited[start] = true;
            while let Some(&mut (block, ref mut next)) = stack.last_mut() {
                let succ = &self.succ[block];
                if *next < succ.len() {
                    let target = self.edges[succ[*next]].to_block;
                    *next += 1;
                    if !visited[target] {
                        visited[target] = true;
                        stack.push((target, 0));
                    }
                } else {
                    post.push(block);
                    stack.pop();
                }
            }
        }
        post.reverse();
        post
    }
}

/// Partition an instruction list into basic blocks and connect them.
///
/// `instructions` is the kernel's full list starting at pc 0.
pub fn build_cfg(instructions: &[Instruction], arch: &dyn Arch) -> Result<Cfg, Error> {
    let mut cfg = Cfg::default();
    if instructions.is_empty() {
        return Ok(cfg);
    }

    // Instruction pcs, plus the end of the code range.
    let mut pcs = Vec::with_capacity(instructions.len() + 1);
    let mut pc = 0u64;
    for instr in instructions {
        pcs.push(pc);
        pc += instr.size();
    }
    let code_end = pc;
    pcs.push(code_end);

    // Leaders: pc 0, every branch target, every pc following an
    // instruction that ends a block.
    let mut leaders = std::collections::BTreeSet::new();
    leaders.insert(0u64);
    for (index, instr) in instructions.iter().enumerate() {
        let kind = arch.branch_kind(instr);
        if !kind.ends_block() {
            continue;
        }
        let next_pc = pcs[index + 1];
        if next_pc < code_end {
            leaders.insert(next_pc);
        }
        if matches!(kind, BranchKind::Unconditional | BranchKind::Conditional) {
            if let Some(target) = arch.branch_target(pcs[index], instr) {
                if target >= code_end {
                    return Err(Error::BranchTargetOutOfRange {
                        from_pc: pcs[index],
                        to_pc: target,
                    });
                }
                leaders.insert(target);
            }
        }
    }

    // Every leader must land on an instruction boundary.
    for &leader in &leaders {
        if pcs.binary_search(&leader).is_err() {
            return Err(Error::LeaderInsideInstruction { pc: leader });
        }
    }

    // Partition into blocks, sorted by base pc.
    let leader_list: Vec<u64> = leaders.iter().copied().collect();
    for (block_index, &base_pc) in leader_list.iter().enumerate() {
        let end_pc = leader_list
            .get(block_index + 1)
            .copied()
            .unwrap_or(code_end);
        let first_instr = pcs.binary_search(&base_pc).unwrap();
        let one_past = pcs.binary_search(&end_pc).unwrap();
        cfg.blocks.push(BasicBlock {
            id: block_index as u64,
            base_pc,
            end_pc,
            first_instr,
            instr_count: one_past - first_instr,
        });
        cfg.block_by_pc.insert(base_pc..end_pc, block_index);
    }

    cfg.succ = vec![Vec::new(); cfg.blocks.len()];
    cfg.pred = vec![Vec::new(); cfg.blocks.len()];

    let block_index_at = |pc: u64| -> usize {
        *cfg.block_by_pc.get(&pc).expect("pc within code range")
    };

    let mut edges = Vec::new();
    for (block_index, block) in cfg.blocks.iter().enumerate() {
        let last_index = block.first_instr + block.instr_count - 1;
        let last = &instructions[last_index];
        let last_pc = pcs[last_index];
        let fall_through_pc = block.end_pc;

        match arch.branch_kind(last) {
            BranchKind::Unconditional => {
                let target = arch.branch_target(last_pc, last).ok_or(
                    Error::BranchTargetOutOfRange {
                        from_pc: last_pc,
                        to_pc: u64::MAX,
                    },
                )?;
                edges.push(CfgEdge {
                    from_block: block_index,
                    to_block: block_index_at(target),
                    from_pc: last_pc,
                    to_pc: target,
                });
            }
            BranchKind::Conditional => {
                let target = arch.branch_target(last_pc, last).ok_or(
                    Error::BranchTargetOutOfRange {
                        from_pc: last_pc,
                        to_pc: u64::MAX,
                    },
                )?;
                edges.push(CfgEdge {
                    from_block: block_index,
                    to_block: block_index_at(target),
                    from_pc: last_pc,
                    to_pc: target,
                });
                if fall_through_pc < code_end {
                    edges.push(CfgEdge {
                        from_block: block_index,
                        to_block: block_index_at(fall_through_pc),
                        from_pc: last_pc,
                        to_pc: fall_through_pc,
                    });
                }
            }
            // Returns and kernel exits terminate the flow.
            BranchKind::Ret | BranchKind::Exit => {}
            // Calls come back; the block only ends because the next pc
            // is a leader.
            BranchKind::Call | BranchKind::NotBranch => {
                if fall_through_pc < code_end {
                    edges.push(CfgEdge {
                        from_block: block_index,
                        to_block: block_index_at(fall_through_pc),
                        from_pc: last_pc,
                        to_pc: fall_through_pc,
                    });
                }
            }
        }
    }

    for (edge_index, edge) in edges.iter().enumerate() {
        cfg.succ[edge.from_block].push(edge_index);
        cfg.pred[edge.to_block].push(edge_index);
    }
    cfg.edges = edges;

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gputrace_isa::testing::{build, demo_arch};
    use gputrace_isa::Arch;

    fn straight_line(n: usize) -> Vec<Instruction> {
        let arch = demo_arch();
        let set = arch.instruction_set();
        (0..n).map(|_| build(set, "NOP")).collect()
    }

    #[test]
    fn straight_line_kernel_is_one_block() {
        let arch = demo_arch();
        let instructions = straight_line(8);
        let isize = arch.word_size();
        let cfg = build_cfg(&instructions, &*arch).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        let block = &cfg.blocks[0];
        assert_eq!(block.base_pc, 0);
        assert_eq!(block.end_pc, 8 * isize);
        assert!(cfg.successors(0).next().is_none());
        assert!(cfg.predecessors(0).next().is_none());
    }

    #[test]
    fn diamond_shape() {
        let arch = demo_arch();
        let set = arch.instruction_set().clone();
        let isize = arch.word_size();

        // 0: ISETP P1 <- R2, R3
        // 1: @P1 BRA L2
        // 2: IADD3
        // 3: BRA L3
        // 4: L2: IADD3
        // 5: L3: RET
        let mut instructions = vec![
            {
                let mut i = build(&set, "ISETP");
                i.set_operand_unsigned("Pd", 1).unwrap();
                i.set_operand_unsigned("Ra", 2).unwrap();
                i.set_operand_unsigned("Rb", 3).unwrap();
                i
            },
            {
                let mut i = build(&set, "BRA");
                i.set_operand_unsigned("Pg", 1).unwrap();
                i
            },
            build(&set, "IADD3"),
            build(&set, "BRA"),
            build(&set, "IADD3"),
            build(&set, "RET"),
        ];
        arch.set_branch_target(isize, &mut instructions[1], 4 * isize)
            .unwrap();
        arch.set_branch_target(3 * isize, &mut instructions[3], 5 * isize)
            .unwrap();

        let cfg = build_cfg(&instructions, &*arch).unwrap();
        // Blocks: [0,2), [2,4), [4,5), [5,6) in instruction indices.
        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(cfg.blocks[0].end_pc, 2 * isize);

        // The conditional block has two successors.
        let succ0: Vec<u64> = cfg.successors(0).map(|e| e.to_pc).collect();
        assert_eq!(succ0.len(), 2);
        assert!(succ0.contains(&(4 * isize)));
        assert!(succ0.contains(&(2 * isize)));

        // The join block (RET at pc 5) has two predecessors.
        let join = cfg.block_at(5 * isize).unwrap().id as usize;
        assert_eq!(cfg.predecessors(join).count(), 2);
        // And no successors: RET terminates.
        assert_eq!(cfg.successors(join).count(), 0);

        // Edges carry precise pcs.
        let edge = cfg
            .successors(0)
            .find(|e| e.to_pc == 4 * isize)
            .unwrap();
        assert_eq!(edge.from_pc, isize);
    }

    #[test]
    fn partition_covers_code_range_without_gaps() {
        let arch = demo_arch();
        let set = arch.instruction_set().clone();
        let isize = arch.word_size();
        let mut instructions = vec![
            build(&set, "IADD3"),
            build(&set, "BRA"),
            build(&set, "NOP"),
            build(&set, "EXIT"),
        ];
        arch.set_branch_target(isize, &mut instructions[1], 3 * isize)
            .unwrap();
        let cfg = build_cfg(&instructions, &*arch).unwrap();

        let mut covered = 0u64;
        let mut expected_base = 0u64;
        for block in &cfg.blocks {
            assert_eq!(block.base_pc, expected_base);
            assert!(block.base_pc < block.end_pc);
            covered += block.end_pc - block.base_pc;
            expected_base = block.end_pc;
        }
        assert_eq!(covered, 4 * isize);

        // Edges are bidirectionally consistent.
        for (edge_index, edge) in cfg.edges.iter().enumerate() {
            assert!(cfg.succ[edge.from_block].contains(&edge_index));
            assert!(cfg.pred[edge.to_block].contains(&edge_index));
        }
    }

    #[test]
    fn branch_outside_code_range_is_rejected() {
        let arch = demo_arch();
        let set = arch.instruction_set().clone();
        let isize = arch.word_size();
        let mut instructions = vec![build(&set, "BRA"), build(&set, "EXIT")];
        arch.set_branch_target(0, &mut instructions[0], 64 * isize)
            .unwrap();
        assert!(matches!(
            build_cfg(&instructions, &*arch),
            Err(Error::BranchTargetOutOfRange { .. })
        ));
    }
}
