//! A small synthetic instruction set for tests, behind the
//! `test-helpers` feature.
//!
//! The family models the shape of a real 128-bit GPU ISA closely enough
//! to exercise every code path: a 12-bit opcode at the bottom of the
//! word, a guard predicate, split immediate fields, memory descriptors
//! with signed displacements, opcode sharing disambiguated by a
//! discriminator field, and hardwired zero/true registers at the top of
//! each register file.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::arch::MetadataArch;
use crate::bitfield::Endian;
use crate::def::InstructionDef;
use crate::instruction::Instruction;
use crate::schema::{
    AccessDir, ControlFlow, FieldAttr, MemoryOp, ModifierSchema, OperandKind, OperandSchema,
    RegClass,
};
use crate::set::InstructionSet;

const WORD_SIZE: u32 = 16;
const OPCODE_RANGES: [(u64, u64); 1] = [(0, 11)];

fn fields(entries: &[(&str, &[(u64, u64)])]) -> BTreeMap<String, FieldAttr> {
    entries
        .iter()
        .map(|(label, ranges)| (label.to_string(), FieldAttr::new(ranges.to_vec())))
        .collect()
}

fn guard() -> OperandSchema {
    OperandSchema {
        name: "Pg".into(),
        kind: OperandKind::Predicate,
        direction: AccessDir::Read,
        fields: vec!["Pg".into()],
    }
}

fn reg(name: &str, class: RegClass, direction: AccessDir, field: &str) -> OperandSchema {
    OperandSchema {
        name: name.into(),
        kind: OperandKind::Register { class },
        direction,
        fields: vec![field.into()],
    }
}

fn imm(name: &str, signed: bool, bits: u32, field: &str) -> OperandSchema {
    OperandSchema {
        name: name.into(),
        kind: OperandKind::Immediate { signed, bits },
        direction: AccessDir::None,
        fields: vec![field.into()],
    }
}

fn mem(name: &str, direction: AccessDir) -> OperandSchema {
    OperandSchema {
        name: name.into(),
        kind: OperandKind::Memory {
            base_class: RegClass::General,
            offset_bits: 24,
        },
        direction,
        fields: vec!["Ra".into(), "imm24".into()],
    }
}

fn def(
    name: &str,
    opcode: u64,
    operands: Vec<OperandSchema>,
    field_table: BTreeMap<String, FieldAttr>,
) -> InstructionDef {
    InstructionDef {
        name: name.into(),
        size: WORD_SIZE,
        endian: Endian::Little,
        opcode,
        opcode_ranges: OPCODE_RANGES.to_vec(),
        discriminators: Vec::new(),
        operands,
        modifiers: Vec::new(),
        fields: field_table,
        control_flow: ControlFlow::None,
        memory_op: MemoryOp::None,
        target_operand: None,
    }
}

/// Build the synthetic `"90"` instruction set.
pub fn demo_instruction_set() -> InstructionSet {
    let pg: (&str, &[(u64, u64)]) = ("Pg", &[(12, 14)]);
    let rd: (&str, &[(u64, u64)]) = ("Rd", &[(16, 23)]);
    let ra: (&str, &[(u64, u64)]) = ("Ra", &[(24, 31)]);
    let rb: (&str, &[(u64, u64)]) = ("Rb", &[(32, 39)]);
    let imm24: (&str, &[(u64, u64)]) = ("imm24", &[(40, 63)]);
    let imm32: (&str, &[(u64, u64)]) = ("imm32", &[(40, 71)]);
    // The branch displacement is split across two ranges, like the real
    // encodings this family imitates.
    let rel32: (&str, &[(u64, u64)]) = ("rel32", &[(40, 63), (72, 79)]);

    let mut defs = vec![
        def("NOP", 0x918, vec![], fields(&[])),
        def("EXIT", 0x94d, vec![guard()], fields(&[pg])),
        def("RET", 0x950, vec![guard()], fields(&[pg])),
        {
            let mut d = def(
                "BRA",
                0x947,
                vec![guard(), imm("rel", true, 32, "rel32")],
                fields(&[pg, rel32]),
            );
            d.control_flow = ControlFlow::Branch;
            d.target_operand = Some("rel".into());
            d
        },
        {
            let mut d = def(
                "CALL",
                0x943,
                vec![guard(), imm("rel", true, 32, "rel32")],
                fields(&[pg, rel32]),
            );
            d.control_flow = ControlFlow::Call;
            d.target_operand = Some("rel".into());
            d
        },
        def(
            "MOV",
            0x202,
            vec![
                guard(),
                reg("Rd", RegClass::General, AccessDir::Write, "Rd"),
                imm("imm", false, 32, "imm32"),
            ],
            fields(&[pg, rd, imm32]),
        ),
        def(
            "IADD3",
            0x210,
            vec![
                guard(),
                reg("Rd", RegClass::General, AccessDir::Write, "Rd"),
                reg("Ra", RegClass::General, AccessDir::Read, "Ra"),
                reg("Rb", RegClass::General, AccessDir::Read, "Rb"),
            ],
            fields(&[pg, rd, ra, rb]),
        ),
        def(
            "IMAD",
            0x224,
            vec![
                guard(),
                reg("Rd", RegClass::General, AccessDir::ReadWrite, "Rd"),
                reg("Ra", RegClass::General, AccessDir::Read, "Ra"),
                reg("Rb", RegClass::General, AccessDir::Read, "Rb"),
            ],
            fields(&[pg, rd, ra, rb]),
        ),
        def(
            "ISETP",
            0x20c,
            vec![
                guard(),
                reg("Pd", RegClass::Predicate, AccessDir::Write, "Pd"),
                reg("Ra", RegClass::General, AccessDir::Read, "Ra"),
                reg("Rb", RegClass::General, AccessDir::Read, "Rb"),
            ],
            fields(&[pg, ("Pd", &[(81, 83)]), ra, rb]),
        ),
        def(
            "S2R",
            0x919,
            vec![
                guard(),
                reg("Rd", RegClass::General, AccessDir::Write, "Rd"),
                imm("sr", false, 8, "sr8"),
            ],
            fields(&[pg, rd, ("sr8", &[(40, 47)])]),
        ),
        def(
            "LDC",
            0xb82,
            vec![
                guard(),
                reg("Rd", RegClass::General, AccessDir::Write, "Rd"),
                imm("off", false, 16, "off16"),
            ],
            fields(&[pg, rd, ("off16", &[(40, 55)])]),
        ),
        def(
            "UIADD3",
            0x290,
            vec![
                guard(),
                reg("URd", RegClass::Uniform, AccessDir::Write, "Rd"),
                reg("URa", RegClass::Uniform, AccessDir::Read, "Ra"),
                reg("URb", RegClass::Uniform, AccessDir::Read, "Rb"),
            ],
            fields(&[pg, rd, ra, rb]),
        ),
    ];

    // Global and local loads share an opcode and differ only in the
    // memory-space discriminator, exercising the multimap decode.
    let mut ldg = def(
        "LDG",
        0x981,
        vec![
            guard(),
            reg("Rd", RegClass::General, AccessDir::Write, "Rd"),
            mem("desc", AccessDir::Read),
        ],
        fields(&[pg, rd, ra, imm24, ("mem_space", &[(76, 77)])]),
    );
    ldg.discriminators = vec![("mem_space".into(), 0)];
    ldg.memory_op = MemoryOp::Load;
    ldg.modifiers = vec![ModifierSchema {
        name: "sz".into(),
        field: "sz".into(),
        value_names: vec!["".into(), "64".into(), "128".into()],
    }];
    ldg.fields
        .insert("sz".into(), FieldAttr::new(vec![(84, 85)]));
    defs.push(ldg);

    let mut ldl = def(
        "LDL",
        0x981,
        vec![
            guard(),
            reg("Rd", RegClass::General, AccessDir::Write, "Rd"),
            mem("desc", AccessDir::Read),
        ],
        fields(&[pg, rd, ra, imm24, ("mem_space", &[(76, 77)])]),
    );
    ldl.discriminators = vec![("mem_space".into(), 1)];
    ldl.memory_op = MemoryOp::Load;
    defs.push(ldl);

    let mut stg = def(
        "STG",
        0x986,
        vec![
            guard(),
            mem("desc", AccessDir::Write),
            reg("Rb", RegClass::General, AccessDir::Read, "Rb"),
        ],
        fields(&[pg, ra, rb, imm24]),
    );
    stg.memory_op = MemoryOp::Store;
    defs.push(stg);

    let mut red = def(
        "RED",
        0x98f,
        vec![
            guard(),
            mem("desc", AccessDir::Write),
            reg("Rb", RegClass::General, AccessDir::Read, "Rb"),
        ],
        fields(&[pg, ra, rb, imm24]),
    );
    red.memory_op = MemoryOp::Atomic;
    defs.push(red);

    InstructionSet::from_defs("90", defs).expect("demo instruction set is well-formed")
}

/// The synthetic set wrapped in its metadata-driven [`MetadataArch`].
pub fn demo_arch() -> Arc<MetadataArch> {
    Arc::new(MetadataArch::new(Arc::new(demo_instruction_set())))
}

/// Shell of `name` with the guard (if any) preset to the hardwired true
/// predicate, so the instruction is unconditional until a test says
/// otherwise.
pub fn build(set: &InstructionSet, name: &str) -> Instruction {
    let mut instr = set.shell(name).expect("known instruction name");
    if instr.def().operand("Pg").is_some() {
        instr
            .set_operand_unsigned("Pg", RegClass::Predicate.hardwired_index())
            .unwrap();
    }
    instr
}

/// Concatenate instruction words into a kernel text image.
pub fn assemble(instructions: &[Instruction]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(instructions.len() * WORD_SIZE as usize);
    for instr in instructions {
        bytes.extend_from_slice(&instr.bytes);
    }
    bytes
}
