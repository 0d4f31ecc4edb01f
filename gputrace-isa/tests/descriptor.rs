use gputrace_isa::testing::demo_instruction_set;
use gputrace_isa::{FamilyDescriptor, InstructionSet};

#[test]
fn descriptor_files_round_trip_through_the_loader() {
    let set = demo_instruction_set();

    // Write the whole demo family out as one descriptor file, the way
    // a deployment ships per-family descriptors.
    let descriptor = FamilyDescriptor {
        family: "sm90_core".to_string(),
        instructions: set.defs().map(|def| (**def).clone()).collect(),
    };
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("sm90_core.json"),
        serde_json::to_vec_pretty(&descriptor).unwrap(),
    )
    .unwrap();
    // Non-descriptor files are ignored.
    std::fs::write(dir.path().join("notes.txt"), b"not a descriptor").unwrap();

    let loaded = InstructionSet::load_dir("90", dir.path()).unwrap();
    assert_eq!(loaded.arch(), "90");
    assert_eq!(loaded.defs().count(), set.defs().count());
    assert_eq!(loaded.word_size(), set.word_size());

    // The loaded set decodes what the in-memory set encodes.
    let mut mov = loaded.shell("MOV").unwrap();
    mov.set_operand_unsigned("Rd", 3).unwrap();
    mov.set_operand_unsigned("imm", 77).unwrap();
    let decoded = set.decode(&mov.bytes).unwrap();
    assert_eq!(decoded.name(), "MOV");
}

#[test]
fn malformed_descriptors_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();
    assert!(matches!(
        InstructionSet::load_dir("90", dir.path()),
        Err(gputrace_isa::Error::DescriptorParse { .. })
    ));
}

#[test]
fn overlapping_fields_fail_validation() {
    let set = demo_instruction_set();
    let mut def = (**set.defs().next().unwrap()).clone();
    // Make a field collide with the opcode bits.
    def.fields.insert(
        "clash".to_string(),
        gputrace_isa::FieldAttr::new(vec![(4, 12)]),
    );
    assert!(matches!(
        InstructionSet::from_defs("90", vec![def]),
        Err(gputrace_isa::Error::OverlappingFields { .. })
    ));
}
