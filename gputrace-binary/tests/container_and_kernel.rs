use gputrace_binary::testing::{
    build_container, build_machine_image, build_wrapped_container, EntrySpec, KernelSpec,
};
use gputrace_binary::{emit, is_arch_equal, split, unwrap_container, Kernel, MachineImage};
use gputrace_isa::testing::{assemble, build, demo_arch};
use gputrace_isa::{Arch, RegClass};

fn saxpy_like_code() -> Vec<u8> {
    let arch = demo_arch();
    let set = arch.instruction_set().clone();
    let isize = arch.word_size();

    // A small kernel with one conditional branch.
    let mut i0 = build(&set, "LDC");
    i0.set_operand_unsigned("Rd", 0).unwrap();
    i0.set_operand_unsigned("off", 0x160).unwrap();
    let mut i1 = build(&set, "ISETP");
    i1.set_operand_unsigned("Pd", 1).unwrap();
    i1.set_operand_unsigned("Ra", 0).unwrap();
    i1.set_operand_unsigned("Rb", 0).unwrap();
    let mut i2 = build(&set, "BRA");
    i2.set_operand_unsigned("Pg", 1).unwrap();
    let mut i3 = build(&set, "IADD3");
    i3.set_operand_unsigned("Rd", 2).unwrap();
    i3.set_operand_unsigned("Ra", 0).unwrap();
    i3.set_operand_unsigned("Rb", 0).unwrap();
    let i4 = build(&set, "EXIT");
    let mut instructions = vec![i0, i1, i2, i3, i4];
    arch.set_branch_target(2 * isize, &mut instructions[2], 4 * isize)
        .unwrap();
    assemble(&instructions)
}

#[test]
fn fat_container_splits_into_tagged_images() {
    let image80 = build_machine_image(
        "80",
        &[KernelSpec {
            name: "_Z1ki",
            code: saxpy_like_code(),
            param_sizes: vec![4],
        }],
    );
    let image90 = build_machine_image(
        "90",
        &[KernelSpec {
            name: "_Z1ki",
            code: saxpy_like_code(),
            param_sizes: vec![4],
        }],
    );
    let container = build_container(&[
        EntrySpec::machine("80", image80),
        EntrySpec::machine("90", image90),
    ]);

    let result = split(&container).unwrap();
    assert_eq!(result.machine_images.len(), 2);
    assert_eq!(result.machine_images[0].arch, "80");
    assert_eq!(result.machine_images[1].arch, "90");
    assert!(result.ir_images.is_empty());
}

#[test]
fn compressed_entries_inflate() {
    let image = build_machine_image(
        "90a",
        &[KernelSpec {
            name: "k",
            code: saxpy_like_code(),
            param_sizes: vec![],
        }],
    );
    let entry = EntrySpec {
        compress: true,
        ..EntrySpec::machine("90a", image.clone())
    };
    let container = build_container(&[entry]);

    let result = split(&container).unwrap();
    assert_eq!(result.machine_images.len(), 1);
    assert_eq!(result.machine_images[0].arch, "90a");
    assert_eq!(result.machine_images[0].bytes, image);
}

#[test]
fn ir_entries_are_exposed_separately() {
    let container = build_container(&[EntrySpec::ir("90", "//\n.version 8.3\n.target sm_90\n")]);
    let result = split(&container).unwrap();
    assert!(result.machine_images.is_empty());
    assert_eq!(result.ir_images.len(), 1);
    assert_eq!(result.ir_images[0].arch, "90");
}

#[test]
fn malformed_sub_image_does_not_poison_the_container() {
    let good = build_machine_image(
        "90",
        &[KernelSpec {
            name: "k",
            code: saxpy_like_code(),
            param_sizes: vec![],
        }],
    );
    let mut bad = good.clone();
    bad[4] = 9; // invalid ELF class
    let container = build_container(&[
        EntrySpec::machine("80", bad),
        EntrySpec::machine("90", good),
    ]);

    let result = split(&container).unwrap();
    assert_eq!(result.machine_images.len(), 1);
    assert_eq!(result.machine_images[0].arch, "90");
}

#[test]
fn wrapper_header_resolves_to_the_container() {
    let image = build_machine_image(
        "90",
        &[KernelSpec {
            name: "k",
            code: saxpy_like_code(),
            param_sizes: vec![],
        }],
    );
    let container = build_container(&[EntrySpec::machine("90", image)]);
    let wrapped = build_wrapped_container(&container);

    assert_eq!(unwrap_container(&wrapped).unwrap(), container);
    let result = split(&wrapped).unwrap();
    assert_eq!(result.machine_images.len(), 1);
}

#[test]
fn bare_elf_blob_with_trailing_noise_is_sized_from_headers() {
    let image = build_machine_image(
        "90",
        &[KernelSpec {
            name: "k",
            code: saxpy_like_code(),
            param_sizes: vec![],
        }],
    );
    // The driver hands over a pointer with no length; simulate by
    // appending garbage.
    let mut blob = image.clone();
    blob.extend_from_slice(&[0xa5; 256]);
    let recovered = unwrap_container(&blob).unwrap();
    assert_eq!(recovered, image);
}

#[test]
fn kernel_extraction_end_to_end() {
    let code = saxpy_like_code();
    let image_bytes = build_machine_image(
        "90",
        &[KernelSpec {
            name: "_Z5saxpyifPfS_",
            code: code.clone(),
            param_sizes: vec![4, 4, 8, 8],
        }],
    );
    let image = MachineImage {
        arch: "90".into(),
        bytes: image_bytes,
    };
    let arch = demo_arch();
    let kernel = Kernel::extract(&image, "_Z5saxpyifPfS_", &*arch).unwrap();

    assert_eq!(kernel.instructions.len(), 5);
    assert_eq!(kernel.raw_bytes, code);
    assert_eq!(kernel.param_sizes, vec![4, 4, 8, 8]);
    assert_eq!(
        kernel.param_offsets,
        vec![0x160, 0x164, 0x168, 0x170]
    );
    assert_eq!(kernel.param_sizes_reversed, vec![8, 8, 4, 4]);
    // The conditional branch splits the code into three blocks.
    assert_eq!(kernel.cfg().blocks.len(), 3);
    assert!(is_arch_equal(&kernel.arch, "90a", true));

    // Liveness is computed lazily and is stable across queries.
    let entry_in = kernel.live_in(0, RegClass::General);
    assert_eq!(kernel.live_in(0, RegClass::General), entry_in);

    assert!(matches!(
        Kernel::extract(&image, "missing", &*arch),
        Err(gputrace_binary::Error::SymbolNotFound(_))
    ));
}

#[test]
fn extract_all_finds_every_kernel() {
    let image_bytes = build_machine_image(
        "90",
        &[
            KernelSpec {
                name: "alpha",
                code: saxpy_like_code(),
                param_sizes: vec![8],
            },
            KernelSpec {
                name: "beta",
                code: saxpy_like_code(),
                param_sizes: vec![],
            },
        ],
    );
    let image = MachineImage {
        arch: "90".into(),
        bytes: image_bytes,
    };
    let arch = demo_arch();
    let kernels = Kernel::extract_all(&image, &*arch).unwrap();
    let mut names: Vec<&str> = kernels.iter().map(|k| k.mangled_name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["alpha", "beta"]);
}

#[test]
fn rewritten_image_reparses_with_grown_text() {
    let arch = demo_arch();
    let set = arch.instruction_set().clone();

    let image_bytes = build_machine_image(
        "90",
        &[
            KernelSpec {
                name: "k",
                code: saxpy_like_code(),
                param_sizes: vec![4],
            },
            // A second section after the target, to prove downstream
            // bytes survive the shift.
            KernelSpec {
                name: "tail",
                code: assemble(&[build(&set, "NOP"), build(&set, "EXIT")]),
                param_sizes: vec![],
            },
        ],
    );

    // Grow k's text by three instruction words.
    let mut new_code = saxpy_like_code();
    new_code.extend_from_slice(&assemble(&[
        build(&set, "NOP"),
        build(&set, "NOP"),
        build(&set, "NOP"),
    ]));

    let rewritten = emit::replace_section(&image_bytes, ".text.k", &new_code).unwrap();

    let image = MachineImage {
        arch: "90".into(),
        bytes: rewritten,
    };
    let kernel = Kernel::extract(&image, "k", &*arch).unwrap();
    assert_eq!(kernel.raw_bytes, new_code);
    assert_eq!(kernel.instructions.len(), 8);

    // The untouched kernel still parses bit-identically.
    let tail = Kernel::extract(&image, "tail", &*arch).unwrap();
    assert_eq!(tail.instructions.len(), 2);
    assert_eq!(tail.param_sizes, Vec::<u64>::new());
}
