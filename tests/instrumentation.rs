use std::sync::Arc;

use gputrace::capsule::{Capsule, CapsuleConfig};
use gputrace::driver::{
    Dim3, DriverApi, FunctionHandle, LaunchParam, LaunchRequest, MockDriver, ModuleHandle,
    StreamHandle,
};
use gputrace::instrument::{
    instrument_and_run, splice, Recipe, RecipePlan, RegAllocator, SplicePoint, TraceResults,
};
use gputrace::transport::CaptureTransport;
use gputrace::Error;
use gputrace_binary::testing::{build_container, build_machine_image, EntrySpec, KernelSpec};
use gputrace_binary::{Kernel, MachineImage};
use gputrace_isa::testing::{assemble, build, demo_arch};
use gputrace_isa::{Arch, Instruction, RegClass};
use serde_json::json;

fn kernel_from_code(arch: &dyn Arch, name: &str, code: Vec<u8>, params: Vec<u32>) -> (Kernel, Vec<u8>) {
    let image_bytes = build_machine_image(
        "90",
        &[KernelSpec {
            name,
            code,
            param_sizes: params,
        }],
    );
    let image = MachineImage {
        arch: "90".into(),
        bytes: image_bytes.clone(),
    };
    (Kernel::extract(&image, name, arch).unwrap(), image_bytes)
}

/// The §4.6-style kernel used for the splice scenario: a branch at pc 0
/// over a straight-line body.
fn ten_instruction_kernel(arch: &dyn Arch) -> (Kernel, Vec<u8>) {
    let set = arch.instruction_set().clone();
    let isize = arch.word_size();
    let mut instructions: Vec<Instruction> = Vec::new();

    let mut bra = build(&set, "BRA");
    instructions.push(bra.clone());
    for i in 0..8u64 {
        let mut iadd = build(&set, "IADD3");
        iadd.set_operand_unsigned("Rd", 2 + i).unwrap();
        iadd.set_operand_unsigned("Ra", 0).unwrap();
        iadd.set_operand_unsigned("Rb", 1).unwrap();
        instructions.push(iadd);
    }
    instructions.push(build(&set, "EXIT"));
    // Branch from pc 0 to pc 8*isize: source before, target after the
    // insertion point used in the test.
    arch.set_branch_target(0, &mut bra, 8 * isize).unwrap();
    instructions[0] = bra;

    kernel_from_code(
        arch,
        "k",
        assemble(&instructions),
        vec![8],
    )
}

#[test]
fn extra_register_allocation_skips_the_largest_used_index() {
    let arch = demo_arch();
    let set = arch.instruction_set().clone();
    let mut iadd = build(&set, "IADD3");
    iadd.set_operand_unsigned("Rd", 200).unwrap();
    iadd.set_operand_unsigned("Ra", 4).unwrap();
    iadd.set_operand_unsigned("Rb", 5).unwrap();
    let code = assemble(&[iadd, build(&set, "EXIT")]);
    let (kernel, _) = kernel_from_code(&*arch, "k", code, vec![]);

    // R200 is treated as compiler-reserved; allocation starts above R5.
    let mut alloc = RegAllocator::new(&kernel);
    assert_eq!(
        alloc.alloc_extra(RegClass::General, 3).unwrap(),
        vec![6, 7, 8]
    );
    // Consecutive allocations continue past earlier ones.
    assert_eq!(alloc.alloc_extra(RegClass::General, 1).unwrap(), vec![9]);

    // Without the omit rule, allocation starts above R200.
    let mut strict = RegAllocator::with_omit_largest(&kernel, false);
    assert_eq!(
        strict.alloc_extra(RegClass::General, 2).unwrap(),
        vec![201, 202]
    );

    // The register file is finite.
    assert!(matches!(
        strict.alloc_extra(RegClass::General, 60),
        Err(Error::RegisterCapacity { .. })
    ));
}

#[test]
fn reused_registers_avoid_live_ranges_and_prior_reservations() {
    let arch = demo_arch();
    let set = arch.instruction_set().clone();
    let mut i0 = build(&set, "IADD3");
    i0.set_operand_unsigned("Rd", 1).unwrap();
    i0.set_operand_unsigned("Ra", 0).unwrap();
    i0.set_operand_unsigned("Rb", 0).unwrap();
    let mut i1 = build(&set, "IADD3");
    i1.set_operand_unsigned("Rd", 2).unwrap();
    i1.set_operand_unsigned("Ra", 1).unwrap();
    i1.set_operand_unsigned("Rb", 1).unwrap();
    let code = assemble(&[i0, i1, build(&set, "RET")]);
    let (kernel, _) = kernel_from_code(&*arch, "k", code, vec![]);

    let isize = kernel.word_size();
    let mut alloc = RegAllocator::new(&kernel);
    let first = alloc
        .alloc_reused(RegClass::General, 0, 2 * isize)
        .unwrap();
    assert_eq!(first, 3); // R0..R2 are touched in the span

    let second = alloc
        .alloc_reused(RegClass::General, isize, 2 * isize)
        .unwrap();
    assert_eq!(second, 4); // R3 is reserved for an overlapping span

    // A recorded operation also blocks the span it covers.
    alloc.record_operation(
        RegClass::General,
        5,
        isize,
        gputrace_isa::AccessDir::Write,
    );
    let third = alloc
        .alloc_reused(RegClass::General, 0, 2 * isize)
        .unwrap();
    assert_eq!(third, 6);
}

#[test]
fn splice_inserts_sequences_and_patches_branches() {
    let arch = demo_arch();
    let set = arch.instruction_set().clone();
    let isize = arch.word_size();
    let (kernel, image_bytes) = ten_instruction_kernel(&*arch);
    assert_eq!(kernel.instructions.len(), 10);

    let sequence: Vec<Instruction> = (0..3).map(|_| build(&set, "NOP")).collect();
    let spliced = splice(
        &kernel,
        &*arch,
        vec![SplicePoint {
            pc: 4 * isize,
            priority: 0,
            instructions: sequence,
        }],
    )
    .unwrap();

    // 10 + 3 instructions; the instruction that sat at 4*isize now sits
    // at 7*isize.
    assert_eq!(spliced.instructions.len(), 13);
    assert_eq!(spliced.pc_map[&(4 * isize)], 7 * isize);
    // Instructions before the insertion point keep their pcs.
    assert_eq!(spliced.pc_map[&(3 * isize)], 3 * isize);

    // The branch from pc 0 over the insertion point is re-aimed.
    let branch = &spliced.instructions[0];
    assert_eq!(arch.branch_target(0, branch), Some(11 * isize));

    // The re-emitted image is a valid ELF and re-parses into the same
    // structure.
    let rewritten =
        gputrace_binary::emit::replace_section(&image_bytes, ".text.k", &spliced.code).unwrap();
    let image = MachineImage {
        arch: "90".into(),
        bytes: rewritten,
    };
    let reparsed = Kernel::extract(&image, "k", &*arch).unwrap();
    assert_eq!(reparsed.instructions.len(), 13);
    assert_eq!(
        arch.branch_target(0, &reparsed.instructions[0]),
        Some(11 * isize)
    );
    assert_eq!(reparsed.instructions[7], kernel.instructions[4]);
}

#[test]
fn same_pc_points_splice_in_priority_order() {
    let arch = demo_arch();
    let set = arch.instruction_set().clone();
    let isize = arch.word_size();
    let (kernel, _) = ten_instruction_kernel(&*arch);

    let mut low = build(&set, "MOV");
    low.set_operand_unsigned("Rd", 10).unwrap();
    low.set_operand_unsigned("imm", 1).unwrap();
    let mut high = build(&set, "MOV");
    high.set_operand_unsigned("Rd", 11).unwrap();
    high.set_operand_unsigned("imm", 2).unwrap();

    let spliced = splice(
        &kernel,
        &*arch,
        vec![
            SplicePoint {
                pc: 2 * isize,
                priority: 1,
                instructions: vec![low.clone()],
            },
            SplicePoint {
                pc: 2 * isize,
                priority: 9,
                instructions: vec![high.clone()],
            },
        ],
    )
    .unwrap();

    // Higher priority sits closer to the original instruction.
    assert_eq!(spliced.instructions[2], low);
    assert_eq!(spliced.instructions[3], high);
    assert_eq!(spliced.instructions[4], kernel.instructions[2]);
}

struct SharedMemoryOnly {
    added: u64,
}

impl Recipe for SharedMemoryOnly {
    fn name(&self) -> &'static str {
        "test::shared_memory_only"
    }

    fn plan(
        &self,
        _kernel: &Kernel,
        _arch: &dyn Arch,
        _alloc: &mut RegAllocator<'_>,
        _launch: &LaunchRequest,
    ) -> Result<RecipePlan, Error> {
        Ok(RecipePlan {
            splice_points: Vec::new(),
            scratch_sizes: Vec::new(),
            scalar_params: Vec::new(),
            added_shared_memory: self.added,
            metadata: json!(null),
        })
    }

    fn collect(
        &self,
        _kernel: &Kernel,
        _plan: &RecipePlan,
        _buffers: &[Vec<u8>],
        _results: &mut TraceResults,
    ) -> Result<(), Error> {
        Ok(())
    }
}

fn plain_launch(function: FunctionHandle) -> LaunchRequest {
    LaunchRequest {
        function,
        grid: Dim3::new(4, 1, 1),
        block: Dim3::new(64, 1, 1),
        shared_mem_bytes: 0,
        stream: StreamHandle(1),
        params: vec![LaunchParam::Bytes(vec![0u8; 8])],
    }
}

#[test]
fn shared_memory_inflation_raises_the_function_attribute() {
    let arch = demo_arch();
    let (kernel, image_bytes) = ten_instruction_kernel(&*arch);
    let driver = MockDriver::new("90");

    // Above the default opt-in limit, below the device limit.
    let recipe = SharedMemoryOnly { added: 100 * 1024 };
    let ctx = instrument_and_run(
        &driver,
        &*arch,
        &kernel,
        &image_bytes,
        &recipe,
        &plain_launch(FunctionHandle(1)),
    )
    .unwrap();
    assert!(ctx.error.is_none());
    let launches = driver.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].shared_mem_bytes, 100 * 1024);

    // Beyond the device limit the recipe fails cleanly before launch.
    let recipe = SharedMemoryOnly { added: 512 * 1024 };
    assert!(matches!(
        instrument_and_run(
            &driver,
            &*arch,
            &kernel,
            &image_bytes,
            &recipe,
            &plain_launch(FunctionHandle(1)),
        ),
        Err(Error::SharedMemoryExceeded { .. })
    ));
    // No scratch or module leaked a launch.
    assert_eq!(driver.launches().len(), 1);
}

/* ---------------- capsule end-to-end ---------------- */

fn saxpy_code(arch: &dyn Arch) -> Vec<u8> {
    let set = arch.instruction_set().clone();
    let isize = arch.word_size();
    let mut i0 = build(&set, "LDC");
    i0.set_operand_unsigned("Rd", 0).unwrap();
    i0.set_operand_unsigned("off", 0x160).unwrap();
    let mut i1 = build(&set, "ISETP");
    i1.set_operand_unsigned("Pd", 1).unwrap();
    i1.set_operand_unsigned("Ra", 0).unwrap();
    i1.set_operand_unsigned("Rb", 0).unwrap();
    let mut i2 = build(&set, "BRA");
    i2.set_operand_unsigned("Pg", 1).unwrap();
    let mut i3 = build(&set, "STG");
    i3.set_memory_operand("desc", 0, 0).unwrap();
    i3.set_operand_unsigned("Rb", 0).unwrap();
    let i4 = build(&set, "EXIT");
    let mut instructions = vec![i0, i1, i2, i3, i4];
    arch.set_branch_target(2 * isize, &mut instructions[2], 4 * isize)
        .unwrap();
    assemble(&instructions)
}

fn capsule_fixture() -> (Arc<Capsule>, Arc<MockDriver>, Arc<CaptureTransport>) {
    let driver = Arc::new(MockDriver::new("90"));
    let transport = Arc::new(CaptureTransport::default());
    let arch = demo_arch();
    let capsule = Capsule::new(
        CapsuleConfig {
            name: "test".into(),
        },
        driver.clone(),
        transport.clone(),
        arch,
    )
    .unwrap();

    let image = build_machine_image(
        "90",
        &[KernelSpec {
            name: "_Z5saxpyifPfS_",
            code: saxpy_code(&*demo_arch()),
            param_sizes: vec![8],
        }],
    );
    let container = build_container(&[EntrySpec::machine("90", image)]);
    capsule.on_module_load(ModuleHandle(10), &container);
    capsule.on_function_resolved(FunctionHandle(100), ModuleHandle(10), "_Z5saxpyifPfS_");
    (capsule, driver, transport)
}

#[test]
fn launch_of_matching_kernel_is_instrumented_and_collected() {
    let (capsule, driver, transport) = capsule_fixture();
    capsule
        .add_trace_task("kernel:block_schedule", &[("match_pattern", json!("saxpy"))])
        .unwrap();

    // Play the instrumented kernel: fill the three block counters when
    // the launch happens. The scratch pointer is the first appended
    // parameter.
    driver.set_launch_hook(|driver, record| {
        if let Some(LaunchParam::Device(ptr)) = record.params.get(1) {
            for slot in 0u64..3 {
                driver.write_device_memory(*ptr, slot * 8, &(256 * (slot + 1)).to_le_bytes());
            }
        }
    });

    capsule.on_launch(&plain_launch(FunctionHandle(100)));

    // Exactly one instrumented launch, with the scratch pointer
    // appended after the original parameter.
    let launches = driver.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].name, "_Z5saxpyifPfS_");
    assert_eq!(launches[0].params.len(), 2);
    assert!(matches!(launches[0].params[1], LaunchParam::Device(_)));

    // Scratch was released after collection.
    assert_eq!(driver.live_allocation_count(), 0);

    // Parent and child rows, and the KV payload with the counts.
    let rows = transport.rows_for("mgnt_trace");
    assert_eq!(rows.len(), 2);
    assert!(rows[0]["global_id"].starts_with("capsule-test-thread-"));
    assert_eq!(rows[0]["type"], "kernel:block_schedule");
    assert_eq!(rows[0]["target"], "saxpy(int, float, float*, float*)");
    assert_eq!(rows[1]["type"], "sass::count_control_flow");
    assert!(rows[1]["global_id"].contains("childtrace[0]"));

    let relations = transport.rows_for("mgnt_trace_childtrace");
    assert_eq!(relations.len(), 1);

    let kv = transport.kv_for("/trace/");
    assert_eq!(kv.len(), 2);
    let parent_payload = &kv[0].1;
    let counts = &parent_payload["recipes"]["sass::count_control_flow"]["results"]
        ["block_execution_count"];
    assert_eq!(counts["0"]["count"], 256);
    assert_eq!(counts["1"]["count"], 512);
    assert_eq!(counts["2"]["count"], 768);
}

#[test]
fn second_launch_reuses_the_instrumentation_context() {
    let (capsule, driver, transport) = capsule_fixture();
    capsule
        .add_trace_task("kernel:block_schedule", &[("match_pattern", json!("saxpy"))])
        .unwrap();

    capsule.on_launch(&plain_launch(FunctionHandle(100)));
    capsule.on_launch(&plain_launch(FunctionHandle(100)));

    // The context was deduplicated: one instrumented launch total.
    assert_eq!(driver.launches().len(), 1);

    // Both launches emitted a parent event; only the first constructed
    // a child.
    let rows = transport.rows_for("mgnt_trace");
    assert_eq!(rows.len(), 3);
    assert_eq!(transport.rows_for("mgnt_trace_childtrace").len(), 1);
}

#[test]
fn non_matching_kernel_is_left_alone() {
    let (capsule, driver, transport) = capsule_fixture();
    capsule
        .add_trace_task("kernel:block_schedule", &[("match_pattern", json!("gemm"))])
        .unwrap();

    capsule.on_launch(&plain_launch(FunctionHandle(100)));
    assert!(driver.launches().is_empty());
    assert!(transport.rows_for("mgnt_trace").is_empty());
}

#[test]
fn unresolvable_kernel_annotates_the_event_and_proceeds() {
    let driver = Arc::new(MockDriver::new("80"));
    let transport = Arc::new(CaptureTransport::default());
    let capsule = Capsule::new(
        CapsuleConfig {
            name: "test".into(),
        },
        driver.clone(),
        transport.clone(),
        demo_arch(),
    )
    .unwrap();

    // Only a 90 image exists, but the device reports 80.
    let image = build_machine_image(
        "90",
        &[KernelSpec {
            name: "_Z5saxpyifPfS_",
            code: saxpy_code(&*demo_arch()),
            param_sizes: vec![8],
        }],
    );
    let container = build_container(&[EntrySpec::machine("90", image)]);
    capsule.on_module_load(ModuleHandle(10), &container);
    capsule.on_function_resolved(FunctionHandle(100), ModuleHandle(10), "_Z5saxpyifPfS_");
    capsule
        .add_trace_task("kernel:block_schedule", &[("match_pattern", json!("saxpy"))])
        .unwrap();

    capsule.on_launch(&plain_launch(FunctionHandle(100)));

    // No instrumented launch, but the event went out with an error
    // annotation.
    assert!(driver.launches().is_empty());
    let rows = transport.rows_for("mgnt_trace");
    assert_eq!(rows.len(), 1);
    assert!(rows[0]["error"].starts_with("NotReady"));

    let kv = transport.kv_for("/trace/");
    assert_eq!(kv.len(), 1);
    assert!(kv[0].1["error"].as_str().unwrap().starts_with("NotReady"));
}

struct FixedSampleProfiler;

impl gputrace::driver::Profiler for FixedSampleProfiler {
    fn start(&self) -> Result<(), gputrace::driver::DriverError> {
        Ok(())
    }
    fn stop(&self) -> Result<(), gputrace::driver::DriverError> {
        Ok(())
    }
    fn get_samples(&self) -> Result<serde_json::Value, gputrace::driver::DriverError> {
        Ok(json!({ "64": { "stall_wait": 5 } }))
    }
}

#[test]
fn pc_sampling_merges_repeat_launches() {
    let (capsule, driver, _transport) = capsule_fixture();
    capsule.attach_profiler(Arc::new(FixedSampleProfiler));

    // resolve_function is not needed; sampling drives the original
    // function handle.
    let function = {
        let module = driver.load_module(b"\x7fELF-not-parsed").unwrap();
        driver.get_function(module, "orig").unwrap()
    };
    let launch = plain_launch(function);
    let merged = capsule.run_pc_sampling(&launch, 4).unwrap();

    assert_eq!(driver.launches().len(), 4);
    assert_eq!(merged["64"]["stall_wait"], 20);

    // Without a profiler attached the call degrades cleanly.
    let (bare, ..) = capsule_fixture();
    assert!(matches!(
        bare.run_pc_sampling(&launch, 1),
        Err(Error::ProfilerUnavailable)
    ));
}

#[derive(Default)]
struct CountingCheckpoint {
    checkpoints: std::sync::atomic::AtomicU64,
    restores: std::sync::atomic::AtomicU64,
}

impl gputrace::driver::CheckpointOps for CountingCheckpoint {
    fn checkpoint(
        &self,
        _context: gputrace::driver::ContextHandle,
    ) -> Result<(), gputrace::driver::DriverError> {
        self.checkpoints
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
    fn restore(
        &self,
        _context: gputrace::driver::ContextHandle,
        _pop: bool,
    ) -> Result<(), gputrace::driver::DriverError> {
        self.restores
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn checkpoint_and_restore_round_trip_through_the_hooks() {
    let (capsule, _driver, _transport) = capsule_fixture();
    assert!(matches!(
        capsule.checkpoint(),
        Err(Error::CheckpointUnavailable)
    ));

    let ops = Arc::new(CountingCheckpoint::default());
    capsule.attach_checkpoint_ops(ops.clone());
    capsule.checkpoint().unwrap();
    capsule.restore(true).unwrap();
    assert_eq!(ops.checkpoints.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(ops.restores.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn function_attributes_are_forwarded_to_the_transport() {
    let (capsule, _driver, transport) = capsule_fixture();
    capsule
        .report_function_attributes(FunctionHandle(100))
        .unwrap();

    let kv = transport.kv_for("/kernel/");
    assert_eq!(kv.len(), 1);
    let payload = &kv[0].1;
    assert_eq!(payload["mangled_name"], "_Z5saxpyifPfS_");
    assert_eq!(
        payload["demangled_name"],
        "saxpy(int, float, float*, float*)"
    );
    assert_eq!(payload["num_regs"], 32);
    assert_eq!(payload["sass_version"], 90);
}

#[test]
fn store_tracing_records_per_site_results() {
    let (capsule, driver, transport) = capsule_fixture();
    capsule
        .add_trace_task("kernel:dmem_access", &[("match_pattern", json!("saxpy"))])
        .unwrap();

    driver.set_launch_hook(|driver, record| {
        if let Some(LaunchParam::Device(ptr)) = record.params.get(1) {
            // One store site: slot 0 holds (pc, address base).
            driver.write_device_memory(*ptr, 0, &48u64.to_le_bytes());
            driver.write_device_memory(*ptr, 8, &0xdead_0000u64.to_le_bytes());
        }
    });

    capsule.on_launch(&plain_launch(FunctionHandle(100)));

    let kv = transport.kv_for("/trace/");
    let payload = &kv[0].1;
    let stores = &payload["recipes"]["sass::trace_dmem_store"]["results"]["dmem_store"];
    let entry = &stores["0x30"];
    assert_eq!(entry["recorded_pc"], 48);
    assert_eq!(entry["address_base"], 0xdead_0000u64);
}
