//! The dynamic-instrumentation engine.
//!
//! Given a parsed kernel and a recipe, the engine allocates scratch
//! registers, splices the recipe's instruction sequences in front of the
//! chosen pcs, re-emits a loadable machine image, launches it with the
//! extended parameter list, and collects the per-thread trace buffers
//! back into structured results.
//!
//! Everything up to the launch is a pure function of immutable parsed
//! state; a failure there leaves the kernel untouched and the original
//! launch proceeds unmodified. Failures after the launch mark the
//! context as collected-with-errors and release what they can.

pub mod recipes;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use gputrace_binary::{emit, kernel::align_up, Kernel, PARAM_BASE_OFFSET};
use gputrace_isa::{AccessDir, Arch, Instruction, RegClass};
use serde_json::Value;

use crate::driver::{DevicePtr, DriverApi, FuncAttribute, LaunchParam, LaunchRequest};
use crate::error::Error;

/// Trace results: panel name -> key -> value.
pub type TraceResults = BTreeMap<String, BTreeMap<String, Value>>;

/// Per-launch register allocation state.
///
/// Extra registers extend the kernel's register budget past the highest
/// used index; reused registers borrow an existing index that liveness
/// proves dead across the instrumented span. Every allocation decision
/// is logged per register so later allocations honor earlier ones.
pub struct RegAllocator<'k> {
    kernel: &'k Kernel,
    omit_largest: bool,
    used: BTreeMap<RegClass, BTreeSet<u64>>,
    extra: BTreeMap<RegClass, BTreeSet<u64>>,
    reused: Vec<(RegClass, u64, u64, u64)>,
    op_log: BTreeMap<(RegClass, u64), Vec<(u64, String)>>,
}

impl<'k> RegAllocator<'k> {
    pub fn new(kernel: &'k Kernel) -> Self {
        // Compilers sometimes reserve the largest used index; skipping it
        // when sizing the register budget matches what they report.
        Self::with_omit_largest(kernel, true)
    }

    pub fn with_omit_largest(kernel: &'k Kernel, omit_largest: bool) -> Self {
        RegAllocator {
            kernel,
            omit_largest,
            used: BTreeMap::new(),
            extra: BTreeMap::new(),
            reused: Vec::new(),
            op_log: BTreeMap::new(),
        }
    }

    fn used_for(&mut self, class: RegClass) -> &BTreeSet<u64> {
        self.used
            .entry(class)
            .or_insert_with(|| self.kernel.used_registers(class))
    }

    /// Highest used register index of the class, honoring the
    /// omit-largest rule.
    pub fn max_used(&mut self, class: RegClass) -> Option<u64> {
        let omit = self.omit_largest;
        let used = self.used_for(class);
        let mut iter = used.iter().rev();
        if omit {
            iter.next();
        }
        iter.next().copied().or_else(|| {
            if omit {
                None
            } else {
                used.iter().next_back().copied()
            }
        })
    }

    /// Allocate `n` consecutive registers beyond everything the kernel
    /// (and earlier allocations) use.
    pub fn alloc_extra(&mut self, class: RegClass, n: u64) -> Result<Vec<u64>, Error> {
        let base = self.max_used(class).map(|max| max + 1).unwrap_or(0);
        let extra_base = self
            .extra
            .get(&class)
            .and_then(|set| set.iter().next_back())
            .map(|&max| max + 1)
            .unwrap_or(0);
        let start = base.max(extra_base);

        let top = class.max_alloc_index();
        if n == 0 || start + n - 1 > top {
            return Err(Error::RegisterCapacity {
                class,
                wanted: n,
                available: (top + 1).saturating_sub(start),
            });
        }
        let indices: Vec<u64> = (start..start + n).collect();
        self.extra.entry(class).or_default().extend(&indices);
        Ok(indices)
    }

    /// Borrow an existing register that is dead across
    /// `[start_pc, end_pc]` and not spoken for by an earlier allocation.
    pub fn alloc_reused(
        &mut self,
        class: RegClass,
        start_pc: u64,
        end_pc: u64,
    ) -> Result<u64, Error> {
        let live = self.kernel.live_across(start_pc, end_pc, class);
        let extras = self.extra.get(&class).cloned().unwrap_or_default();
        for candidate in 0..=class.max_alloc_index() {
            if live.contains(&candidate) || extras.contains(&candidate) {
                continue;
            }
            let reserved = self.reused.iter().any(|&(c, s, e, reg)| {
                c == class && reg == candidate && s <= end_pc && e >= start_pc
            });
            if reserved {
                continue;
            }
            let logged_inside = self
                .op_log
                .get(&(class, candidate))
                .is_some_and(|ops| ops.iter().any(|&(pc, _)| pc >= start_pc && pc <= end_pc));
            if logged_inside {
                continue;
            }
            self.reused.push((class, start_pc, end_pc, candidate));
            return Ok(candidate);
        }
        Err(Error::NoFreeRegisterInSpan {
            class,
            start_pc,
            end_pc,
        })
    }

    /// Log an instrumented instruction's access to an allocated
    /// register.
    pub fn record_operation(&mut self, class: RegClass, reg: u64, pc: u64, dir: AccessDir) {
        let op = match dir {
            AccessDir::Read => "r",
            AccessDir::Write => "w",
            AccessDir::ReadWrite => "rw",
            AccessDir::None => "-",
        };
        self.op_log
            .entry((class, reg))
            .or_default()
            .push((pc, op.to_string()));
    }

    pub fn operations(&self, class: RegClass, reg: u64) -> &[(u64, String)] {
        self.op_log
            .get(&(class, reg))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of extra registers allocated for the class.
    pub fn extra_count(&self, class: RegClass) -> u64 {
        self.extra.get(&class).map(|set| set.len() as u64).unwrap_or(0)
    }
}

/// One instrumentation point: a sequence inserted immediately before the
/// instruction at `pc`. When several points land on the same pc, higher
/// priority splices closer to the original instruction.
#[derive(Clone)]
pub struct SplicePoint {
    pub pc: u64,
    pub priority: i32,
    pub instructions: Vec<Instruction>,
}

/// The rewritten instruction stream.
pub struct SplicedProgram {
    pub instructions: Vec<Instruction>,
    /// Old instruction pc -> new pc.
    pub pc_map: BTreeMap<u64, u64>,
    pub code: Vec<u8>,
    pub inserted_count: usize,
}

/// Insert instrumentation sequences into a kernel's instruction list,
/// patching every branch whose displacement the insertions changed.
pub fn splice(
    kernel: &Kernel,
    arch: &dyn Arch,
    points: Vec<SplicePoint>,
) -> Result<SplicedProgram, Error> {
    let mut grouped: BTreeMap<u64, Vec<SplicePoint>> = BTreeMap::new();
    for point in points {
        if kernel.instruction_index_at(point.pc).is_none() {
            return Err(Error::SpliceAtBadPc {
                kernel: kernel.mangled_name.clone(),
                pc: point.pc,
            });
        }
        grouped.entry(point.pc).or_default().push(point);
    }
    for group in grouped.values_mut() {
        // Ascending priority: the highest-priority sequence ends up
        // adjacent to the original instruction.
        group.sort_by_key(|point| point.priority);
    }

    let mut instructions = Vec::with_capacity(kernel.instructions.len());
    // (position in new list, old pc) of every original instruction.
    let mut originals = Vec::with_capacity(kernel.instructions.len());
    let mut inserted_count = 0;
    for (index, instr) in kernel.instructions.iter().enumerate() {
        let old_pc = kernel.pc_of(index);
        if let Some(group) = grouped.get(&old_pc) {
            for point in group {
                inserted_count += point.instructions.len();
                instructions.extend(point.instructions.iter().cloned());
            }
        }
        originals.push((instructions.len(), old_pc));
        instructions.push(instr.clone());
    }

    // New pcs are cumulative over the rewritten list.
    let mut new_pcs = Vec::with_capacity(instructions.len());
    let mut pc = 0u64;
    for instr in &instructions {
        new_pcs.push(pc);
        pc += instr.size();
    }
    let pc_map: BTreeMap<u64, u64> = originals
        .iter()
        .map(|&(position, old_pc)| (old_pc, new_pcs[position]))
        .collect();

    // Re-aim every original direct branch through the pc map. Absolute
    // semantics are preserved; only displacements change.
    for &(position, old_pc) in &originals {
        let instr = &instructions[position];
        let Some(old_target) = arch.branch_target(old_pc, instr) else {
            continue;
        };
        let new_target = *pc_map.get(&old_target).ok_or(Error::SpliceAtBadPc {
            kernel: kernel.mangled_name.clone(),
            pc: old_target,
        })?;
        let new_pc = new_pcs[position];
        arch.set_branch_target(new_pc, &mut instructions[position], new_target)?;
    }

    let mut code = Vec::with_capacity(instructions.len() * arch.word_size() as usize);
    for instr in &instructions {
        code.extend_from_slice(&instr.bytes);
    }

    Ok(SplicedProgram {
        instructions,
        pc_map,
        code,
        inserted_count,
    })
}

/// Constant-bank offset of the `index`-th appended launch parameter.
///
/// Appended parameters are 8-byte slots packed after the kernel's own
/// parameter block.
pub fn added_param_offset(kernel: &Kernel, index: u64) -> u64 {
    align_up(PARAM_BASE_OFFSET + kernel.param_block_size, 8) + index * 8
}

/// What a recipe wants done to a kernel.
pub struct RecipePlan {
    pub splice_points: Vec<SplicePoint>,
    /// Device scratch buffers to allocate and pass as appended pointer
    /// parameters, in order.
    pub scratch_sizes: Vec<u64>,
    /// Scalar parameters appended after the scratch pointers.
    pub scalar_params: Vec<Vec<u8>>,
    pub added_shared_memory: u64,
    /// Recipe-private data carried through to `collect`.
    pub metadata: Value,
}

/// A named instrumentation strategy: a pure function from a kernel to
/// splice points and scratch requirements, plus the decoder for the
/// buffers that come back.
pub trait Recipe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Splice priority relative to other recipes at the same pc.
    fn priority(&self) -> i32 {
        0
    }

    fn plan(
        &self,
        kernel: &Kernel,
        arch: &dyn Arch,
        alloc: &mut RegAllocator<'_>,
        launch: &LaunchRequest,
    ) -> Result<RecipePlan, Error>;

    fn collect(
        &self,
        kernel: &Kernel,
        plan: &RecipePlan,
        buffers: &[Vec<u8>],
        results: &mut TraceResults,
    ) -> Result<(), Error>;
}

/// Name-keyed recipe registry, populated at process start.
#[derive(Default)]
pub struct RecipeFactory {
    map: HashMap<String, Arc<dyn Recipe>>,
}

impl RecipeFactory {
    pub fn with_builtins() -> Self {
        let mut factory = RecipeFactory::default();
        factory.register(Arc::new(recipes::CountControlFlow));
        factory.register(Arc::new(recipes::TraceDmemStore));
        factory
    }

    pub fn register(&mut self, recipe: Arc<dyn Recipe>) {
        if self
            .map
            .insert(recipe.name().to_string(), recipe)
            .is_some()
        {
            log::warn!("recipe registered twice, keeping the last one");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Recipe>, Error> {
        self.map
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRecipe(name.to_string()))
    }
}

/// The transient per-launch instrumentation state and its results.
#[derive(Debug)]
pub struct InstrumentCtx {
    pub global_id: String,
    pub recipe: String,
    pub kernel_name: String,
    pub splice_pcs: Vec<u64>,
    pub inserted_instructions: usize,
    pub instrumented_image: Vec<u8>,
    pub added_shared_memory: u64,
    pub trace_results: TraceResults,
    /// Set when post-launch collection failed; earlier completed
    /// recipes on the same kernel are unaffected.
    pub error: Option<String>,
}

impl InstrumentCtx {
    pub fn serialize(&self) -> Value {
        serde_json::json!({
            "recipe": self.recipe.clone(),
            "kernel": self.kernel_name.clone(),
            "splice_pcs": self.splice_pcs.clone(),
            "inserted_instructions": self.inserted_instructions,
            "added_shared_memory": self.added_shared_memory,
            "results": self.trace_results.clone(),
            "error": self.error.clone(),
        })
    }
}

/// Run one recipe against one launch of a kernel.
///
/// `image_bytes` is the machine image the kernel was extracted from; the
/// instrumented variant is re-emitted from it and loaded as a fresh
/// module.
pub fn instrument_and_run(
    driver: &dyn DriverApi,
    arch: &dyn Arch,
    kernel: &Kernel,
    image_bytes: &[u8],
    recipe: &dyn Recipe,
    launch: &LaunchRequest,
) -> Result<InstrumentCtx, Error> {
    // Plan: registers, splice points, scratch shapes. Liveness fills in
    // lazily underneath the allocator.
    let mut alloc = RegAllocator::new(kernel);
    let plan = recipe.plan(kernel, arch, &mut alloc, launch)?;

    let spliced = splice(kernel, arch, plan.splice_points.clone())?;
    let splice_pcs: Vec<u64> = spliced.pc_map.keys().copied().collect();

    // Emit a loadable image with the rewritten text section.
    let text_section = format!(".text.{}", kernel.mangled_name);
    let image = emit::replace_section(image_bytes, &text_section, &spliced.code)
        .map_err(Error::Binary)?;
    gputrace_binary::elf::validate_elf(&image).map_err(Error::Binary)?;

    let mut ctx = InstrumentCtx {
        global_id: String::new(),
        recipe: recipe.name().to_string(),
        kernel_name: kernel.mangled_name.clone(),
        splice_pcs,
        inserted_instructions: spliced.inserted_count,
        instrumented_image: image,
        added_shared_memory: plan.added_shared_memory,
        trace_results: TraceResults::new(),
        error: None,
    };

    // Allocate and zero the scratch buffers.
    let mut scratch: Vec<(DevicePtr, u64)> = Vec::with_capacity(plan.scratch_sizes.len());
    for &size in &plan.scratch_sizes {
        let ptr = driver.alloc(size)?;
        if let Err(e) = driver.memset(ptr, 0, size) {
            release_scratch(driver, &scratch);
            let _ = driver.free(ptr);
            return Err(e.into());
        }
        scratch.push((ptr, size));
    }

    // Marshal the extended parameter array.
    let mut params = launch.params.clone();
    params.extend(scratch.iter().map(|&(ptr, _)| LaunchParam::Device(ptr)));
    params.extend(plan.scalar_params.iter().cloned().map(LaunchParam::Bytes));
    let shared_mem = launch.shared_mem_bytes as u64 + plan.added_shared_memory;

    // Load and launch the instrumented variant.
    let result = (|| -> Result<(), Error> {
        let module = driver.load_module(&ctx.instrumented_image)?;
        let function = driver.get_function(module, &kernel.mangled_name)?;

        if plan.added_shared_memory > 0 {
            let static_smem =
                driver.func_get_attribute(function, FuncAttribute::SharedSizeBytes)?;
            let max_dynamic =
                driver.func_get_attribute(function, FuncAttribute::MaxDynamicSharedSizeBytes)?;
            if shared_mem as i64 > max_dynamic {
                let device_limit = driver.device_max_shared_memory()?;
                if shared_mem as i64 + static_smem > device_limit {
                    return Err(Error::SharedMemoryExceeded {
                        wanted: shared_mem as i64 + static_smem,
                        limit: device_limit,
                    });
                }
                driver.func_set_attribute(
                    function,
                    FuncAttribute::MaxDynamicSharedSizeBytes,
                    shared_mem as i64,
                )?;
            }
        }

        driver.launch(
            function,
            launch.grid,
            launch.block,
            shared_mem as u32,
            launch.stream,
            &params,
        )?;
        driver.stream_synchronize(launch.stream)?;
        Ok(())
    })();
    if let Err(e) = result {
        release_scratch(driver, &scratch);
        return Err(e);
    }

    // Collection failures do not lose the context; they annotate it.
    let collected = (|| -> Result<(), Error> {
        let mut buffers = Vec::with_capacity(scratch.len());
        for (index, &(ptr, size)) in scratch.iter().enumerate() {
            let bytes = driver.copy_to_host(ptr, size)?;
            if bytes.len() as u64 != size {
                return Err(Error::ScratchSizeMismatch {
                    index,
                    got: bytes.len(),
                    want: size,
                });
            }
            buffers.push(bytes);
        }
        recipe.collect(kernel, &plan, &buffers, &mut ctx.trace_results)
    })();
    if let Err(e) = collected {
        log::warn!(
            "collection failed for recipe {} on {}: {e}",
            ctx.recipe,
            ctx.kernel_name
        );
        ctx.error = Some(format!("{e}"));
    }

    release_scratch(driver, &scratch);
    Ok(ctx)
}

fn release_scratch(driver: &dyn DriverApi, scratch: &[(DevicePtr, u64)]) {
    for &(ptr, _) in scratch {
        if let Err(e) = driver.free(ptr) {
            log::warn!("leaked scratch buffer {ptr:#x}: {e}");
        }
    }
}
