//! The capsule: the per-process tracer instance.
//!
//! Interception callbacks land here on arbitrary application threads.
//! The capsule feeds the module registry, matches launches against the
//! registered trace tasks, runs the instrumentation engine, and emits
//! the results to the scheduler transport. Nothing on this path may
//! fail the host application: every handler degrades to a warning plus
//! an `error` annotation on the emitted event.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use gputrace_binary::demangle::demangle_any;
use gputrace_isa::Arch;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::driver::{
    CheckpointOps, DriverApi, FuncAttribute, FunctionHandle, LaunchRequest, LibraryHandle,
    ModuleHandle, Profiler,
};
use crate::error::Error;
use crate::instrument::{instrument_and_run, InstrumentCtx, RecipeFactory};
use crate::registry::ModuleRegistry;
use crate::trace::{TraceTask, TraceTaskFactory};
use crate::transport::{row, Transport};

/// The environment flag forwarded verbatim to the driver at startup.
pub const HW_COREDUMP_ENV: &str = "GPUTRACE_HW_COREDUMP";

pub struct CapsuleConfig {
    /// Name used in trace global ids.
    pub name: String,
}

pub struct Capsule {
    name: String,
    driver: Arc<dyn DriverApi>,
    transport: Arc<dyn Transport>,
    profiler: Mutex<Option<Arc<dyn Profiler>>>,
    checkpoint: Mutex<Option<Arc<dyn CheckpointOps>>>,
    arch: Arc<dyn Arch>,
    registry: ModuleRegistry,
    recipes: RecipeFactory,
    task_factory: TraceTaskFactory,
    tasks: Mutex<Vec<Arc<TraceTask>>>,
    /// Deduplicated instrumentation contexts, keyed by
    /// `(recipe, kernel-name@arch)`.
    instrument_cache: Mutex<FxHashMap<(String, String), Arc<InstrumentCtx>>>,
    /// Serializes instrumented execution against checkpoint/restore.
    exec_lock: Mutex<()>,
    trace_seq: AtomicU64,
}

impl Capsule {
    pub fn new(
        config: CapsuleConfig,
        driver: Arc<dyn DriverApi>,
        transport: Arc<dyn Transport>,
        arch: Arc<dyn Arch>,
    ) -> Result<Arc<Self>, Error> {
        if let Ok(value) = std::env::var(HW_COREDUMP_ENV) {
            if let Err(e) = driver.enable_hw_coredump(&value) {
                log::warn!("failed to forward {HW_COREDUMP_ENV}={value}: {e}");
            }
        }
        Ok(Arc::new(Capsule {
            name: config.name,
            driver,
            transport,
            profiler: Mutex::new(None),
            checkpoint: Mutex::new(None),
            arch,
            registry: ModuleRegistry::new(),
            recipes: RecipeFactory::with_builtins(),
            task_factory: TraceTaskFactory::with_builtins(),
            tasks: Mutex::new(Vec::new()),
            instrument_cache: Mutex::new(FxHashMap::default()),
            exec_lock: Mutex::new(()),
            trace_seq: AtomicU64::new(0),
        }))
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn attach_profiler(&self, profiler: Arc<dyn Profiler>) {
        *self.profiler.lock().unwrap() = Some(profiler);
    }

    pub fn attach_checkpoint_ops(&self, ops: Arc<dyn CheckpointOps>) {
        *self.checkpoint.lock().unwrap() = Some(ops);
    }

    /// Instantiate a trace task by type name and register it. The
    /// `match_pattern` metadata entry selects the kernels it fires on.
    pub fn add_trace_task(
        &self,
        task_type: &str,
        metadata: &[(&str, Value)],
    ) -> Result<(), Error> {
        let mut task = self.task_factory.create(task_type)?;
        for (key, value) in metadata {
            task.set_metadata(key, value.clone())?;
        }
        self.tasks.lock().unwrap().push(Arc::new(task));
        Ok(())
    }

    /* ---------------- interception callbacks ---------------- */

    pub fn on_library_load(&self, library: LibraryHandle, bytes: &[u8]) {
        if let Err(e) = self.registry.cache_library(library, bytes) {
            log::warn!("failed to cache library {library:#x}: {e}");
        }
    }

    pub fn on_module_load(&self, module: ModuleHandle, bytes: &[u8]) {
        let result = self
            .driver
            .current_context()
            .map_err(Error::from)
            .and_then(|context| self.registry.cache_module(context, module, bytes));
        if let Err(e) = result {
            log::warn!("failed to cache module {module:#x}: {e}");
        }
    }

    pub fn on_module_from_library(&self, module: ModuleHandle, library: LibraryHandle) {
        match self.driver.current_context() {
            Ok(context) => self.registry.link_module_to_library(context, module, library),
            Err(e) => log::warn!("failed to record module-library link: {e}"),
        }
    }

    pub fn on_function_resolved(
        &self,
        function: FunctionHandle,
        module: ModuleHandle,
        name: &str,
    ) {
        match self.driver.current_context() {
            Ok(context) => {
                self.registry
                    .link_function_to_module(context, function, module, name)
            }
            Err(e) => log::warn!("failed to record function-module link: {e}"),
        }
    }

    /// Handle an intercepted launch. Never fails the host: the original
    /// launch always proceeds, with any tracer trouble logged and
    /// annotated on the emitted events.
    pub fn on_launch(&self, launch: &LaunchRequest) {
        if let Err(e) = self.handle_launch(launch) {
            log::warn!(
                "trace handling failed for launch of function {:#x}: {e}",
                launch.function
            );
        }
    }

    /* ---------------- orchestration ---------------- */

    fn handle_launch(&self, launch: &LaunchRequest) -> Result<(), Error> {
        let tasks: Vec<Arc<TraceTask>> = self.tasks.lock().unwrap().clone();
        if tasks.is_empty() {
            return Ok(());
        }

        let context = self.driver.current_context()?;
        let mangled = self.registry.function_name(context, launch.function)?;
        let demangled = demangle_any(&mangled);

        let matching: Vec<Arc<TraceTask>> = tasks
            .into_iter()
            .filter(|task| task.needs_trace(&demangled))
            .collect();
        if matching.is_empty() {
            return Ok(());
        }

        let device_arch = self.driver.device_arch()?;
        let resolved =
            self.registry
                .resolve_function(context, launch.function, &device_arch, &*self.arch);
        if let Ok(resolved) = &resolved {
            self.report_kernel_overview(launch.function, resolved.kernel.arch.as_str(), &mangled);
        }

        for task in matching {
            let seq = self.trace_seq.fetch_add(1, Ordering::Relaxed);
            let global_id = format!(
                "capsule-{}-thread-{}-kernel-{:#x}-trace-{}",
                self.name,
                thread_tag(),
                launch.function,
                seq
            );

            let mut contexts: BTreeMap<String, Arc<InstrumentCtx>> = BTreeMap::new();
            let mut new_children: Vec<Arc<InstrumentCtx>> = Vec::new();
            let mut task_error: Option<String> = None;

            match &resolved {
                Err(e) => {
                    task_error = Some(format!("{}: {e}", e.kind_str()));
                }
                Ok(resolved) => {
                    for (child_index, recipe_name) in task.recipes().iter().enumerate() {
                        let cache_key = (
                            recipe_name.clone(),
                            format!("{}@{}", resolved.kernel.mangled_name, resolved.kernel.arch),
                        );
                        if let Some(existing) =
                            self.instrument_cache.lock().unwrap().get(&cache_key)
                        {
                            contexts.insert(recipe_name.clone(), existing.clone());
                            continue;
                        }

                        let outcome = self.recipes.get(recipe_name).and_then(|recipe| {
                            let _exec = self.exec_lock.lock().unwrap();
                            instrument_and_run(
                                &*self.driver,
                                &*self.arch,
                                &resolved.kernel,
                                &resolved.image().bytes,
                                &*recipe,
                                launch,
                            )
                        });
                        match outcome {
                            Ok(mut ctx) => {
                                ctx.global_id = format!("{global_id}-childtrace[{child_index}]");
                                let ctx = Arc::new(ctx);
                                self.instrument_cache
                                    .lock()
                                    .unwrap()
                                    .insert(cache_key, ctx.clone());
                                contexts.insert(recipe_name.clone(), ctx.clone());
                                new_children.push(ctx);
                            }
                            Err(e) => {
                                log::warn!(
                                    "failed to execute instrumentation context: \
                                     recipe({recipe_name}), kernel({demangled}), error({e})"
                                );
                                task_error = Some(format!("{}: {e}", e.kind_str()));
                                break;
                            }
                        }
                    }
                }
            }

            self.emit_trace_events(&global_id, &demangled, &task, &contexts, &new_children, task_error);
        }
        Ok(())
    }

    fn emit_trace_events(
        &self,
        global_id: &str,
        target: &str,
        task: &TraceTask,
        contexts: &BTreeMap<String, Arc<InstrumentCtx>>,
        new_children: &[Arc<InstrumentCtx>],
        task_error: Option<String>,
    ) {
        let mut parent_row = row(&[
            ("global_id", global_id),
            ("target", target),
            ("type", task.task_type()),
        ]);
        if let Some(error) = &task_error {
            parent_row.insert("error".to_string(), error.clone());
        }
        self.transport.insert_row("mgnt_trace", parent_row);

        let mut payload = task.serialize(global_id, contexts);
        if let Some(error) = &task_error {
            payload["error"] = json!(error);
        }
        self.transport.write_kv(&format!("/trace/{global_id}"), payload);

        for child in new_children {
            self.transport.insert_row(
                "mgnt_trace_childtrace",
                row(&[
                    ("global_id", global_id),
                    ("child_global_id", &child.global_id),
                ]),
            );
            let mut child_row = row(&[
                ("global_id", &child.global_id),
                ("target", target),
                ("type", &child.recipe),
            ]);
            if let Some(error) = &child.error {
                child_row.insert("error".to_string(), error.clone());
            }
            self.transport.insert_row("mgnt_trace", child_row);
            self.transport
                .write_kv(&format!("/trace/{}", child.global_id), child.serialize());
        }
    }

    fn report_kernel_overview(&self, function: FunctionHandle, arch: &str, mangled: &str) {
        self.transport.insert_row(
            "mgnt_kernel_overview",
            row(&[
                ("mangled_name", mangled),
                ("function", &format!("{:#x}", function)),
                ("arch", arch),
            ]),
        );
    }

    /// Query the driver for a function's static attributes and forward
    /// them to the transport.
    pub fn report_function_attributes(&self, function: FunctionHandle) -> Result<(), Error> {
        let context = self.driver.current_context()?;
        let mangled = self.registry.function_name(context, function)?;

        let attr = |attribute| self.driver.func_get_attribute(function, attribute);
        let payload = json!({
            "mangled_name": mangled.clone(),
            "demangled_name": demangle_any(&mangled),
            "num_regs": attr(FuncAttribute::NumRegs)?,
            "static_smem_bytes": attr(FuncAttribute::SharedSizeBytes)?,
            "const_bytes": attr(FuncAttribute::ConstSizeBytes)?,
            "local_bytes": attr(FuncAttribute::LocalSizeBytes)?,
            "ptx_version": attr(FuncAttribute::PtxVersion)?,
            "sass_version": attr(FuncAttribute::BinaryVersion)?,
            "max_threads_per_block": attr(FuncAttribute::MaxThreadsPerBlock)?,
        });
        self.transport
            .write_kv(&format!("/kernel/{:#x}", function), payload);
        Ok(())
    }

    /* ---------------- hardware profiling ---------------- */

    /// Drive the hardware profiler across repeated launches of the
    /// original kernel and merge the per-repeat samples.
    pub fn run_pc_sampling(&self, launch: &LaunchRequest, repeats: u64) -> Result<Value, Error> {
        let profiler = self
            .profiler
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ProfilerUnavailable)?;

        let _exec = self.exec_lock.lock().unwrap();
        let mut per_repeat = Vec::with_capacity(repeats as usize);
        for _ in 0..repeats.max(1) {
            profiler.start()?;
            self.driver.launch(
                launch.function,
                launch.grid,
                launch.block,
                launch.shared_mem_bytes,
                launch.stream,
                &launch.params,
            )?;
            self.driver.stream_synchronize(launch.stream)?;
            profiler.stop()?;
            per_repeat.push(profiler.get_samples()?);
        }
        Ok(merge_sample_maps(&per_repeat))
    }

    /* ---------------- checkpoint / restore ---------------- */

    pub fn checkpoint(&self) -> Result<(), Error> {
        let ops = self
            .checkpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::CheckpointUnavailable)?;
        let context = self.driver.current_context()?;
        // Mutually exclusive with instrumented launches on this capsule.
        let _exec = self.exec_lock.lock().unwrap();
        ops.checkpoint(context).map_err(Error::from)
    }

    pub fn restore(&self, pop: bool) -> Result<(), Error> {
        let ops = self
            .checkpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::CheckpointUnavailable)?;
        let context = self.driver.current_context()?;
        let _exec = self.exec_lock.lock().unwrap();
        ops.restore(context, pop).map_err(Error::from)
    }

    /// Drop all cached state. Scratch buffers are released per launch;
    /// anything left is the driver's to reclaim at context teardown.
    pub fn detach(&self) {
        self.instrument_cache.lock().unwrap().clear();
        self.tasks.lock().unwrap().clear();
        self.registry.clear();
    }
}

/// Merge two-level maps of numeric samples by summing leaves.
fn merge_sample_maps(samples: &[Value]) -> Value {
    let mut merged: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for sample in samples {
        let Some(outer) = sample.as_object() else {
            continue;
        };
        for (outer_key, inner) in outer {
            let Some(inner) = inner.as_object() else {
                continue;
            };
            let slot = merged.entry(outer_key.clone()).or_default();
            for (inner_key, value) in inner {
                *slot.entry(inner_key.clone()).or_default() += value.as_u64().unwrap_or(0);
            }
        }
    }
    serde_json::to_value(merged).unwrap_or(Value::Null)
}

/// A numeric tag for the current application thread, for global ids.
fn thread_tag() -> u64 {
    // ThreadId's Debug form is "ThreadId(n)".
    let label = format!("{:?}", std::thread::current().id());
    label
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

/* ---------------- process lifecycle ---------------- */

static CAPSULE: OnceLock<Mutex<Option<Arc<Capsule>>>> = OnceLock::new();

fn capsule_slot() -> &'static Mutex<Option<Arc<Capsule>>> {
    CAPSULE.get_or_init(|| Mutex::new(None))
}

/// Install the process-wide capsule. Run once when the interception
/// library is loaded.
pub fn init(capsule: Arc<Capsule>) -> Result<(), Error> {
    let _ = env_logger::Builder::from_default_env().try_init();
    let mut slot = capsule_slot().lock().unwrap();
    if slot.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    *slot = Some(capsule);
    Ok(())
}

/// The installed capsule, if any.
pub fn instance() -> Option<Arc<Capsule>> {
    capsule_slot().lock().unwrap().clone()
}

/// Tear down the process-wide capsule. Run once on unload.
pub fn shutdown() {
    let mut slot = capsule_slot().lock().unwrap();
    if let Some(capsule) = slot.take() {
        capsule.detach();
    }
}
