//! GPU workload tracer.
//!
//! The capsule in this crate sits between a driver-interception layer
//! and the binary-analysis crates: it caches every module the driver
//! loads and lazily parses the kernels that actually launch. For
//! launches matching a registered trace task, it builds an instrumented
//! variant of the kernel, runs it, and ships the collected per-thread
//! trace results to the scheduler transport.
//!
//! The external world plugs in through four seams: [`driver::DriverApi`]
//! (the thin driver wrapper), [`driver::Profiler`] (hardware counters),
//! [`driver::CheckpointOps`] (device-memory checkpointing), and
//! [`transport::Transport`] (event delivery). All public entry points
//! are thread-safe and are called synchronously on the intercepting
//! thread, so driver ordering (load-before-use, module-before-function)
//! is preserved without reordering.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gputrace::capsule::{Capsule, CapsuleConfig};
//!
//! # fn main() -> Result<(), gputrace::Error> {
//! # let (driver, transport, arch): (Arc<dyn gputrace::driver::DriverApi>,
//! #     Arc<dyn gputrace::transport::Transport>,
//! #     Arc<dyn gputrace_isa::Arch>) = unimplemented!();
//! let capsule = Capsule::new(
//!     CapsuleConfig { name: "default".into() },
//!     driver,
//!     transport,
//!     arch,
//! )?;
//! capsule.add_trace_task(
//!     "kernel:block_schedule",
//!     &[("match_pattern", serde_json::json!("saxpy"))],
//! )?;
//! gputrace::capsule::init(capsule)?;
//! # Ok(())
//! # }
//! ```

pub mod capsule;
pub mod driver;
mod error;
pub mod instrument;
pub mod registry;
pub mod trace;
pub mod transport;

pub use capsule::{Capsule, CapsuleConfig};
pub use error::{Error, ErrorKind};
pub use instrument::{InstrumentCtx, Recipe, RecipeFactory, RecipePlan, RegAllocator, SplicePoint};
pub use registry::{ModuleRegistry, ResolvedKernel};
pub use trace::{TraceTask, TraceTaskFactory};

/// Load an [`gputrace_isa::InstructionSet`] from a descriptor directory
/// and wrap it in the metadata-driven architecture implementation.
pub fn load_arch(
    arch_tag: &str,
    isa_dir: &std::path::Path,
) -> Result<std::sync::Arc<gputrace_isa::MetadataArch>, Error> {
    let set = gputrace_isa::InstructionSet::load_dir(arch_tag, isa_dir)?;
    Ok(std::sync::Arc::new(gputrace_isa::MetadataArch::new(
        std::sync::Arc::new(set),
    )))
}
