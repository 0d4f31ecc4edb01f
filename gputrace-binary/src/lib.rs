//! GPU binary parsing and kernel analysis for the gputrace profiler.
//!
//! This crate turns the byte blobs a GPU driver loads into analyzable
//! kernels:
//!
//!   - [`container`] demultiplexes a driver blob into per-architecture
//!     machine-code images and IR images, inflating LZ4-compressed
//!     sub-images and validating each ELF.
//!   - [`Kernel::extract`] locates one kernel inside a machine image by
//!     its mangled name, decodes its instruction stream through an
//!     [`gputrace_isa::Arch`], builds the control-flow graph, reads the
//!     parameter records, and attaches DWARF source-line info.
//!   - [`liveness`] computes per-block register define/use and the
//!     live-in/live-out fixpoint the instrumentation register allocator
//!     depends on.
//!   - [`emit`] re-emits an image with a rewritten text section,
//!     preserving every unrelated byte.
//!
//! Images and kernels are immutable once parsed; the one exception is
//! the lazily filled liveness cache inside [`Kernel`], which is
//! idempotent and internally locked.

pub mod cfg;
pub mod container;
pub mod debug_line;
pub mod demangle;
pub mod elf;
pub mod emit;
mod error;
mod image;
pub mod kernel;
pub mod liveness;
pub mod lz4;
#[cfg(feature = "test-helpers")]
pub mod testing;

pub use cfg::{BasicBlock, Cfg, CfgEdge};
pub use container::{split, unwrap_container, BlobKind, SplitContainer};
pub use debug_line::{DebugInfo, DebugLineMeta};
pub use error::Error;
pub use image::{is_arch_equal, ImageSummary, IrImage, MachineImage};
pub use kernel::{param_layout, Kernel, ParamInfo, PARAM_BASE_OFFSET};
pub use liveness::{ClassLiveness, DefineUse};
