use gputrace_isa::RegClass;
use thiserror::Error;

use crate::driver::DriverError;

/// Broad policy class of an error, used when annotating emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bytes, bad sizes, empty ranges. Logged and returned.
    InvalidInput,
    /// A kernel/module/function/block the caller asked for is missing.
    NotFound,
    /// Parse prerequisites are not met yet (no matching architecture,
    /// no cached bytes). The orchestrator skips the recipe this launch.
    NotReady,
    /// The underlying driver API failed. Never propagated in a way that
    /// could take down the host application.
    SdkFailure,
    /// Invariant violation; a bug.
    Internal,
}

/// The error type used in this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Isa(#[from] gputrace_isa::Error),

    #[error(transparent)]
    Binary(#[from] gputrace_binary::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("No bytes cached for module {module:#x} (context {context:#x})")]
    ModuleNotCached { context: u64, module: u64 },

    #[error("Function {function:#x} was never linked to a module")]
    FunctionNotLinked { function: u64 },

    #[error("Function {function:#x} has no recorded name")]
    FunctionNameUnknown { function: u64 },

    #[error("No machine image matches device architecture {device_arch}")]
    NoMatchingImage { device_arch: String },

    #[error("Kernel {kernel} not found in any matching machine image")]
    KernelNotInImage { kernel: String },

    #[error(
        "Register file {class:?} exhausted: wanted {wanted} consecutive, {available} available"
    )]
    RegisterCapacity {
        class: RegClass,
        wanted: u64,
        available: u64,
    },

    #[error("No register of class {class:?} is free across [{start_pc:#x}, {end_pc:#x}]")]
    NoFreeRegisterInSpan {
        class: RegClass,
        start_pc: u64,
        end_pc: u64,
    },

    #[error("No instruction at pc {pc:#x} to splice before in {kernel}")]
    SpliceAtBadPc { kernel: String, pc: u64 },

    #[error("Unknown recipe {0}")]
    UnknownRecipe(String),

    #[error("Unknown trace task type {0}")]
    UnknownTraceTask(String),

    #[error("Recipe {recipe} cannot instrument {kernel}: {reason}")]
    RecipeNotApplicable {
        recipe: String,
        kernel: String,
        reason: String,
    },

    #[error(
        "Instrumented shared memory ({wanted} bytes) exceeds the device limit ({limit} bytes)"
    )]
    SharedMemoryExceeded { wanted: i64, limit: i64 },

    #[error("Scratch buffer {index} came back with {got} bytes, expected {want}")]
    ScratchSizeMismatch { index: usize, got: usize, want: u64 },

    #[error("Invalid match pattern {pattern}: {source}")]
    BadMatchPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("No hardware profiler is attached to this capsule")]
    ProfilerUnavailable,

    #[error("No checkpoint/restore hooks are attached to this capsule")]
    CheckpointUnavailable,

    #[error("Capsule is already initialized")]
    AlreadyInitialized,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Isa(e) => match e {
                gputrace_isa::Error::UnknownInstruction(_)
                | gputrace_isa::Error::UnknownOpcode { .. }
                | gputrace_isa::Error::UnknownOperand { .. }
                | gputrace_isa::Error::UnknownModifier { .. }
                | gputrace_isa::Error::UnknownField { .. } => ErrorKind::NotFound,
                gputrace_isa::Error::OverlappingFields { .. }
                | gputrace_isa::Error::InconsistentOpcodeField { .. } => ErrorKind::Internal,
                _ => ErrorKind::InvalidInput,
            },
            Error::Binary(e) => match e {
                gputrace_binary::Error::SymbolNotFound(_)
                | gputrace_binary::Error::SectionNotFound(_)
                | gputrace_binary::Error::NoInstructionAtPc { .. }
                | gputrace_binary::Error::NoBlockAtPc { .. } => ErrorKind::NotFound,
                gputrace_binary::Error::LeaderInsideInstruction { .. } => ErrorKind::Internal,
                _ => ErrorKind::InvalidInput,
            },
            Error::Driver(_) => ErrorKind::SdkFailure,
            Error::ModuleNotCached { .. }
            | Error::FunctionNotLinked { .. }
            | Error::FunctionNameUnknown { .. }
            | Error::NoMatchingImage { .. }
            | Error::KernelNotInImage { .. } => ErrorKind::NotReady,
            Error::SpliceAtBadPc { .. } => ErrorKind::Internal,
            Error::RegisterCapacity { .. }
            | Error::NoFreeRegisterInSpan { .. }
            | Error::RecipeNotApplicable { .. }
            | Error::SharedMemoryExceeded { .. }
            | Error::BadMatchPattern { .. } => ErrorKind::InvalidInput,
            Error::ScratchSizeMismatch { .. } => ErrorKind::SdkFailure,
            Error::UnknownRecipe(_) | Error::UnknownTraceTask(_) => ErrorKind::NotFound,
            Error::ProfilerUnavailable | Error::CheckpointUnavailable => ErrorKind::NotReady,
            Error::AlreadyInitialized => ErrorKind::InvalidInput,
        }
    }

    /// A compact name for the error variant, for event metadata.
    pub fn kind_str(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::NotReady => "NotReady",
            ErrorKind::SdkFailure => "SdkFailure",
            ErrorKind::Internal => "Internal",
        }
    }
}
