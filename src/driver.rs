//! The driver seam.
//!
//! The interception layer wraps a real GPU driver; the core only ever
//! talks to it through [`DriverApi`]. Handles are opaque driver values,
//! kept as integers exactly as the hooks deliver them. The hardware
//! profiler and checkpoint/restore facilities are separate capabilities
//! with the same flavor.

use std::fmt;

use thiserror::Error;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

handle_type!(
    /// A driver context.
    ContextHandle
);
handle_type!(
    /// A loaded library.
    LibraryHandle
);
handle_type!(
    /// A loaded module.
    ModuleHandle
);
handle_type!(
    /// A resolved kernel function.
    FunctionHandle
);
handle_type!(
    /// A stream.
    StreamHandle
);
handle_type!(
    /// A device memory pointer.
    DevicePtr
);

/// A launch grid or block shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    pub fn count(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// One launch parameter, as marshalled to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchParam {
    /// A scalar value passed by bytes.
    Bytes(Vec<u8>),
    /// A device pointer.
    Device(DevicePtr),
}

/// The launch shape the interception layer observed.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub function: FunctionHandle,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
    pub stream: StreamHandle,
    pub params: Vec<LaunchParam>,
}

impl LaunchRequest {
    pub fn thread_count(&self) -> u64 {
        self.grid.count() * self.block.count()
    }
}

/// Queryable/settable function attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncAttribute {
    NumRegs,
    SharedSizeBytes,
    ConstSizeBytes,
    LocalSizeBytes,
    PtxVersion,
    BinaryVersion,
    MaxThreadsPerBlock,
    MaxDynamicSharedSizeBytes,
}

/// An error surfaced by the underlying driver API.
#[derive(Error, Debug, Clone)]
#[error("driver error {code}: {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        DriverError {
            code,
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// The thin wrapper around the GPU driver the core invokes.
pub trait DriverApi: Send + Sync {
    fn current_context(&self) -> DriverResult<ContextHandle>;

    /// Architecture tag of the current device, e.g. `"90"`.
    fn device_arch(&self) -> DriverResult<String>;

    fn device_max_shared_memory(&self) -> DriverResult<i64>;

    fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle>;

    fn unload_module(&self, module: ModuleHandle) -> DriverResult<()>;

    fn get_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle>;

    fn func_get_attribute(&self, func: FunctionHandle, attr: FuncAttribute) -> DriverResult<i64>;

    fn func_set_attribute(
        &self,
        func: FunctionHandle,
        attr: FuncAttribute,
        value: i64,
    ) -> DriverResult<()>;

    fn alloc(&self, size: u64) -> DriverResult<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> DriverResult<()>;

    fn memset(&self, ptr: DevicePtr, byte: u8, size: u64) -> DriverResult<()>;

    fn copy_to_host(&self, src: DevicePtr, size: u64) -> DriverResult<Vec<u8>>;

    fn launch(
        &self,
        func: FunctionHandle,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: StreamHandle,
        params: &[LaunchParam],
    ) -> DriverResult<()>;

    fn stream_synchronize(&self, stream: StreamHandle) -> DriverResult<()>;

    /// Forward the hardware-coredump environment flag verbatim.
    fn enable_hw_coredump(&self, value: &str) -> DriverResult<()>;
}

/// The hardware-counter profiler, driven as a black box.
pub trait Profiler: Send + Sync {
    fn start(&self) -> DriverResult<()>;
    fn stop(&self) -> DriverResult<()>;
    fn get_samples(&self) -> DriverResult<serde_json::Value>;
}

/// Checkpoint/restore of device memory, a stack per context.
pub trait CheckpointOps: Send + Sync {
    /// Capture current device memory onto the context's stack.
    fn checkpoint(&self, context: ContextHandle) -> DriverResult<()>;
    /// Restore to the top of the stack, optionally popping it.
    fn restore(&self, context: ContextHandle, pop: bool) -> DriverResult<()>;
}

#[cfg(feature = "test-helpers")]
pub use self::mock::{LaunchRecord, MockDriver};

#[cfg(feature = "test-helpers")]
mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// One recorded launch.
    #[derive(Debug, Clone)]
    pub struct LaunchRecord {
        pub function: FunctionHandle,
        pub module: ModuleHandle,
        pub name: String,
        pub grid: Dim3,
        pub block: Dim3,
        pub shared_mem_bytes: u32,
        pub stream: StreamHandle,
        pub params: Vec<LaunchParam>,
    }

    #[derive(Default)]
    struct MockState {
        next_handle: u64,
        modules: HashMap<ModuleHandle, Vec<u8>>,
        functions: HashMap<FunctionHandle, (ModuleHandle, String)>,
        allocations: HashMap<u64, Vec<u8>>,
        func_attrs: HashMap<(FunctionHandle, u8), i64>,
        launches: Vec<LaunchRecord>,
    }

    type LaunchHook = dyn Fn(&MockDriver, &LaunchRecord) + Send + Sync;

    /// An in-process driver double for tests: modules are byte blobs,
    /// device memory is host memory, launches are recorded. A launch
    /// hook lets a test play the role of the instrumented kernel and
    /// fill its scratch buffers.
    pub struct MockDriver {
        arch: String,
        state: Mutex<MockState>,
        launch_hook: Mutex<Option<Box<LaunchHook>>>,
    }

    impl MockDriver {
        pub fn new(arch: &str) -> Self {
            MockDriver {
                arch: arch.to_string(),
                state: Mutex::new(MockState::default()),
                launch_hook: Mutex::new(None),
            }
        }

        pub fn set_launch_hook(
            &self,
            hook: impl Fn(&MockDriver, &LaunchRecord) + Send + Sync + 'static,
        ) {
            *self.launch_hook.lock().unwrap() = Some(Box::new(hook));
        }

        pub fn launches(&self) -> Vec<LaunchRecord> {
            self.state.lock().unwrap().launches.clone()
        }

        pub fn module_image(&self, module: ModuleHandle) -> Option<Vec<u8>> {
            self.state.lock().unwrap().modules.get(&module).cloned()
        }

        pub fn live_allocation_count(&self) -> usize {
            self.state.lock().unwrap().allocations.len()
        }

        pub fn write_device_memory(&self, ptr: DevicePtr, offset: u64, bytes: &[u8]) {
            let mut state = self.state.lock().unwrap();
            let buffer = state.allocations.get_mut(&ptr.0).expect("live allocation");
            buffer[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        }

        fn fresh_handle(state: &mut MockState) -> u64 {
            state.next_handle += 0x10;
            0x1000 + state.next_handle
        }

        fn attr_key(attr: FuncAttribute) -> u8 {
            match attr {
                FuncAttribute::NumRegs => 0,
                FuncAttribute::SharedSizeBytes => 1,
                FuncAttribute::ConstSizeBytes => 2,
                FuncAttribute::LocalSizeBytes => 3,
                FuncAttribute::PtxVersion => 4,
                FuncAttribute::BinaryVersion => 5,
                FuncAttribute::MaxThreadsPerBlock => 6,
                FuncAttribute::MaxDynamicSharedSizeBytes => 7,
            }
        }
    }

    impl DriverApi for MockDriver {
        fn current_context(&self) -> DriverResult<ContextHandle> {
            Ok(ContextHandle(0xc0))
        }

        fn device_arch(&self) -> DriverResult<String> {
            Ok(self.arch.clone())
        }

        fn device_max_shared_memory(&self) -> DriverResult<i64> {
            Ok(228 * 1024)
        }

        fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
            let mut state = self.state.lock().unwrap();
            let handle = ModuleHandle(Self::fresh_handle(&mut state));
            state.modules.insert(handle, image.to_vec());
            Ok(handle)
        }

        fn unload_module(&self, module: ModuleHandle) -> DriverResult<()> {
            let mut state = self.state.lock().unwrap();
            state
                .modules
                .remove(&module)
                .map(|_| ())
                .ok_or_else(|| DriverError::new(500, "unknown module"))
        }

        fn get_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle> {
            let mut state = self.state.lock().unwrap();
            if !state.modules.contains_key(&module) {
                return Err(DriverError::new(500, "unknown module"));
            }
            let handle = FunctionHandle(Self::fresh_handle(&mut state));
            state.functions.insert(handle, (module, name.to_string()));
            Ok(handle)
        }

        fn func_get_attribute(
            &self,
            func: FunctionHandle,
            attr: FuncAttribute,
        ) -> DriverResult<i64> {
            let state = self.state.lock().unwrap();
            let default = match attr {
                FuncAttribute::NumRegs => 32,
                FuncAttribute::SharedSizeBytes => 0,
                FuncAttribute::ConstSizeBytes => 0,
                FuncAttribute::LocalSizeBytes => 0,
                FuncAttribute::PtxVersion => 83,
                FuncAttribute::BinaryVersion => 90,
                FuncAttribute::MaxThreadsPerBlock => 1024,
                FuncAttribute::MaxDynamicSharedSizeBytes => 48 * 1024,
            };
            Ok(*state
                .func_attrs
                .get(&(func, Self::attr_key(attr)))
                .unwrap_or(&default))
        }

        fn func_set_attribute(
            &self,
            func: FunctionHandle,
            attr: FuncAttribute,
            value: i64,
        ) -> DriverResult<()> {
            let mut state = self.state.lock().unwrap();
            state.func_attrs.insert((func, Self::attr_key(attr)), value);
            Ok(())
        }

        fn alloc(&self, size: u64) -> DriverResult<DevicePtr> {
            let mut state = self.state.lock().unwrap();
            let ptr = DevicePtr(0xd000_0000 + Self::fresh_handle(&mut state));
            state.allocations.insert(ptr.0, vec![0u8; size as usize]);
            Ok(ptr)
        }

        fn free(&self, ptr: DevicePtr) -> DriverResult<()> {
            let mut state = self.state.lock().unwrap();
            state
                .allocations
                .remove(&ptr.0)
                .map(|_| ())
                .ok_or_else(|| DriverError::new(500, "bad free"))
        }

        fn memset(&self, ptr: DevicePtr, byte: u8, size: u64) -> DriverResult<()> {
            let mut state = self.state.lock().unwrap();
            let buffer = state
                .allocations
                .get_mut(&ptr.0)
                .ok_or_else(|| DriverError::new(500, "bad memset"))?;
            buffer[..size as usize].fill(byte);
            Ok(())
        }

        fn copy_to_host(&self, src: DevicePtr, size: u64) -> DriverResult<Vec<u8>> {
            let state = self.state.lock().unwrap();
            let buffer = state
                .allocations
                .get(&src.0)
                .ok_or_else(|| DriverError::new(500, "bad copy"))?;
            Ok(buffer[..size as usize].to_vec())
        }

        fn launch(
            &self,
            func: FunctionHandle,
            grid: Dim3,
            block: Dim3,
            shared_mem_bytes: u32,
            stream: StreamHandle,
            params: &[LaunchParam],
        ) -> DriverResult<()> {
            let record = {
                let mut state = self.state.lock().unwrap();
                let (module, name) = state
                    .functions
                    .get(&func)
                    .cloned()
                    .ok_or_else(|| DriverError::new(500, "unknown function"))?;
                let record = LaunchRecord {
                    function: func,
                    module,
                    name,
                    grid,
                    block,
                    shared_mem_bytes,
                    stream,
                    params: params.to_vec(),
                };
                state.launches.push(record.clone());
                record
            };
            // State lock released; the hook may poke device memory.
            if let Some(hook) = self.launch_hook.lock().unwrap().as_ref() {
                hook(self, &record);
            }
            Ok(())
        }

        fn stream_synchronize(&self, _stream: StreamHandle) -> DriverResult<()> {
            Ok(())
        }

        fn enable_hw_coredump(&self, _value: &str) -> DriverResult<()> {
            Ok(())
        }
    }
}
