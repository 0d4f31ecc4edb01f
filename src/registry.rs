//! The module registry: the live mapping from driver handles to parsed
//! kernels, kept consistent under concurrent interception callbacks.
//!
//! One mutex guards the handle maps. Parsing a kernel is expensive, so
//! `resolve_function` drops the lock across disassembly and CFG
//! construction and re-checks afterwards: concurrent resolutions of the
//! same function coalesce into exactly one parsed `Kernel`.

use std::sync::{Arc, Mutex};

use gputrace_binary::{container, is_arch_equal, Kernel, SplitContainer};
use gputrace_isa::Arch;
use rustc_hash::FxHashMap;

use crate::driver::{ContextHandle, FunctionHandle, LibraryHandle, ModuleHandle};
use crate::error::Error;

/// A resolved function: the parsed kernel plus the machine image it was
/// extracted from (needed when re-emitting an instrumented variant).
#[derive(Clone)]
pub struct ResolvedKernel {
    pub kernel: Arc<Kernel>,
    images: Arc<SplitContainer>,
    image_index: usize,
}

impl ResolvedKernel {
    pub fn image(&self) -> &gputrace_binary::MachineImage {
        &self.images.machine_images[self.image_index]
    }
}

#[derive(Default)]
struct ContextMaps {
    module_bytes: FxHashMap<ModuleHandle, Vec<u8>>,
    module_to_library: FxHashMap<ModuleHandle, LibraryHandle>,
    function_to_module: FxHashMap<FunctionHandle, ModuleHandle>,
    function_name: FxHashMap<FunctionHandle, String>,
    function_to_kernel: FxHashMap<FunctionHandle, ResolvedKernel>,
    module_images: FxHashMap<ModuleHandle, Arc<SplitContainer>>,
}

#[derive(Default)]
struct RegistryMaps {
    library_bytes: FxHashMap<LibraryHandle, Vec<u8>>,
    contexts: FxHashMap<ContextHandle, ContextMaps>,
}

/// Context-scoped handle maps plus the lazy parser entry point.
#[derive(Default)]
pub struct ModuleRegistry {
    inner: Mutex<RegistryMaps>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a library's bytes. The embedded fat container is recovered
    /// immediately so a bad blob is diagnosed at load time.
    pub fn cache_library(&self, library: LibraryHandle, bytes: &[u8]) -> Result<(), Error> {
        let container = container::unwrap_container(bytes)?;
        let mut maps = self.inner.lock().unwrap();
        if maps.library_bytes.contains_key(&library) {
            log::warn!("library {library:#x} already cached, overwriting");
        }
        log::debug!(
            "cached library {library:#x}: {} container bytes",
            container.len()
        );
        maps.library_bytes.insert(library, container);
        Ok(())
    }

    /// Store a module's bytes under the current context. A module that
    /// is already known through a library link keeps the library as its
    /// byte source; the direct cache is ignored.
    pub fn cache_module(
        &self,
        context: ContextHandle,
        module: ModuleHandle,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let container = container::unwrap_container(bytes)?;
        let mut maps = self.inner.lock().unwrap();
        let ctx = maps.contexts.entry(context).or_default();
        if ctx.module_to_library.contains_key(&module) {
            log::warn!(
                "module {module:#x} already recorded through its library, skipping direct cache"
            );
            return Ok(());
        }
        if ctx.module_bytes.contains_key(&module) {
            log::warn!("module {module:#x} already cached in context {context:#x}, overwriting");
            ctx.module_images.remove(&module);
        }
        log::debug!(
            "cached module {module:#x} in context {context:#x}: {} container bytes",
            container.len()
        );
        ctx.module_bytes.insert(module, container);
        Ok(())
    }

    /// Record that a module came out of a library. Ignored when the
    /// module already has direct bytes.
    pub fn link_module_to_library(
        &self,
        context: ContextHandle,
        module: ModuleHandle,
        library: LibraryHandle,
    ) {
        let mut maps = self.inner.lock().unwrap();
        let ctx = maps.contexts.entry(context).or_default();
        if ctx.module_bytes.contains_key(&module) {
            log::warn!(
                "module {module:#x} already has direct bytes, ignoring library link to {library:#x}"
            );
            return;
        }
        ctx.module_to_library.insert(module, library);
    }

    /// Record a function's parent module and name.
    pub fn link_function_to_module(
        &self,
        context: ContextHandle,
        function: FunctionHandle,
        module: ModuleHandle,
        name: &str,
    ) {
        let mut maps = self.inner.lock().unwrap();
        let ctx = maps.contexts.entry(context).or_default();
        if let Some(previous) = ctx.function_to_module.insert(function, module) {
            if previous != module {
                log::warn!(
                    "function {function:#x} moved from module {previous:#x} to {module:#x}"
                );
            }
        }
        ctx.function_name.insert(function, name.to_string());
    }

    pub fn function_name(
        &self,
        context: ContextHandle,
        function: FunctionHandle,
    ) -> Result<String, Error> {
        let maps = self.inner.lock().unwrap();
        maps.contexts
            .get(&context)
            .and_then(|ctx| ctx.function_name.get(&function))
            .cloned()
            .ok_or(Error::FunctionNameUnknown {
                function: function.0,
            })
    }

    /// The parsed kernel for a function, if resolution already happened.
    pub fn kernel_of(
        &self,
        context: ContextHandle,
        function: FunctionHandle,
    ) -> Option<Arc<Kernel>> {
        let maps = self.inner.lock().unwrap();
        maps.contexts
            .get(&context)?
            .function_to_kernel
            .get(&function)
            .map(|resolved| resolved.kernel.clone())
    }

    /// The split container a module's bytes parse into.
    pub fn module_images(
        &self,
        context: ContextHandle,
        module: ModuleHandle,
    ) -> Result<Arc<SplitContainer>, Error> {
        {
            let maps = self.inner.lock().unwrap();
            if let Some(images) = maps
                .contexts
                .get(&context)
                .and_then(|ctx| ctx.module_images.get(&module))
            {
                return Ok(images.clone());
            }
        }

        // Parse outside the lock; the bytes are cloned out.
        let bytes = self.module_container_bytes(context, module)?;
        let images = Arc::new(container::split(&bytes)?);

        let mut maps = self.inner.lock().unwrap();
        let ctx = maps.contexts.entry(context).or_default();
        // A concurrent caller may have won; keep the first result.
        Ok(ctx
            .module_images
            .entry(module)
            .or_insert(images)
            .clone())
    }

    fn module_container_bytes(
        &self,
        context: ContextHandle,
        module: ModuleHandle,
    ) -> Result<Vec<u8>, Error> {
        let maps = self.inner.lock().unwrap();
        let ctx = maps
            .contexts
            .get(&context)
            .ok_or(Error::ModuleNotCached {
                context: context.0,
                module: module.0,
            })?;
        if let Some(bytes) = ctx.module_bytes.get(&module) {
            return Ok(bytes.clone());
        }
        if let Some(library) = ctx.module_to_library.get(&module) {
            if let Some(bytes) = maps.library_bytes.get(library) {
                return Ok(bytes.clone());
            }
        }
        Err(Error::ModuleNotCached {
            context: context.0,
            module: module.0,
        })
    }

    /// Lazily parse the kernel behind a function handle.
    ///
    /// Picks the machine image whose architecture matches `device_arch`
    /// (variant suffix ignored), extracts the kernel by its recorded
    /// name, and caches the result. Concurrent callers race outside the
    /// lock and the first finished parse wins.
    pub fn resolve_function(
        &self,
        context: ContextHandle,
        function: FunctionHandle,
        device_arch: &str,
        arch: &dyn Arch,
    ) -> Result<ResolvedKernel, Error> {
        let (module, name) = {
            let maps = self.inner.lock().unwrap();
            let ctx = maps.contexts.get(&context).ok_or(Error::FunctionNotLinked {
                function: function.0,
            })?;
            if let Some(resolved) = ctx.function_to_kernel.get(&function) {
                return Ok(resolved.clone());
            }
            let module = *ctx
                .function_to_module
                .get(&function)
                .ok_or(Error::FunctionNotLinked {
                    function: function.0,
                })?;
            let name = ctx
                .function_name
                .get(&function)
                .cloned()
                .ok_or(Error::FunctionNameUnknown {
                    function: function.0,
                })?;
            (module, name)
        };

        let images = self.module_images(context, module)?;

        // Expensive phase, lock dropped: disassembly and CFG.
        let mut kernel = None;
        let mut saw_matching_image = false;
        for (index, image) in images.machine_images.iter().enumerate() {
            if !is_arch_equal(&image.arch, device_arch, true) {
                continue;
            }
            saw_matching_image = true;
            match Kernel::extract(image, &name, arch) {
                Ok(parsed) => {
                    kernel = Some((parsed, index));
                    break;
                }
                Err(gputrace_binary::Error::SymbolNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let resolved = match kernel {
            Some((kernel, image_index)) => ResolvedKernel {
                kernel: Arc::new(kernel),
                images,
                image_index,
            },
            None if saw_matching_image => {
                return Err(Error::KernelNotInImage { kernel: name });
            }
            None => {
                return Err(Error::NoMatchingImage {
                    device_arch: device_arch.to_string(),
                });
            }
        };

        let mut maps = self.inner.lock().unwrap();
        let ctx = maps.contexts.entry(context).or_default();
        // Re-check: a concurrent resolution may have finished first.
        Ok(ctx
            .function_to_kernel
            .entry(function)
            .or_insert(resolved)
            .clone())
    }

    /// Drop every map of every context.
    pub fn clear(&self) {
        let mut maps = self.inner.lock().unwrap();
        maps.contexts.clear();
        maps.library_bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gputrace_binary::testing::{build_container, build_machine_image, EntrySpec, KernelSpec};
    use gputrace_isa::testing::{assemble, build, demo_arch};
    use gputrace_isa::Arch as _;

    fn simple_image(arch: &str, kernel: &str) -> Vec<u8> {
        let demo = demo_arch();
        let set = demo.instruction_set().clone();
        build_machine_image(
            arch,
            &[KernelSpec {
                name: kernel,
                code: assemble(&[build(&set, "NOP"), build(&set, "EXIT")]),
                param_sizes: vec![8],
            }],
        )
    }

    const CTX: ContextHandle = ContextHandle(1);
    const MODULE: ModuleHandle = ModuleHandle(10);
    const FUNC: FunctionHandle = FunctionHandle(100);

    #[test]
    fn resolve_through_direct_module_bytes() {
        let registry = ModuleRegistry::new();
        let container = build_container(&[
            EntrySpec::machine("80", simple_image("80", "k")),
            EntrySpec::machine("90", simple_image("90", "k")),
        ]);
        registry.cache_module(CTX, MODULE, &container).unwrap();
        registry.link_function_to_module(CTX, FUNC, MODULE, "k");

        let arch = demo_arch();
        let resolved = registry.resolve_function(CTX, FUNC, "90", &*arch).unwrap();
        assert_eq!(resolved.kernel.arch, "90");
        assert_eq!(resolved.kernel.mangled_name, "k");
        assert_eq!(resolved.image().arch, "90");

        // Resolution is cached; the same Arc comes back.
        let again = registry.resolve_function(CTX, FUNC, "90", &*arch).unwrap();
        assert!(Arc::ptr_eq(&resolved.kernel, &again.kernel));
    }

    #[test]
    fn resolve_through_library_link() {
        let registry = ModuleRegistry::new();
        let library = LibraryHandle(7);
        let container = build_container(&[EntrySpec::machine("90", simple_image("90", "k"))]);
        registry.cache_library(library, &container).unwrap();
        registry.link_module_to_library(CTX, MODULE, library);
        registry.link_function_to_module(CTX, FUNC, MODULE, "k");

        let arch = demo_arch();
        let resolved = registry.resolve_function(CTX, FUNC, "90", &*arch).unwrap();
        assert_eq!(resolved.kernel.mangled_name, "k");
    }

    #[test]
    fn direct_cache_wins_over_later_library_link() {
        let registry = ModuleRegistry::new();
        let container = build_container(&[EntrySpec::machine("90", simple_image("90", "k"))]);
        registry.cache_module(CTX, MODULE, &container).unwrap();
        // The library link must be ignored now.
        registry.link_module_to_library(CTX, MODULE, LibraryHandle(7));
        registry.link_function_to_module(CTX, FUNC, MODULE, "k");

        let arch = demo_arch();
        assert!(registry.resolve_function(CTX, FUNC, "90", &*arch).is_ok());
    }

    #[test]
    fn caching_is_idempotent() {
        let registry = ModuleRegistry::new();
        let container = build_container(&[EntrySpec::machine("90", simple_image("90", "k"))]);
        registry.cache_module(CTX, MODULE, &container).unwrap();
        registry.cache_module(CTX, MODULE, &container).unwrap();
        registry.link_function_to_module(CTX, FUNC, MODULE, "k");

        let arch = demo_arch();
        assert!(registry.resolve_function(CTX, FUNC, "90", &*arch).is_ok());
    }

    #[test]
    fn missing_pieces_report_not_ready_errors() {
        let registry = ModuleRegistry::new();
        let arch = demo_arch();

        // Nothing linked at all.
        assert!(matches!(
            registry.resolve_function(CTX, FUNC, "90", &*arch),
            Err(Error::FunctionNotLinked { .. })
        ));

        // Linked, but module bytes never arrived.
        registry.link_function_to_module(CTX, FUNC, MODULE, "k");
        assert!(matches!(
            registry.resolve_function(CTX, FUNC, "90", &*arch),
            Err(Error::ModuleNotCached { .. })
        ));

        // Bytes for the wrong architecture only.
        let container = build_container(&[EntrySpec::machine("80", simple_image("80", "k"))]);
        registry.cache_module(CTX, MODULE, &container).unwrap();
        assert!(matches!(
            registry.resolve_function(CTX, FUNC, "90", &*arch),
            Err(Error::NoMatchingImage { .. })
        ));

        // Matching architecture, kernel not in it.
        let registry = ModuleRegistry::new();
        let container = build_container(&[EntrySpec::machine("90", simple_image("90", "other"))]);
        registry.cache_module(CTX, MODULE, &container).unwrap();
        registry.link_function_to_module(CTX, FUNC, MODULE, "k");
        assert!(matches!(
            registry.resolve_function(CTX, FUNC, "90", &*arch),
            Err(Error::KernelNotInImage { .. })
        ));
    }

    #[test]
    fn concurrent_resolutions_coalesce() {
        let registry = Arc::new(ModuleRegistry::new());
        let container = build_container(&[EntrySpec::machine("90", simple_image("90", "k"))]);
        registry.cache_module(CTX, MODULE, &container).unwrap();
        registry.link_function_to_module(CTX, FUNC, MODULE, "k");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let arch = demo_arch();
                registry
                    .resolve_function(CTX, FUNC, "90", &*arch)
                    .map(|resolved| Arc::as_ptr(&resolved.kernel) as usize)
            }));
        }
        let pointers: Vec<usize> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        assert!(pointers.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
