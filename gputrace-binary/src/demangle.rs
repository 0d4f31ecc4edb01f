//! Kernel-name demangling. Kernels carry Itanium C++ manglings; Rust
//! manglings show up in images produced by Rust GPU toolchains.

/// Attempt to demangle the passed-in string. Falls back to the input.
pub fn demangle_any(name: &str) -> String {
    if let Ok(demangled_symbol) = rustc_demangle::try_demangle(name) {
        return format!("{demangled_symbol:#}");
    }

    if name.starts_with('_') {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled_string) = symbol.demangle_with_options(&options) {
                return demangled_string;
            }
        }
    }

    name.to_owned()
}
