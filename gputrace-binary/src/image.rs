//! Decoded sub-images of a driver blob, and architecture-tag matching.

use serde::Serialize;

/// One architecture's machine-code image (an ELF), decoded and owned.
#[derive(Debug, Clone)]
pub struct MachineImage {
    /// Architecture tag, e.g. `"90"` or `"90a"`.
    pub arch: String,
    pub bytes: Vec<u8>,
}

/// A textual IR image, JIT-compiled by the driver.
#[derive(Debug, Clone)]
pub struct IrImage {
    /// Architecture tag the IR was versioned for; empty when the blob
    /// arrived bare and carries no tag.
    pub arch: String,
    pub text: Vec<u8>,
}

impl MachineImage {
    pub fn dump(&self, path: &std::path::Path) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)
    }
}

/// Summary of an image for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub arch: String,
    pub size: usize,
}

/// Compare two architecture tags.
///
/// A tag is a decimal SM number with an optional variant suffix ("90",
/// "90a"). With `ignore_variant_suffix`, "90" and "90a" match; without,
/// the suffixes must be identical. A device reporting "90" can run
/// images built for "90" or "90a" family members, which is why the
/// registry matches with the suffix ignored by default.
pub fn is_arch_equal(a: &str, b: &str, ignore_variant_suffix: bool) -> bool {
    let split = |tag: &str| -> (String, String) {
        let digits: String = tag.chars().take_while(char::is_ascii_digit).collect();
        let suffix: String = tag.chars().skip_while(char::is_ascii_digit).collect();
        (digits, suffix)
    };
    let (a_num, a_suffix) = split(a);
    let (b_num, b_suffix) = split(b);
    if a_num.is_empty() || b_num.is_empty() || a_num != b_num {
        return false;
    }
    ignore_variant_suffix || a_suffix == b_suffix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_equality_rules() {
        assert!(is_arch_equal("90", "90", false));
        assert!(is_arch_equal("90", "90a", true));
        assert!(!is_arch_equal("90", "90a", false));
        assert!(is_arch_equal("90a", "90f", true));
        assert!(!is_arch_equal("90", "80", true));
        assert!(!is_arch_equal("", "90", true));
        assert!(!is_arch_equal("a", "90", true));
    }
}
