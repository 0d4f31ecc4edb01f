//! Source-line debug info for kernels, read from the DWARF line
//! programs embedded in a machine image.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use gimli::{EndianSlice, RunTimeEndian};
use object::read::{Object, ObjectSection};
use serde::Serialize;

use crate::error::Error;

/// One matched row of a line program, address already rebased to be
/// kernel-relative.
#[derive(Debug, Clone)]
pub struct LineRow {
    pub address: u64,
    pub file: String,
    pub line: u64,
    pub is_stmt: bool,
}

/// Per-(file, line) debug metadata: the sorted unique pc list, and the
/// list of contiguous `[lo, hi]` pc blocks derived from it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DebugLineMeta {
    pub file: String,
    pub line: u64,
    pub is_stmt: bool,
    pub addresses: Vec<u64>,
    /// Inclusive pc blocks; adjacent instruction slots coalesce.
    pub blocks: Vec<(u64, u64)>,
}

/// Debug info of one kernel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugInfo {
    pub files: BTreeSet<String>,
    pub addr_to_line: BTreeMap<u64, (String, u64)>,
    /// Sorted by (file, line).
    pub line_meta: Vec<DebugLineMeta>,
}

impl DebugInfo {
    pub fn line_meta(&self, file: &str, line: u64) -> Option<&DebugLineMeta> {
        self.line_meta
            .binary_search_by(|meta| {
                (meta.file.as_str(), meta.line).cmp(&(file, line))
            })
            .ok()
            .map(|index| &self.line_meta[index])
    }

    pub fn is_empty(&self) -> bool {
        self.addr_to_line.is_empty()
    }
}

/// Collect the line rows covering `[text_address, text_address +
/// text_size)` from every line program in the image. Addresses in the
/// result are kernel-relative.
pub fn line_rows(
    file: &object::File<'_>,
    text_address: u64,
    text_size: u64,
) -> Result<Vec<LineRow>, Error> {
    let endian = if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> Result<Cow<'_, [u8]>, gimli::Error> {
        Ok(file
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..])))
    };
    let dwarf_sections = gimli::DwarfSections::load(load_section)?;
    let dwarf = dwarf_sections.borrow(|section| EndianSlice::new(section, endian));

    let mut rows = Vec::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };
        let mut state_machine = program.rows();
        while let Some((header, row)) = state_machine.next_row()? {
            if row.end_sequence() {
                continue;
            }
            let address = row.address();
            if address < text_address || address >= text_address + text_size {
                continue;
            }
            let Some(line) = row.line() else {
                continue;
            };
            let file_name = match row.file(header) {
                Some(entry) => {
                    let name = dwarf
                        .attr_string(&unit, entry.path_name())
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    match entry.directory(header) {
                        Some(dir) if !name.starts_with('/') => {
                            let dir = dwarf
                                .attr_string(&unit, dir)
                                .map(|s| s.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            if dir.is_empty() {
                                name
                            } else {
                                format!("{dir}/{name}")
                            }
                        }
                        _ => name,
                    }
                }
                None => String::new(),
            };
            rows.push(LineRow {
                address: address - text_address,
                file: file_name,
                line: line.get(),
                is_stmt: row.is_stmt(),
            });
        }
    }
    Ok(rows)
}

/// Fold line rows into per-(file, line) metadata.
///
/// `word` is the instruction size: two pcs are contiguous when they are
/// adjacent instruction slots, and contiguous pcs coalesce into one
/// inclusive block.
pub fn build_debug_info(rows: &[LineRow], word: u64) -> DebugInfo {
    let mut info = DebugInfo::default();
    let mut line_addresses: BTreeMap<(String, u64), (bool, BTreeSet<u64>)> = BTreeMap::new();

    for row in rows {
        info.files.insert(row.file.clone());
        info.addr_to_line
            .insert(row.address, (row.file.clone(), row.line));
        let entry = line_addresses
            .entry((row.file.clone(), row.line))
            .or_default();
        entry.0 |= row.is_stmt;
        entry.1.insert(row.address);
    }

    for ((file, line), (is_stmt, addresses)) in line_addresses {
        let addresses: Vec<u64> = addresses.into_iter().collect();
        let mut blocks: Vec<(u64, u64)> = Vec::new();
        for &addr in &addresses {
            match blocks.last_mut() {
                Some(block) if addr == block.1 + word => block.1 = addr,
                _ => blocks.push((addr, addr)),
            }
        }
        if addresses.is_empty() {
            log::warn!("kernel line has no binary addresses: file({file}), line({line})");
        }
        info.line_meta.push(DebugLineMeta {
            file,
            line,
            is_stmt,
            addresses,
            blocks,
        });
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(address: u64, file: &str, line: u64) -> LineRow {
        LineRow {
            address,
            file: file.into(),
            line,
            is_stmt: true,
        }
    }

    #[test]
    fn contiguous_pcs_coalesce_into_blocks() {
        let rows = vec![
            row(0x00, "a.cu", 10),
            row(0x10, "a.cu", 10),
            row(0x20, "a.cu", 10),
            // Gap.
            row(0x40, "a.cu", 10),
            row(0x30, "a.cu", 12),
        ];
        let info = build_debug_info(&rows, 0x10);

        let meta = info.line_meta("a.cu", 10).unwrap();
        assert_eq!(meta.addresses, vec![0x00, 0x10, 0x20, 0x40]);
        assert_eq!(meta.blocks, vec![(0x00, 0x20), (0x40, 0x40)]);

        let meta12 = info.line_meta("a.cu", 12).unwrap();
        assert_eq!(meta12.blocks, vec![(0x30, 0x30)]);

        assert_eq!(info.addr_to_line[&0x30], ("a.cu".to_string(), 12));
        assert!(info.line_meta("a.cu", 99).is_none());
    }

    #[test]
    fn duplicate_rows_dedup() {
        let rows = vec![row(0x10, "k.cu", 3), row(0x10, "k.cu", 3)];
        let info = build_debug_info(&rows, 0x10);
        assert_eq!(info.line_meta("k.cu", 3).unwrap().addresses, vec![0x10]);
    }
}
