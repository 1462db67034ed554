//! Export lookup

use core::cmp::Ordering;
use core::fmt;

use log::trace;

use crate::error::LoadError;
use crate::ldr::pe::{directory_entry, ImageExportDirectory};
use crate::mm::MappedRegion;
use crate::rtl::image::{ByteView, HeaderLayout};

/// An exported symbol, by name or by ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol<'a> {
    Name(&'a str),
    Ordinal(u16),
}

impl<'a> From<&'a str> for Symbol<'a> {
    fn from(name: &'a str) -> Self {
        Symbol::Name(name)
    }
}

impl From<u16> for Symbol<'_> {
    fn from(ordinal: u16) -> Self {
        Symbol::Ordinal(ordinal)
    }
}

impl fmt::Display for Symbol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Name(name) => f.write_str(name),
            Symbol::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

/// One entry of the sorted name index
#[derive(Debug, Clone, Copy)]
pub struct ExportName {
    name_rva: u32,
    /// Index into the function table
    index: u16,
}

/// Sorted view of the export name table, built once per image
pub type ExportIndex = spin::Once<Result<Vec<ExportName>, LoadError>>;

fn name_at<'a>(region: &'a MappedRegion, entry: &ExportName) -> &'a [u8] {
    region.read_cstr(entry.name_rva as usize).unwrap_or(b"")
}

fn build_index(
    region: &MappedRegion,
    exports: &ImageExportDirectory,
) -> Result<Vec<ExportName>, LoadError> {
    let names = exports.address_of_names as usize;
    let ordinals = exports.address_of_name_ordinals as usize;

    let mut index = Vec::with_capacity(exports.number_of_names as usize);
    for slot in 0..exports.number_of_names as usize {
        let name_rva: u32 = region.read(names + 4 * slot)?;
        region.read_cstr(name_rva as usize)?;
        let ordinal: u16 = region.read(ordinals + 2 * slot)?;
        index.push(ExportName { name_rva, index: ordinal });
    }
    // Linkers emit the table sorted; sort anyway so lookups never depend on it.
    index.sort_by(|a, b| name_at(region, a).cmp(name_at(region, b)));
    Ok(index)
}

/// Find the address of an export
///
/// Forwarded exports (entries pointing back into the export directory) are
/// reported as `SymbolNotFound`.
pub fn find_export(
    region: &MappedRegion,
    layout: &HeaderLayout,
    cache: &ExportIndex,
    symbol: Symbol<'_>,
) -> Result<usize, LoadError> {
    let not_found = || LoadError::SymbolNotFound(symbol.to_string());

    let directory = layout.data_directory(region, directory_entry::IMAGE_DIRECTORY_ENTRY_EXPORT)?;
    if !directory.is_present() {
        return Err(not_found());
    }
    let exports: ImageExportDirectory = region.read(directory.virtual_address as usize)?;
    if exports.number_of_functions == 0 {
        return Err(not_found());
    }

    let index = match symbol {
        Symbol::Ordinal(ordinal) => {
            let base = exports.base;
            (ordinal as u32).checked_sub(base).ok_or_else(not_found)?
        }
        Symbol::Name(name) => {
            if exports.number_of_names == 0 {
                return Err(not_found());
            }
            let names = cache.call_once(|| build_index(region, &exports)).as_ref().map_err(Clone::clone)?;
            let found = names
                .binary_search_by(|entry| match region.read_cstr(entry.name_rva as usize) {
                    Ok(candidate) => candidate.cmp(name.as_bytes()),
                    Err(_) => Ordering::Less,
                })
                .map_err(|_| not_found())?;
            names[found].index as u32
        }
    };

    if index >= exports.number_of_functions {
        return Err(not_found());
    }
    let rva: u32 = region.read(exports.address_of_functions as usize + 4 * index as usize)?;
    if rva == 0 {
        return Err(not_found());
    }
    let start = directory.virtual_address;
    if rva >= start && rva - start < directory.size {
        trace!("[LDR] export {} is forwarded", symbol);
        return Err(not_found());
    }

    region.address(rva as usize, 1).map_err(|_| not_found())
}
