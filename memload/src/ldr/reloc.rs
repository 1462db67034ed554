//! Base relocation processing

use core::mem::size_of;

use log::{debug, warn};

use crate::error::LoadError;
use crate::ldr::pe::{
    directory_entry, reloc_offset, reloc_type, relocation_type, ImageBaseRelocation,
    IMAGE_SIZEOF_BASE_RELOCATION,
};
use crate::mm::MappedRegion;
use crate::rtl::image::{ByteView, HeaderLayout};

/// Apply every relocation block to the mapped image
///
/// `delta` is `actual base - declared base` with wrapping arithmetic. Returns
/// the number of fields patched. Nothing is done when `delta` is zero.
///
/// # Safety
/// All sections must be committed and writable.
pub unsafe fn relocate(
    region: &MappedRegion,
    layout: &HeaderLayout,
    delta: usize,
) -> Result<usize, LoadError> {
    if delta == 0 {
        return Ok(0);
    }

    let file_header = layout.file_header(region)?;
    let directory = layout.data_directory(region, directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC)?;
    if file_header.relocs_stripped() || !directory.is_present() {
        return Err(LoadError::RelocationRequiredButMissing);
    }

    let start = directory.virtual_address as usize;
    let end = start
        .checked_add(directory.size as usize)
        .ok_or(LoadError::MalformedImage("relocation directory overflows"))?;

    let mut patched = 0;
    let mut offset = start;
    while offset + IMAGE_SIZEOF_BASE_RELOCATION <= end {
        let block: ImageBaseRelocation = region.read(offset)?;
        if block.virtual_address == 0 {
            break;
        }
        if (block.size_of_block as usize) < IMAGE_SIZEOF_BASE_RELOCATION {
            return Err(LoadError::MalformedImage("relocation block smaller than its header"));
        }

        let page = block.virtual_address as usize;
        for index in 0..block.entry_count() {
            let entry: u16 = region.read(offset + IMAGE_SIZEOF_BASE_RELOCATION + 2 * index)?;
            let target = page + reloc_offset(entry) as usize;
            if apply(region, reloc_type(entry), target, delta)? {
                patched += 1;
            }
        }
        offset += block.size_of_block as usize;
    }

    debug!("[LDR] applied {} relocations (delta {:#x})", patched, delta);
    Ok(patched)
}

/// Patch one field; returns whether anything was written
unsafe fn apply(
    region: &MappedRegion,
    kind: u16,
    target: usize,
    delta: usize,
) -> Result<bool, LoadError> {
    match kind {
        relocation_type::IMAGE_REL_BASED_ABSOLUTE => Ok(false),
        relocation_type::IMAGE_REL_BASED_HIGH => {
            let value: u16 = region.read(target)?;
            region.write(target, value.wrapping_add((delta >> 16) as u16))?;
            Ok(true)
        }
        relocation_type::IMAGE_REL_BASED_LOW => {
            let value: u16 = region.read(target)?;
            region.write(target, value.wrapping_add(delta as u16))?;
            Ok(true)
        }
        relocation_type::IMAGE_REL_BASED_HIGHLOW => {
            let value: u32 = region.read(target)?;
            region.write(target, value.wrapping_add(delta as u32))?;
            Ok(true)
        }
        relocation_type::IMAGE_REL_BASED_DIR64 if size_of::<usize>() == 8 => {
            let value: u64 = region.read(target)?;
            region.write(target, value.wrapping_add(delta as u64))?;
            Ok(true)
        }
        other => {
            warn!("[LDR] unknown relocation type {} at {:#x}", other, target);
            Ok(false)
        }
    }
}
