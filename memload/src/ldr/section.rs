//! Section mapping and finalization

use log::{debug, trace, warn};

use crate::error::LoadError;
use crate::ldr::pe::{ImageOptionalHeader, ImageSectionHeader, SectionCharacteristics};
use crate::mm::{align_value_down, section_protection, MappedRegion, Protection, VirtualMemory};
use crate::rtl::image::{ByteView, HeaderLayout};

fn commit(
    memory: &dyn VirtualMemory,
    address: usize,
    size: usize,
) -> Result<(), LoadError> {
    memory
        .commit(address, size, Protection::READWRITE)
        .map_err(|_| LoadError::CommitFailed { address, size })
}

/// Commit the header pages, copy the headers and store the actual base in
/// the mapped `ImageBase`
///
/// # Safety
/// `region` must be the freshly reserved image range.
pub unsafe fn copy_headers(
    data: &[u8],
    layout: &HeaderLayout,
    region: &MappedRegion,
    memory: &dyn VirtualMemory,
) -> Result<(), LoadError> {
    let mut optional = layout.optional_header(data)?;
    let size = optional.size_of_headers as usize;
    let address = region.address(0, size)?;
    commit(memory, address, size)?;
    region.copy_from(0, &data[..size])?;

    optional.image_base = region.base() as _;
    let image_base = optional.image_base;
    region.write(
        layout.optional_header_offset + core::mem::offset_of!(ImageOptionalHeader, image_base),
        image_base,
    )
}

/// Commit and fill every section in file order
///
/// # Safety
/// `region` must be the reserved image range with its headers mapped.
pub unsafe fn copy_sections(
    data: &[u8],
    layout: &HeaderLayout,
    region: &MappedRegion,
    memory: &dyn VirtualMemory,
) -> Result<(), LoadError> {
    let section_alignment = layout.optional_header(data)?.section_alignment as usize;

    for section in layout.sections(data) {
        let section = section?;
        let rva = section.virtual_address as usize;
        let raw_size = section.size_of_raw_data as usize;

        if raw_size == 0 {
            if section_alignment > 0 {
                let address = region.address(rva, section_alignment)?;
                commit(memory, address, section_alignment)?;
                region.zero(rva, section_alignment)?;
                trace!("[LDR] {} zero-filled at {:#x}", section.name_str(), address);
            }
            continue;
        }

        let start = section.pointer_to_raw_data as usize;
        let needed = start.saturating_add(raw_size);
        if needed > data.len() {
            return Err(LoadError::TruncatedImage { needed, available: data.len() });
        }

        let address = region.address(rva, raw_size)?;
        commit(memory, address, raw_size)?;
        region.copy_from(rva, &data[start..needed])?;
        trace!("[LDR] {} mapped at {:#x} ({:#x} bytes)", section.name_str(), address, raw_size);
    }
    Ok(())
}

/// Size of a section for finalization
///
/// Sections without raw data fall back to the image-wide initialized or
/// uninitialized data size.
pub fn real_section_size(section: &ImageSectionHeader, optional: &ImageOptionalHeader) -> usize {
    let size = section.size_of_raw_data;
    if size != 0 {
        return size as usize;
    }
    let flags = section.flags();
    if flags.contains(SectionCharacteristics::CNT_INITIALIZED_DATA) {
        optional.size_of_initialized_data as usize
    } else if flags.contains(SectionCharacteristics::CNT_UNINITIALIZED_DATA) {
        optional.size_of_uninitialized_data as usize
    } else {
        0
    }
}

/// Whether a discardable range may be decommitted
///
/// The range must start on a page boundary and either end on one, be the
/// last section, or belong to an image whose sections are page aligned.
pub fn decommit_allowed(
    address: usize,
    size: usize,
    section_alignment: usize,
    page_size: usize,
    last: bool,
) -> bool {
    address == align_value_down(address, page_size)
        && (last || section_alignment == page_size || size % page_size == 0)
}

/// A run of sections that share pages
#[derive(Debug, Clone, Copy)]
struct SectionRange {
    address: usize,
    aligned_address: usize,
    size: usize,
    characteristics: SectionCharacteristics,
    last: bool,
}

/// Parameters for `finalize_sections`
pub struct Finalizer<'a> {
    pub memory: &'a dyn VirtualMemory,
    pub region: &'a MappedRegion,
    pub layout: &'a HeaderLayout,
    pub page_size: usize,
    pub keep_discardable: bool,
}

impl Finalizer<'_> {
    /// Apply final page protection to every section
    ///
    /// Reads the mapped headers; must run after relocation and import
    /// binding, since code pages lose write access here.
    pub fn finalize_sections(&self) -> Result<(), LoadError> {
        let optional = self.layout.optional_header(self.region)?;
        let count = self.layout.number_of_sections;
        if count == 0 {
            return Ok(());
        }

        let mut current = self.describe(&self.layout.section(self.region, 0)?, &optional)?;
        for index in 1..count {
            let section = self.layout.section(self.region, index)?;
            let next = self.describe(&section, &optional)?;

            if current.aligned_address == next.aligned_address
                || current.address + current.size > next.aligned_address
            {
                // Shared page: the range keeps the union of the permissions.
                let both_discardable = current
                    .characteristics
                    .contains(SectionCharacteristics::MEM_DISCARDABLE)
                    && next.characteristics.contains(SectionCharacteristics::MEM_DISCARDABLE);
                current.characteristics |= next.characteristics;
                if !both_discardable {
                    current.characteristics.remove(SectionCharacteristics::MEM_DISCARDABLE);
                }
                current.size = next.address + next.size - current.address;
                continue;
            }

            self.finalize_range(&current, optional.section_alignment as usize)?;
            current = next;
        }

        current.last = true;
        self.finalize_range(&current, optional.section_alignment as usize)
    }

    fn describe(
        &self,
        section: &ImageSectionHeader,
        optional: &ImageOptionalHeader,
    ) -> Result<SectionRange, LoadError> {
        let address = self.region.address(section.virtual_address as usize, 0)?;
        Ok(SectionRange {
            address,
            aligned_address: align_value_down(address, self.page_size),
            size: real_section_size(section, optional),
            characteristics: section.flags(),
            last: false,
        })
    }

    fn finalize_range(&self, range: &SectionRange, section_alignment: usize) -> Result<(), LoadError> {
        if range.size == 0 {
            return Ok(());
        }

        if range.characteristics.contains(SectionCharacteristics::MEM_DISCARDABLE) {
            let allowed = decommit_allowed(
                range.address,
                range.size,
                section_alignment,
                self.page_size,
                range.last,
            );
            if allowed && !self.keep_discardable {
                debug!("[LDR] decommitting discardable range {:#x}+{:#x}", range.address, range.size);
                if let Err(err) = self.memory.decommit(range.address, range.size) {
                    warn!("[LDR] decommit of {:#x} failed: {}", range.address, err);
                }
            }
            return Ok(());
        }

        let protection = section_protection(range.characteristics);
        trace!("[LDR] protecting {:#x}+{:#x} as {:?}", range.address, range.size, protection);
        self.memory
            .protect(range.address, range.size, protection)
            .map(|_| ())
            .map_err(|_| LoadError::ProtectionFailed { address: range.address, size: range.size })
    }
}
