//! Image header access
//!
//! A `HeaderLayout` is the offset table of a validated PE image: where the NT
//! headers, optional header and section table live. The same offsets apply
//! to the raw file buffer and to the mapped copy of the headers, so every
//! accessor takes the backing bytes as a `ByteView` and reads structures in
//! place instead of keeping copies around.

use core::mem::size_of;
use core::ptr;

use crate::error::LoadError;
use crate::ldr::pe::*;
use crate::mm::align_value_up;

/// Plain-old-data structures that may be read from arbitrary bytes
///
/// # Safety
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value.
pub unsafe trait Pod: Copy + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for i32 {}
unsafe impl Pod for usize {}
unsafe impl Pod for ImageDosHeader {}
unsafe impl Pod for ImageFileHeader {}
unsafe impl Pod for ImageDataDirectory {}
unsafe impl Pod for ImageOptionalHeader32 {}
unsafe impl Pod for ImageOptionalHeader64 {}
unsafe impl Pod for ImageSectionHeader {}
unsafe impl Pod for ImageImportDescriptor {}
unsafe impl Pod for ImageExportDirectory {}
unsafe impl Pod for ImageBaseRelocation {}
unsafe impl Pod for ImageTlsDirectory32 {}
unsafe impl Pod for ImageTlsDirectory64 {}
unsafe impl Pod for ImageRuntimeFunctionEntry {}

/// Bounds-checked, read-only access to image bytes
pub trait ByteView {
    /// Number of addressable bytes
    fn view_len(&self) -> usize;

    /// Borrow `len` bytes at `offset`, or `None` if out of range
    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]>;

    /// Borrow the NUL-terminated string at `offset` (without the NUL)
    fn read_cstr(&self, offset: usize) -> Result<&[u8], LoadError>;

    /// Read a structure at `offset` with an unaligned load
    fn read<T: Pod>(&self, offset: usize) -> Result<T, LoadError> {
        let bytes = self
            .bytes(offset, size_of::<T>())
            .ok_or(LoadError::MalformedImage("structure extends past the image"))?;
        // SAFETY: `bytes` holds exactly size_of::<T>() bytes and T is Pod.
        Ok(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

impl ByteView for [u8] {
    fn view_len(&self) -> usize {
        self.len()
    }

    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.get(offset..offset.checked_add(len)?)
    }

    fn read_cstr(&self, offset: usize) -> Result<&[u8], LoadError> {
        let rest = self
            .get(offset..)
            .ok_or(LoadError::MalformedImage("string outside the image"))?;
        let len = rest
            .iter()
            .position(|&c| c == 0)
            .ok_or(LoadError::MalformedImage("unterminated string"))?;
        Ok(&rest[..len])
    }
}

/// Offsets of the header structures of a validated image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Offset of the "PE\0\0" signature
    pub nt_offset: usize,
    pub file_header_offset: usize,
    pub optional_header_offset: usize,
    pub section_table_offset: usize,
    pub number_of_sections: usize,
}

impl HeaderLayout {
    /// Validate the headers of an untrusted buffer
    ///
    /// Everything the loader later dereferences on the strength of these
    /// headers is checked here: signatures, host flavour, and that every
    /// header structure lies inside `data`.
    pub fn parse(data: &[u8], page_size: usize) -> Result<Self, LoadError> {
        let dos: ImageDosHeader = data
            .read(0)
            .map_err(|_| LoadError::MalformedImage("buffer smaller than the DOS header"))?;
        if !dos.is_valid() {
            return Err(LoadError::MalformedImage("missing MZ signature"));
        }

        let e_lfanew = dos.e_lfanew;
        if e_lfanew < 0 {
            return Err(LoadError::MalformedImage("negative NT header offset"));
        }
        let nt_offset = e_lfanew as usize;
        match nt_offset.checked_add(HOST_NT_HEADERS_SIZE) {
            Some(end) if end <= data.len() => {}
            _ => return Err(LoadError::MalformedImage("NT headers extend past the buffer")),
        }

        let signature: u32 = data.read(nt_offset)?;
        if signature != IMAGE_NT_SIGNATURE {
            return Err(LoadError::MalformedImage("missing PE signature"));
        }

        let file_header_offset = nt_offset + 4;
        let optional_header_offset = file_header_offset + size_of::<ImageFileHeader>();
        let file_header: ImageFileHeader = data.read(file_header_offset)?;
        if file_header.machine != HOST_MACHINE {
            return Err(LoadError::MalformedImage("machine type does not match this process"));
        }

        let optional: ImageOptionalHeader = data.read(optional_header_offset)?;
        if optional.magic != HOST_OPTIONAL_MAGIC {
            return Err(LoadError::MalformedImage("optional header magic does not match this process"));
        }
        if optional.section_alignment & 1 != 0 {
            return Err(LoadError::MalformedImage("section alignment must be even"));
        }

        let layout = HeaderLayout {
            nt_offset,
            file_header_offset,
            optional_header_offset,
            section_table_offset: optional_header_offset
                + file_header.size_of_optional_header as usize,
            number_of_sections: file_header.number_of_sections as usize,
        };

        let table_end = layout.section_table_offset
            + layout.number_of_sections * size_of::<ImageSectionHeader>();
        if table_end > data.len() {
            return Err(LoadError::MalformedImage("section table extends past the buffer"));
        }

        let size_of_headers = optional.size_of_headers as usize;
        if size_of_headers > data.len() {
            return Err(LoadError::MalformedImage("headers extend past the buffer"));
        }
        if table_end > size_of_headers || size_of_headers > optional.size_of_image as usize {
            return Err(LoadError::MalformedImage("inconsistent header size"));
        }

        // Sections without raw data still occupy one alignment unit.
        let mut last_section_end = 0u64;
        for section in layout.sections(data) {
            let section = section?;
            let extent = if section.size_of_raw_data == 0 {
                optional.section_alignment
            } else {
                section.size_of_raw_data
            };
            let end = section.virtual_address as u64 + extent as u64;
            last_section_end = last_section_end.max(end);
        }

        let aligned_image_size = align_value_up(optional.size_of_image as usize, page_size);
        if last_section_end > usize::MAX as u64 / 2
            || aligned_image_size != align_value_up(last_section_end as usize, page_size)
        {
            return Err(LoadError::MalformedImage("image size does not match the section layout"));
        }

        Ok(layout)
    }

    pub fn file_header<V: ByteView + ?Sized>(&self, view: &V) -> Result<ImageFileHeader, LoadError> {
        view.read(self.file_header_offset)
    }

    pub fn optional_header<V: ByteView + ?Sized>(
        &self,
        view: &V,
    ) -> Result<ImageOptionalHeader, LoadError> {
        view.read(self.optional_header_offset)
    }

    /// Read section header `index` from the section table
    pub fn section<V: ByteView + ?Sized>(
        &self,
        view: &V,
        index: usize,
    ) -> Result<ImageSectionHeader, LoadError> {
        if index >= self.number_of_sections {
            return Err(LoadError::MalformedImage("section index out of range"));
        }
        view.read(self.section_table_offset + index * size_of::<ImageSectionHeader>())
    }

    /// Iterate the section table in file order
    pub fn sections<'a, V: ByteView + ?Sized>(
        &'a self,
        view: &'a V,
    ) -> impl Iterator<Item = Result<ImageSectionHeader, LoadError>> + 'a {
        (0..self.number_of_sections).map(move |index| self.section(view, index))
    }

    /// Read a data directory entry; entries past `NumberOfRvaAndSizes` are absent
    pub fn data_directory<V: ByteView + ?Sized>(
        &self,
        view: &V,
        index: usize,
    ) -> Result<ImageDataDirectory, LoadError> {
        if index >= IMAGE_NUMBEROF_DIRECTORY_ENTRIES {
            return Ok(ImageDataDirectory::default());
        }
        let optional = self.optional_header(view)?;
        if index >= optional.number_of_rva_and_sizes as usize {
            return Ok(ImageDataDirectory::default());
        }
        Ok(optional.data_directory[index])
    }
}

/// Convert an RVA to an offset in the raw file
pub fn rva_to_offset(data: &[u8], layout: &HeaderLayout, rva: u32) -> Option<usize> {
    for section in layout.sections(data) {
        let section = section.ok()?;
        let start = section.virtual_address;
        let extent = section.virtual_size.max(section.size_of_raw_data);
        if rva >= start && (rva - start) < extent {
            let offset = rva - start;
            if offset >= section.size_of_raw_data {
                // Lives in the zero-filled tail, not in the file.
                return None;
            }
            return Some(section.pointer_to_raw_data as usize + offset as usize);
        }
    }

    let optional = layout.optional_header(data).ok()?;
    if rva < optional.size_of_headers {
        return Some(rva as usize);
    }
    None
}

/// Names of the modules a raw (unmapped) image imports, in descriptor order
pub fn import_names(data: &[u8], layout: &HeaderLayout) -> Result<Vec<String>, LoadError> {
    let directory = layout.data_directory(data, directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT)?;
    if !directory.is_present() {
        return Ok(Vec::new());
    }

    let start = rva_to_offset(data, layout, directory.virtual_address)
        .ok_or(LoadError::MalformedImage("import directory outside the file"))?;
    let count = directory.size as usize / size_of::<ImageImportDescriptor>();

    let mut names = Vec::new();
    for index in 0..count {
        let offset = start + index * size_of::<ImageImportDescriptor>();
        let descriptor: ImageImportDescriptor = match data.read(offset) {
            Ok(descriptor) => descriptor,
            Err(_) => break,
        };
        if descriptor.name == 0 {
            break;
        }
        let name_offset = rva_to_offset(data, layout, descriptor.name)
            .ok_or(LoadError::MalformedImage("import name outside the file"))?;
        let name = core::str::from_utf8(data.read_cstr(name_offset)?)
            .map_err(|_| LoadError::MalformedImage("import name is not valid UTF-8"))?;
        names.push(name.to_string());
    }
    Ok(names)
}
