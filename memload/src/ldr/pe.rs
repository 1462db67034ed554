//! PE (Portable Executable) Format Definitions
//!
//! On-disk layout of the structures the loader reads while mapping a DLL or
//! EXE from memory. Field layouts follow the PE/COFF specification exactly;
//! every structure is `#[repr(C, packed)]` and read with unaligned loads.
//!
//! # PE File Structure
//! ```text
//! +------------------+
//! | DOS Header (MZ)  |  64 bytes
//! +------------------+
//! | DOS Stub         |  Variable
//! +------------------+
//! | PE Signature     |  4 bytes ("PE\0\0")
//! +------------------+
//! | COFF Header      |  20 bytes
//! +------------------+
//! | Optional Header  |  PE32: 224, PE32+: 240 (with 16 directories)
//! +------------------+
//! | Section Headers  |  40 bytes each
//! +------------------+
//! | Sections         |  Variable
//! +------------------+
//! ```

use bitflags::bitflags;

/// DOS Header signature ("MZ")
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;

/// PE Signature ("PE\0\0")
pub const IMAGE_NT_SIGNATURE: u32 = 0x00004550;

/// PE32 Optional Header Magic
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;

/// PE32+ (64-bit) Optional Header Magic
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

/// Number of data directories
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

/// Size of section name
pub const IMAGE_SIZEOF_SHORT_NAME: usize = 8;

/// Size of the fixed part of a base relocation block
pub const IMAGE_SIZEOF_BASE_RELOCATION: usize = 8;

/// Ordinal flag for 64-bit thunks
pub const IMAGE_ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

/// Ordinal flag for 32-bit thunks
pub const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;

/// Machine type constants
pub mod machine_type {
    /// Intel 386 or later
    pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
    /// AMD64 (x64)
    pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
    /// ARM Thumb-2
    pub const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01C4;
    /// ARM64
    pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;
}

/// File characteristics flags
pub mod file_characteristics {
    /// Relocation info stripped from file
    pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
    /// File is executable
    pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
    /// App can handle >2gb addresses
    pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
    /// File is a DLL
    pub const IMAGE_FILE_DLL: u16 = 0x2000;
}

/// Data directory entry indices
pub mod directory_entry {
    pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
    pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
    pub const IMAGE_DIRECTORY_ENTRY_EXCEPTION: usize = 3;
    pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
    pub const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;
}

bitflags! {
    /// Section characteristics (IMAGE_SCN_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SectionCharacteristics: u32 {
        /// Section contains code
        const CNT_CODE = 0x0000_0020;
        /// Section contains initialized data
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// Section contains uninitialized data
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// Section contains extended relocations
        const LNK_NRELOC_OVFL = 0x0100_0000;
        /// Section can be discarded after load
        const MEM_DISCARDABLE = 0x0200_0000;
        /// Section cannot be cached
        const MEM_NOT_CACHED = 0x0400_0000;
        /// Section is not pageable
        const MEM_NOT_PAGED = 0x0800_0000;
        /// Section is shareable
        const MEM_SHARED = 0x1000_0000;
        /// Section is executable
        const MEM_EXECUTE = 0x2000_0000;
        /// Section is readable
        const MEM_READ = 0x4000_0000;
        /// Section is writable
        const MEM_WRITE = 0x8000_0000;
    }
}

/// Base relocation types
pub mod relocation_type {
    /// Padding entry, skipped
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// Add the high 16 bits of the delta
    pub const IMAGE_REL_BASED_HIGH: u16 = 1;
    /// Add the low 16 bits of the delta
    pub const IMAGE_REL_BASED_LOW: u16 = 2;
    /// Add the full 32-bit delta
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
    /// Add the 64-bit delta (PE32+)
    pub const IMAGE_REL_BASED_DIR64: u16 = 10;
}

/// DllMain notification reasons
pub mod dll_reason {
    pub const DLL_PROCESS_DETACH: u32 = 0;
    pub const DLL_PROCESS_ATTACH: u32 = 1;
}

// ============================================================================
// Headers
// ============================================================================

/// DOS Header (IMAGE_DOS_HEADER)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDosHeader {
    /// Magic number (MZ = 0x5A4D)
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    /// File offset of the NT headers
    pub e_lfanew: i32,
}

impl ImageDosHeader {
    /// Check the MZ signature
    pub fn is_valid(&self) -> bool {
        self.e_magic == IMAGE_DOS_SIGNATURE
    }
}

/// COFF File Header (IMAGE_FILE_HEADER)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl ImageFileHeader {
    /// Check if this is a DLL
    pub fn is_dll(&self) -> bool {
        (self.characteristics & file_characteristics::IMAGE_FILE_DLL) != 0
    }

    /// Check if relocations are stripped
    pub fn relocs_stripped(&self) -> bool {
        (self.characteristics & file_characteristics::IMAGE_FILE_RELOCS_STRIPPED) != 0
    }
}

/// Data Directory Entry (IMAGE_DATA_DIRECTORY)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl ImageDataDirectory {
    /// Check if this directory entry is present
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// Optional Header PE32 (32-bit)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageOptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// PE32 only
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

/// Optional Header PE32+ (64-bit)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageOptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

/// Section Header (IMAGE_SECTION_HEADER)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageSectionHeader {
    /// Section name (8 bytes, null-padded)
    pub name: [u8; IMAGE_SIZEOF_SHORT_NAME],
    pub virtual_size: u32,
    pub virtual_address: u32,
    /// Size of raw data (file size)
    pub size_of_raw_data: u32,
    /// File offset of the raw data
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl ImageSectionHeader {
    /// Get section name as string
    pub fn name_str(&self) -> &str {
        let name = &self.name;
        let len = name.iter().position(|&c| c == 0).unwrap_or(IMAGE_SIZEOF_SHORT_NAME);
        core::str::from_utf8(&name[..len]).unwrap_or("")
    }

    pub fn flags(&self) -> SectionCharacteristics {
        SectionCharacteristics::from_bits_retain(self.characteristics)
    }
}

// ============================================================================
// Directories
// ============================================================================

/// Import Descriptor (IMAGE_IMPORT_DESCRIPTOR)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageImportDescriptor {
    /// RVA of the import lookup table
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    /// RVA of the dependency name
    pub name: u32,
    /// RVA of the import address table
    pub first_thunk: u32,
}

/// Export Directory (IMAGE_EXPORT_DIRECTORY)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    /// Ordinal base
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

/// Base Relocation Block (IMAGE_BASE_RELOCATION)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageBaseRelocation {
    /// RVA of the page to apply relocations to
    pub virtual_address: u32,
    /// Total size of this block including the entries
    pub size_of_block: u32,
    // Followed by variable number of u16 entries
}

impl ImageBaseRelocation {
    /// Number of 16-bit entries following the block header
    pub fn entry_count(&self) -> usize {
        let size = self.size_of_block as usize;
        size.saturating_sub(IMAGE_SIZEOF_BASE_RELOCATION) / 2
    }
}

/// Get relocation type from entry
pub fn reloc_type(entry: u16) -> u16 {
    entry >> 12
}

/// Get relocation offset from entry
pub fn reloc_offset(entry: u16) -> u16 {
    entry & 0x0FFF
}

/// TLS Directory (64-bit)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageTlsDirectory64 {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    /// VA of a null-terminated array of callback VAs
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// TLS Directory (32-bit)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageTlsDirectory32 {
    pub start_address_of_raw_data: u32,
    pub end_address_of_raw_data: u32,
    pub address_of_index: u32,
    pub address_of_callbacks: u32,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// x64 unwind table entry (IMAGE_RUNTIME_FUNCTION_ENTRY)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageRuntimeFunctionEntry {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_info_address: u32,
}

// ============================================================================
// Host flavour
// ============================================================================

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Optional header matching the host pointer width
        pub type ImageOptionalHeader = ImageOptionalHeader64;
        /// TLS directory matching the host pointer width
        pub type ImageTlsDirectory = ImageTlsDirectory64;
        /// Optional header magic accepted on this host
        pub const HOST_OPTIONAL_MAGIC: u16 = IMAGE_NT_OPTIONAL_HDR64_MAGIC;
        /// Ordinal flag for pointer-sized thunks
        pub const IMAGE_ORDINAL_FLAG: usize = IMAGE_ORDINAL_FLAG64 as usize;
    } else {
        pub type ImageOptionalHeader = ImageOptionalHeader32;
        pub type ImageTlsDirectory = ImageTlsDirectory32;
        pub const HOST_OPTIONAL_MAGIC: u16 = IMAGE_NT_OPTIONAL_HDR32_MAGIC;
        pub const IMAGE_ORDINAL_FLAG: usize = IMAGE_ORDINAL_FLAG32 as usize;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Machine type this process can execute
        pub const HOST_MACHINE: u16 = machine_type::IMAGE_FILE_MACHINE_AMD64;
    } else if #[cfg(target_arch = "x86")] {
        pub const HOST_MACHINE: u16 = machine_type::IMAGE_FILE_MACHINE_I386;
    } else if #[cfg(target_arch = "aarch64")] {
        pub const HOST_MACHINE: u16 = machine_type::IMAGE_FILE_MACHINE_ARM64;
    } else {
        pub const HOST_MACHINE: u16 = machine_type::IMAGE_FILE_MACHINE_ARMNT;
    }
}

/// Size of the NT headers for the host flavour (signature + file + optional)
pub const HOST_NT_HEADERS_SIZE: usize = 4
    + core::mem::size_of::<ImageFileHeader>()
    + core::mem::size_of::<ImageOptionalHeader>();

/// Check whether an import thunk names its symbol by ordinal
pub fn snap_by_ordinal(thunk: usize) -> bool {
    thunk & IMAGE_ORDINAL_FLAG != 0
}

/// Ordinal carried by an ordinal thunk
pub fn thunk_ordinal(thunk: usize) -> u16 {
    (thunk & 0xFFFF) as u16
}
