//! Page protection
//!
//! Values match the Win32 PAGE_* constants so a native backend can pass
//! `bits()` straight to the OS.

use bitflags::bitflags;

use crate::ldr::pe::SectionCharacteristics;

bitflags! {
    /// Page protection (PAGE_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const NOACCESS = 0x01;
        const READONLY = 0x02;
        const READWRITE = 0x04;
        const WRITECOPY = 0x08;
        const EXECUTE = 0x10;
        const EXECUTE_READ = 0x20;
        const EXECUTE_READWRITE = 0x40;
        const EXECUTE_WRITECOPY = 0x80;
        const NOCACHE = 0x200;
    }
}

impl Protection {
    /// Whether code may run from pages with this protection
    pub fn is_executable(self) -> bool {
        self.intersects(
            Protection::EXECUTE
                | Protection::EXECUTE_READ
                | Protection::EXECUTE_READWRITE
                | Protection::EXECUTE_WRITECOPY,
        )
    }

    /// Whether pages with this protection may be written
    pub fn is_writable(self) -> bool {
        self.intersects(
            Protection::READWRITE
                | Protection::WRITECOPY
                | Protection::EXECUTE_READWRITE
                | Protection::EXECUTE_WRITECOPY,
        )
    }
}

/// Protection indexed by `[executable][readable][writeable]`
pub const PROTECTION_FLAGS: [[[Protection; 2]; 2]; 2] = [
    [
        [Protection::NOACCESS, Protection::WRITECOPY],
        [Protection::READONLY, Protection::READWRITE],
    ],
    [
        [Protection::EXECUTE, Protection::EXECUTE_WRITECOPY],
        [Protection::EXECUTE_READ, Protection::EXECUTE_READWRITE],
    ],
];

/// Final page protection for a section with the given characteristics
pub fn section_protection(characteristics: SectionCharacteristics) -> Protection {
    let executable = characteristics.contains(SectionCharacteristics::MEM_EXECUTE) as usize;
    let readable = characteristics.contains(SectionCharacteristics::MEM_READ) as usize;
    let writeable = characteristics.contains(SectionCharacteristics::MEM_WRITE) as usize;

    let protection = PROTECTION_FLAGS[executable][readable][writeable];
    if characteristics.contains(SectionCharacteristics::MEM_NOT_CACHED) {
        protection | Protection::NOCACHE
    } else {
        protection
    }
}
