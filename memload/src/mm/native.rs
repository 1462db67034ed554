//! Windows virtual memory backend

use core::ffi::c_void;

use windows::Win32::Foundation::GetLastError;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
    MEM_RESERVE, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::SystemInformation::{GetNativeSystemInfo, SYSTEM_INFO};

use super::{Protection, VirtualMemory};
use crate::error::MemoryError;

fn last_error() -> MemoryError {
    // SAFETY: reads thread-local state only.
    MemoryError::new(unsafe { GetLastError() }.0)
}

/// VirtualAlloc / VirtualProtect / VirtualFree on the current process
#[derive(Debug, Clone, Copy)]
pub struct NativeMemory {
    page_size: usize,
}

impl NativeMemory {
    pub fn new() -> Self {
        let mut info = SYSTEM_INFO::default();
        // SAFETY: `info` is a valid out pointer.
        unsafe { GetNativeSystemInfo(&mut info) };
        Self { page_size: info.dwPageSize as usize }
    }
}

impl Default for NativeMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemory for NativeMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize, preferred: Option<usize>) -> Result<usize, MemoryError> {
        let address = preferred.map(|address| address as *const c_void);
        // SAFETY: reserving fresh address space has no preconditions.
        let base = unsafe {
            VirtualAlloc(address, size, MEM_RESERVE, PAGE_PROTECTION_FLAGS(Protection::READWRITE.bits()))
        };
        if base.is_null() {
            Err(last_error())
        } else {
            Ok(base as usize)
        }
    }

    fn commit(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<(), MemoryError> {
        // SAFETY: the range lies inside a reservation owned by the caller.
        let base = unsafe {
            VirtualAlloc(
                Some(address as *const c_void),
                size,
                MEM_COMMIT,
                PAGE_PROTECTION_FLAGS(protection.bits()),
            )
        };
        if base.is_null() {
            Err(last_error())
        } else {
            Ok(())
        }
    }

    fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: the range lies inside a reservation owned by the caller.
        unsafe {
            VirtualProtect(
                address as *const c_void,
                size,
                PAGE_PROTECTION_FLAGS(protection.bits()),
                &mut old,
            )
        }
        .map_err(|_| last_error())?;
        Ok(Protection::from_bits_retain(old.0))
    }

    fn decommit(&self, address: usize, size: usize) -> Result<(), MemoryError> {
        // SAFETY: the range lies inside a reservation owned by the caller.
        unsafe { VirtualFree(address as *mut c_void, size, MEM_DECOMMIT) }
            .map_err(|_| last_error())
    }

    fn release(&self, address: usize) -> Result<(), MemoryError> {
        // SAFETY: `address` is the base of a reservation owned by the caller.
        unsafe { VirtualFree(address as *mut c_void, 0, MEM_RELEASE) }.map_err(|_| last_error())
    }
}
