//! Bounds-checked access to a reserved image range

use core::{ptr, slice};

use crate::error::LoadError;
use crate::rtl::image::{ByteView, Pod};

/// The contiguous range `[base, base + size)` an image is mapped into
///
/// All offsets are relative to `base` (i.e. RVAs). Reads and writes outside
/// the range fail with `MalformedImage` instead of touching foreign memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    base: usize,
    size: usize,
}

impl MappedRegion {
    /// # Safety
    /// The range must stay reserved for as long as the region is used, and
    /// any bytes read through it must be committed and readable.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check whether an absolute address lies inside the region
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Absolute address of `offset`, if `len` bytes from there fit
    pub fn address(&self, offset: usize, len: usize) -> Result<usize, LoadError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.base + offset),
            _ => Err(LoadError::MalformedImage("range outside the mapped image")),
        }
    }

    /// Offset of an absolute address inside the region
    pub fn offset_of(&self, address: usize) -> Result<usize, LoadError> {
        if self.contains(address) {
            Ok(address - self.base)
        } else {
            Err(LoadError::MalformedImage("address outside the mapped image"))
        }
    }

    /// Store `value` at `offset` with an unaligned write
    ///
    /// # Safety
    /// The target bytes must be committed and writable.
    pub unsafe fn write<T: Pod>(&self, offset: usize, value: T) -> Result<(), LoadError> {
        let address = self.address(offset, core::mem::size_of::<T>())?;
        ptr::write_unaligned(address as *mut T, value);
        Ok(())
    }

    /// Copy `src` to `offset`
    ///
    /// # Safety
    /// The target bytes must be committed and writable.
    pub unsafe fn copy_from(&self, offset: usize, src: &[u8]) -> Result<(), LoadError> {
        let address = self.address(offset, src.len())?;
        ptr::copy_nonoverlapping(src.as_ptr(), address as *mut u8, src.len());
        Ok(())
    }

    /// Zero `len` bytes at `offset`
    ///
    /// # Safety
    /// The target bytes must be committed and writable.
    pub unsafe fn zero(&self, offset: usize, len: usize) -> Result<(), LoadError> {
        let address = self.address(offset, len)?;
        ptr::write_bytes(address as *mut u8, 0, len);
        Ok(())
    }
}

impl ByteView for MappedRegion {
    fn view_len(&self) -> usize {
        self.size
    }

    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let address = self.address(offset, len).ok()?;
        // SAFETY: in range; committed per the contract of `new`.
        Some(unsafe { slice::from_raw_parts(address as *const u8, len) })
    }

    fn read_cstr(&self, offset: usize) -> Result<&[u8], LoadError> {
        let start = self.address(offset, 0)?;
        let end = self.base + self.size;
        let mut cursor = start;
        // Scan byte by byte so nothing past the terminator is touched.
        while cursor < end {
            // SAFETY: cursor is inside the region.
            if unsafe { ptr::read(cursor as *const u8) } == 0 {
                return Ok(unsafe { slice::from_raw_parts(start as *const u8, cursor - start) });
            }
            cursor += 1;
        }
        Err(LoadError::MalformedImage("unterminated string"))
    }
}
