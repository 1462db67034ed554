//! Memory Manager (mm)
//!
//! Address-space plumbing for the loader:
//!
//! - **VirtualMemory**: the reserve / commit / protect / decommit / release
//!   primitives the loader consumes. The OS provides them; the loader never
//!   talks to the OS directly.
//! - **Protection**: PAGE_* flags and the section protection table
//! - **MappedRegion**: bounds-checked access to the reserved image range
//! - **ExtraAllocations**: reservations parked outside the image range
//!
//! # Image reservation
//!
//! ```text
//! preferred base ──► reserve(size, Some(base)) ──ok──► region
//!                         │ fail
//!                         ▼
//!                    reserve(size, None) ──► straddles 4 GiB? ──yes──► park, retry
//!                                                   │ no
//!                                                   ▼
//!                                                 region
//! ```

pub mod protect;
pub mod region;

#[cfg(windows)]
pub mod native;

pub use protect::{section_protection, Protection, PROTECTION_FLAGS};
pub use region::MappedRegion;

use log::{debug, warn};

use crate::error::{LoadError, MemoryError};

/// Virtual memory primitives
///
/// Addresses are plain integers. Ranges handed to `commit`, `protect` and
/// `decommit` always lie inside a range previously returned by `reserve`;
/// backends round them outward to whole pages.
pub trait VirtualMemory: Send + Sync {
    /// Granularity of commit and protection
    fn page_size(&self) -> usize;

    /// Reserve `size` bytes, at `preferred` if given
    ///
    /// Must fail rather than return a different address when `preferred`
    /// is given but unavailable.
    fn reserve(&self, size: usize, preferred: Option<usize>) -> Result<usize, MemoryError>;

    /// Commit pages; newly committed pages read as zero
    fn commit(&self, address: usize, size: usize, protection: Protection)
        -> Result<(), MemoryError>;

    /// Change protection, returning the previous protection
    fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError>;

    /// Return committed pages to the reserved state
    fn decommit(&self, address: usize, size: usize) -> Result<(), MemoryError>;

    /// Release a whole reservation by its base address
    fn release(&self, address: usize) -> Result<(), MemoryError>;
}

/// Round `value` up to a power-of-two `alignment`
#[inline]
pub fn align_value_up(value: usize, alignment: usize) -> usize {
    x86_64::align_up(value as u64, alignment as u64) as usize
}

/// Round `value` down to a power-of-two `alignment`
#[inline]
pub fn align_value_down(value: usize, alignment: usize) -> usize {
    x86_64::align_down(value as u64, alignment as u64) as usize
}

/// Reservations made while looking for a usable image range
///
/// Each entry owns one whole reservation, disjoint from the image and from
/// each other. They are released together when the image goes away.
#[derive(Debug, Default)]
pub struct ExtraAllocations {
    blocks: Vec<usize>,
}

impl ExtraAllocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, address: usize) {
        self.blocks.push(address);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks.iter().copied()
    }

    /// Release every block, newest first; failures are logged and skipped
    pub fn release_all(&mut self, memory: &dyn VirtualMemory) {
        while let Some(address) = self.blocks.pop() {
            if let Err(err) = memory.release(address) {
                warn!("[MM] failed to release parked block {:#x}: {}", address, err);
            }
        }
    }
}

/// The reserved image range plus anything parked on the way
#[derive(Debug)]
pub struct Reservation {
    pub region: MappedRegion,
    pub extra: ExtraAllocations,
}

/// Whether `[base, base + size)` crosses a 4 GiB boundary
///
/// Only meaningful for 64-bit hosts; a 32-bit address space never does.
pub fn straddles_4gib(base: usize, size: usize) -> bool {
    if cfg!(target_pointer_width = "64") {
        ((base as u64) >> 32) < ((base as u64).saturating_add(size as u64) >> 32)
    } else {
        false
    }
}

/// Reserve and commit `size` bytes for an image, preferring `preferred`
///
/// On 64-bit hosts a range that straddles a 4 GiB boundary is parked and
/// the reservation retried, at most `max_attempts` times in total. The
/// whole range is committed read/write so that section tails past their raw
/// data are backed before image code runs.
pub fn reserve_image(
    memory: &dyn VirtualMemory,
    size: usize,
    preferred: Option<usize>,
    max_attempts: usize,
) -> Result<Reservation, LoadError> {
    let first = match preferred {
        Some(address) => match memory.reserve(size, Some(address)) {
            Ok(base) => Ok(base),
            Err(err) => {
                debug!("[MM] preferred base {:#x} unavailable ({}), relocating", address, err);
                memory.reserve(size, None)
            }
        },
        None => memory.reserve(size, None),
    };
    let mut base = first.map_err(|_| LoadError::ReservationFailed { size })?;

    let mut extra = ExtraAllocations::new();
    while straddles_4gib(base, size) {
        extra.push(base);
        if extra.len() >= max_attempts.max(1) {
            extra.release_all(memory);
            return Err(LoadError::ReservationFailed { size });
        }
        debug!("[MM] block {:#x} straddles a 4 GiB boundary, retrying", base);
        base = match memory.reserve(size, None) {
            Ok(base) => base,
            Err(_) => {
                extra.release_all(memory);
                return Err(LoadError::ReservationFailed { size });
            }
        };
    }

    if memory.commit(base, size, Protection::READWRITE).is_err() {
        if let Err(err) = memory.release(base) {
            warn!("[MM] failed to release {:#x}: {}", base, err);
        }
        extra.release_all(memory);
        return Err(LoadError::CommitFailed { address: base, size });
    }

    // SAFETY: the range was just reserved and is owned by the caller.
    let region = unsafe { MappedRegion::new(base, size) };
    Ok(Reservation { region, extra })
}
