//! Loader error types

use core::fmt;

/// Failure of a load, or of a lookup on a loaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Headers are missing, inconsistent, or point outside the image
    MalformedImage(&'static str),
    /// Section raw data extends past the end of the buffer
    TruncatedImage {
        needed: usize,
        available: usize,
    },
    /// No address range of the required size could be reserved
    ReservationFailed {
        size: usize,
    },
    /// Committing pages inside the image failed
    CommitFailed {
        address: usize,
        size: usize,
    },
    /// Image is not at its preferred base and carries no relocations
    RelocationRequiredButMissing,
    /// An imported module could not be located
    DependencyNotFound(String),
    /// Imported modules reference each other in a loop
    DependencyCycle(String),
    /// An import or export could not be resolved
    SymbolNotFound(String),
    /// Changing page protection failed
    ProtectionFailed {
        address: usize,
        size: usize,
    },
    /// The library entry point reported failure on attach
    EntryPointFailed,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::MalformedImage(why) => write!(f, "malformed image: {}", why),
            LoadError::TruncatedImage { needed, available } => write!(
                f,
                "truncated image: {} bytes needed, {} available",
                needed, available
            ),
            LoadError::ReservationFailed { size } => {
                write!(f, "could not reserve {:#x} bytes of address space", size)
            }
            LoadError::CommitFailed { address, size } => {
                write!(f, "could not commit {:#x} bytes at {:#x}", size, address)
            }
            LoadError::RelocationRequiredButMissing => {
                write!(f, "image must be relocated but has no relocation data")
            }
            LoadError::DependencyNotFound(name) => write!(f, "dependency not found: {}", name),
            LoadError::DependencyCycle(name) => write!(f, "dependency cycle through {}", name),
            LoadError::SymbolNotFound(symbol) => write!(f, "symbol not found: {}", symbol),
            LoadError::ProtectionFailed { address, size } => write!(
                f,
                "could not change protection of {:#x} bytes at {:#x}",
                size, address
            ),
            LoadError::EntryPointFailed => write!(f, "library entry point failed"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Failure reported by a virtual memory backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryError {
    /// OS error code, or 0 when the backend has none
    pub code: u32,
}

impl MemoryError {
    pub const fn new(code: u32) -> Self {
        Self { code }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "virtual memory operation failed (code {})", self.code)
    }
}

impl std::error::Error for MemoryError {}
