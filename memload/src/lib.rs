//! memload
//!
//! Loads a PE image (DLL or EXE) from a byte buffer into the running process,
//! exposes its exports, and unloads it again without touching the file
//! system.
//!
//! # Layout
//!
//! - **ldr** - Loader: the load pipeline, exports, imports, dependency library
//! - **mm** - Memory Manager: reservation, protection, the `VirtualMemory` seam
//! - **ps** - Process hooks: entry points, TLS callbacks, unwind tables
//! - **rtl** - Runtime Library: header layout and byte views
//!
//! # Pipeline
//!
//! ```text
//! validate ─► reserve ─► map sections ─► relocate ─► bind imports
//!     ─► TLS / unwind tables ─► finalize protection ─► entry point
//! ```
//!
//! Every step either succeeds or the image is torn down before the error is
//! returned; a failed load leaves nothing reserved.

pub mod error;
pub mod ldr;
pub mod mm;
pub mod ps;
pub mod rtl;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{LoadError, MemoryError};
pub use ldr::{
    Dependency, DependencyLoader, Host, Library, LoadOptions, LoadedImage, NoDependencies,
    SharedImage, Symbol,
};
pub use mm::{Protection, VirtualMemory};
pub use ps::{Notification, ProcessHooks};

#[cfg(windows)]
pub use ldr::library::{SystemLoader, SystemModule};

/// Load an image from `data`
pub fn load(
    data: &[u8],
    host: &Host,
    loader: &dyn DependencyLoader,
) -> Result<LoadedImage, LoadError> {
    LoadedImage::load(data, host, loader)
}

/// Address of an export of a loaded image
pub fn resolve<'a>(image: &LoadedImage, symbol: impl Into<Symbol<'a>>) -> Result<usize, LoadError> {
    image.resolve(symbol)
}

/// Unload an image, releasing everything it holds
pub fn unload(image: LoadedImage) {
    image.unload();
}

/// Load an image into the current process, resolving imports through the
/// system loader
#[cfg(windows)]
pub fn load_library(data: &[u8]) -> Result<LoadedImage, LoadError> {
    LoadedImage::load(data, &Host::native(), &SystemLoader)
}
