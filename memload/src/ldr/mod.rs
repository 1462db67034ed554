//! Loader (ldr)
//!
//! Maps a PE image held in a byte buffer into the current address space the
//! way the system loader maps one from disk:
//!
//! - Validating the headers of the untrusted buffer
//! - Mapping headers and sections into a fresh reservation
//! - Processing base relocations
//! - Binding imports against dependencies
//! - Applying final page protection
//! - Running the entry point and TLS callbacks
//!
//! # Architecture
//!
//! ```text
//! Buffer                    Loaded Image in Memory
//! ┌─────────────────┐      ┌─────────────────┐ ◄── code_base
//! │ DOS Header      │ ──►  │ Headers         │
//! │ PE Headers      │      │ (ImageBase =    │
//! │ Section Table   │      │  code_base)     │
//! ├─────────────────┤      ├─────────────────┤
//! │ .text (code)    │ ──►  │ .text    (RX)   │
//! ├─────────────────┤      ├─────────────────┤
//! │ .data (init)    │ ──►  │ .data    (RW)   │
//! ├─────────────────┤      ├─────────────────┤
//! │ .rdata (const)  │ ──►  │ .rdata   (R)    │ ◄── IAT patched
//! ├─────────────────┤      ├─────────────────┤
//! │ .reloc          │ ──►  │ .reloc          │ ◄── decommitted
//! └─────────────────┘      └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use memload::{Host, LoadedImage, NoDependencies, Symbol};
//!
//! let image = LoadedImage::load(&bytes, &Host::native(), &NoDependencies)?;
//! let address = image.resolve(Symbol::Name("test"))?;
//! image.unload();
//! ```

pub mod export;
pub mod import;
pub mod library;
pub mod pe;
pub mod reloc;
pub mod section;
pub mod tls;

pub use export::Symbol;
pub use library::{Dependency, DependencyLoader, Library, NoDependencies, SharedImage};

use core::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::LoadError;
use crate::mm::{align_value_up, reserve_image, ExtraAllocations, MappedRegion, VirtualMemory};
use crate::ps::{Notification, ProcessHooks};
use crate::rtl::image::HeaderLayout;
use export::ExportIndex;
use section::Finalizer;

/// The memory and process services a load runs against
#[derive(Clone)]
pub struct Host {
    memory: Arc<dyn VirtualMemory>,
    process: Arc<dyn ProcessHooks>,
}

impl Host {
    pub fn new(memory: Arc<dyn VirtualMemory>, process: Arc<dyn ProcessHooks>) -> Self {
        Self { memory, process }
    }

    /// The current process, through the Win32 API
    #[cfg(windows)]
    pub fn native() -> Self {
        Self::new(
            Arc::new(crate::mm::native::NativeMemory::new()),
            Arc::new(crate::ps::NativeProcess),
        )
    }

    pub fn memory(&self) -> &dyn VirtualMemory {
        self.memory.as_ref()
    }

    pub fn process(&self) -> &dyn ProcessHooks {
        self.process.as_ref()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").field("page_size", &self.memory.page_size()).finish()
    }
}

/// Load-time knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Try the image's declared base before any other address
    pub prefer_image_base: bool,
    /// Leave discardable sections committed after finalization
    pub keep_discardable: bool,
    /// Reservations tried before giving up on a range that avoids 4 GiB
    /// boundaries
    pub max_reservation_attempts: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            prefer_image_base: true,
            keep_discardable: false,
            max_reservation_attempts: 16,
        }
    }
}

/// An image mapped into the address space
///
/// Owns its reservation, any parked reservations, and the handles of the
/// modules it imports from. Dropping it unloads it.
pub struct LoadedImage {
    host: Host,
    region: MappedRegion,
    layout: HeaderLayout,
    extra: ExtraAllocations,
    dependencies: Vec<Box<dyn Dependency>>,
    exports: ExportIndex,
    is_dll: bool,
    is_relocated: bool,
    initialized: bool,
    entry: Option<usize>,
    tls_callbacks: Vec<usize>,
    tls_attached: bool,
    function_table: Option<usize>,
}

impl LoadedImage {
    /// Load `data` with default options
    pub fn load(
        data: &[u8],
        host: &Host,
        loader: &dyn DependencyLoader,
    ) -> Result<Self, LoadError> {
        Self::load_with_options(data, host, loader, &LoadOptions::default())
    }

    /// Load `data`
    ///
    /// Either the image is fully loaded and initialized, or everything
    /// acquired on the way has been released again.
    pub fn load_with_options(
        data: &[u8],
        host: &Host,
        loader: &dyn DependencyLoader,
        options: &LoadOptions,
    ) -> Result<Self, LoadError> {
        let memory = host.memory();
        let page_size = memory.page_size();

        let layout = HeaderLayout::parse(data, page_size)?;
        let file_header = layout.file_header(data)?;
        let optional = layout.optional_header(data)?;

        let declared_base = optional.image_base as usize;
        let image_size = align_value_up(optional.size_of_image as usize, page_size);
        let preferred = options.prefer_image_base.then_some(declared_base);
        let reservation =
            reserve_image(memory, image_size, preferred, options.max_reservation_attempts)?;

        // From here on, dropping `image` releases whatever has been acquired.
        let mut image = LoadedImage {
            host: host.clone(),
            region: reservation.region,
            layout,
            extra: reservation.extra,
            dependencies: Vec::new(),
            exports: ExportIndex::new(),
            is_dll: file_header.is_dll(),
            is_relocated: reservation.region.base() != declared_base,
            initialized: false,
            entry: None,
            tls_callbacks: Vec::new(),
            tls_attached: false,
            function_table: None,
        };
        debug!(
            "[LDR] reserved {:#x} bytes at {:#x} (declared {:#x})",
            image_size,
            image.region.base(),
            declared_base
        );

        // SAFETY: the region was just reserved for this image and nothing
        // else refers to it.
        unsafe {
            section::copy_headers(data, &image.layout, &image.region, memory)?;
            section::copy_sections(data, &image.layout, &image.region, memory)?;

            let delta = image.region.base().wrapping_sub(declared_base);
            reloc::relocate(&image.region, &image.layout, delta)?;

            import::bind_imports(&image.region, &image.layout, loader, &mut image.dependencies)?;
        }

        image.tls_callbacks = tls::tls_callbacks(&image.region, &image.layout)?;
        image.register_function_table()?;

        Finalizer {
            memory,
            region: &image.region,
            layout: &image.layout,
            page_size,
            keep_discardable: options.keep_discardable,
        }
        .finalize_sections()?;

        image.run_initializers(optional.address_of_entry_point as usize)?;

        info!(
            "[LDR] loaded {} at {:#x} ({} dependencies)",
            if image.is_dll { "library" } else { "executable" },
            image.region.base(),
            image.dependencies.len()
        );
        Ok(image)
    }

    fn register_function_table(&mut self) -> Result<(), LoadError> {
        if let Some((table, count)) = tls::exception_table(&self.region, &self.layout)? {
            // SAFETY: the table lies inside the image, which outlives the
            // registration.
            let added = unsafe {
                self.host.process().add_function_table(table, count, self.region.base())
            };
            if added {
                self.function_table = Some(table);
            } else {
                warn!("[LDR] could not register {} unwind entries", count);
            }
        }
        Ok(())
    }

    fn run_initializers(&mut self, entry_rva: usize) -> Result<(), LoadError> {
        let hooks = self.host.process.clone();
        let base = self.region.base();

        if !self.tls_callbacks.is_empty() {
            // SAFETY: callbacks were checked to lie inside the finalized image.
            unsafe { hooks.dispatch_tls(base, &self.tls_callbacks, Notification::ProcessAttach) };
            self.tls_attached = true;
        }

        if entry_rva == 0 {
            return Ok(());
        }
        let entry = self.region.address(entry_rva, 1)?;
        self.entry = Some(entry);

        if self.is_dll {
            // SAFETY: entry is inside the finalized image.
            if !unsafe { hooks.call_library_entry(entry, base, Notification::ProcessAttach) } {
                return Err(LoadError::EntryPointFailed);
            }
            self.initialized = true;
        }
        Ok(())
    }

    /// Address of an exported symbol
    pub fn resolve<'a>(&self, symbol: impl Into<Symbol<'a>>) -> Result<usize, LoadError> {
        export::find_export(&self.region, &self.layout, &self.exports, symbol.into())
    }

    /// Entry point of an executable image, for the caller to invoke
    pub fn entry_point(&self) -> Option<usize> {
        if self.is_dll {
            None
        } else {
            self.entry
        }
    }

    /// Run the entry point of an executable image
    ///
    /// # Safety
    /// Runs image code on the calling thread; the image decides what happens
    /// next (an executable entry usually never returns).
    pub unsafe fn call_entry_point(&self) -> Option<i32> {
        let entry = self.entry_point()?;
        Some(self.host.process().call_executable_entry(entry))
    }

    /// Actual base address
    pub fn code_base(&self) -> usize {
        self.region.base()
    }

    /// Size of the mapped image
    pub fn image_size(&self) -> usize {
        self.region.size()
    }

    pub fn is_dll(&self) -> bool {
        self.is_dll
    }

    /// Whether the image is mapped somewhere other than its declared base
    pub fn is_relocated(&self) -> bool {
        self.is_relocated
    }

    /// Whether the library entry point accepted the attach
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn tls_callbacks(&self) -> &[usize] {
        &self.tls_callbacks
    }

    /// Names of the dependencies, in import order
    pub fn dependency_names(&self) -> Vec<&str> {
        self.dependencies.iter().map(|d| d.name()).collect()
    }

    /// Unload the image
    pub fn unload(self) {
        drop(self);
    }
}

impl Drop for LoadedImage {
    fn drop(&mut self) {
        let hooks = self.host.process.clone();
        let memory = self.host.memory.clone();
        let base = self.region.base();

        // SAFETY: the image is still mapped; every address below came from
        // this image.
        unsafe {
            if self.initialized {
                if let Some(entry) = self.entry {
                    hooks.call_library_entry(entry, base, Notification::ProcessDetach);
                }
                self.initialized = false;
            }
            if self.tls_attached {
                hooks.dispatch_tls(base, &self.tls_callbacks, Notification::ProcessDetach);
                self.tls_attached = false;
            }
            if let Some(table) = self.function_table.take() {
                if !hooks.delete_function_table(table) {
                    warn!("[LDR] could not deregister unwind table {:#x}", table);
                }
            }
        }

        while let Some(dependency) = self.dependencies.pop() {
            drop(dependency);
        }

        if let Err(err) = memory.release(base) {
            warn!("[LDR] failed to release image at {:#x}: {}", base, err);
        }
        self.extra.release_all(memory.as_ref());
        debug!("[LDR] unloaded image at {:#x}", base);
    }
}

impl fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedImage")
            .field("code_base", &format_args!("{:#x}", self.region.base()))
            .field("image_size", &self.region.size())
            .field("is_dll", &self.is_dll)
            .field("is_relocated", &self.is_relocated)
            .field("initialized", &self.initialized)
            .field("dependencies", &self.dependency_names())
            .finish()
    }
}
