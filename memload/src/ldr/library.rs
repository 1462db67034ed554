//! Dependency resolution
//!
//! A `DependencyLoader` turns an import name into a `Dependency` handle that
//! resolves symbols and releases the module when dropped. `Library` is a
//! registry of in-memory images that loads them, and their registered
//! dependencies, through the full loader pipeline.
//!
//! # Load order
//!
//! `Library::open` never recurses. It walks the import graph with an explicit
//! stack and an in-progress set, producing a leaves-first order:
//!
//! ```text
//!   app.dll ─► net.dll ─► util.dll
//!        └───────────────► util.dll
//!
//!   order: util.dll, net.dll, app.dll
//! ```
//!
//! A name found on the in-progress set again closes a cycle and fails the
//! open with `DependencyCycle`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use log::{debug, trace};
use spin::Mutex;

use crate::error::LoadError;
use crate::ldr::export::Symbol;
use crate::ldr::{Host, LoadOptions, LoadedImage};
use crate::rtl::image::{import_names, HeaderLayout};

/// A loaded module that imports are bound against
///
/// Dropping the handle releases the module.
pub trait Dependency: Send + Sync {
    fn name(&self) -> &str;

    /// Address of an exported symbol
    fn resolve(&self, symbol: Symbol<'_>) -> Option<usize>;
}

/// Locates the modules an image imports from
pub trait DependencyLoader: Send + Sync {
    fn load_dependency(&self, name: &str) -> Result<Box<dyn Dependency>, LoadError>;
}

/// Loader for images that import nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

impl DependencyLoader for NoDependencies {
    fn load_dependency(&self, name: &str) -> Result<Box<dyn Dependency>, LoadError> {
        Err(LoadError::DependencyNotFound(name.to_string()))
    }
}

/// A dependency backed by an image this crate loaded
pub struct SharedImage {
    name: String,
    image: Arc<LoadedImage>,
}

impl SharedImage {
    pub fn new(name: impl Into<String>, image: Arc<LoadedImage>) -> Self {
        Self { name: name.into(), image }
    }

    pub fn image(&self) -> &Arc<LoadedImage> {
        &self.image
    }
}

impl Dependency for SharedImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, symbol: Symbol<'_>) -> Option<usize> {
        self.image.resolve(symbol).ok()
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[derive(Default)]
struct Registry {
    sources: BTreeMap<String, Arc<[u8]>>,
    loaded: BTreeMap<String, Weak<LoadedImage>>,
}

impl Registry {
    fn live(&self, key: &str) -> Option<Arc<LoadedImage>> {
        self.loaded.get(key).and_then(Weak::upgrade)
    }

    fn needs_load(&self, key: &str) -> bool {
        self.sources.contains_key(key) && self.live(key).is_none()
    }

    /// Registered imports of `key`, reversed so that popping yields file order
    fn pending_imports(&self, key: &str, page_size: usize) -> Result<Vec<String>, LoadError> {
        let data = match self.sources.get(key) {
            Some(data) => data,
            None => return Ok(Vec::new()),
        };
        let layout = HeaderLayout::parse(data, page_size)?;
        let mut names: Vec<String> = import_names(data, &layout)?
            .iter()
            .map(|name| normalize(name))
            .collect();
        names.reverse();
        Ok(names)
    }

    /// Not-yet-loaded registered images reachable from `root`, leaves first
    fn load_order(&self, root: &str, page_size: usize) -> Result<Vec<String>, LoadError> {
        struct Frame {
            name: String,
            remaining: Vec<String>,
        }

        let mut order = Vec::new();
        let mut done = BTreeSet::new();
        let mut in_progress = BTreeSet::new();
        let mut stack = vec![Frame {
            name: root.to_string(),
            remaining: self.pending_imports(root, page_size)?,
        }];
        in_progress.insert(root.to_string());

        loop {
            let next = match stack.last_mut() {
                Some(frame) => frame.remaining.pop(),
                None => break,
            };
            match next {
                Some(dependency) => {
                    if done.contains(&dependency) || !self.needs_load(&dependency) {
                        continue;
                    }
                    if in_progress.contains(&dependency) {
                        return Err(LoadError::DependencyCycle(dependency));
                    }
                    let remaining = self.pending_imports(&dependency, page_size)?;
                    in_progress.insert(dependency.clone());
                    stack.push(Frame { name: dependency, remaining });
                }
                None => {
                    if let Some(frame) = stack.pop() {
                        in_progress.remove(&frame.name);
                        done.insert(frame.name.clone());
                        order.push(frame.name);
                    }
                }
            }
        }
        Ok(order)
    }
}

/// Resolves imports during `Library::open` against the registry it locks
struct StagedLoader<'a> {
    registry: &'a Registry,
    fallback: Option<&'a dyn DependencyLoader>,
}

impl DependencyLoader for StagedLoader<'_> {
    fn load_dependency(&self, name: &str) -> Result<Box<dyn Dependency>, LoadError> {
        let key = normalize(name);
        if let Some(image) = self.registry.live(&key) {
            return Ok(Box::new(SharedImage::new(key, image)));
        }
        match self.fallback {
            Some(fallback) => fallback.load_dependency(name),
            None => Err(LoadError::DependencyNotFound(name.to_string())),
        }
    }
}

/// Registry of in-memory images that load each other
///
/// Names are case-insensitive. Each image is loaded at most once while any
/// handle to it is alive; later opens share the same `LoadedImage`.
pub struct Library {
    host: Host,
    options: LoadOptions,
    fallback: Option<Box<dyn DependencyLoader>>,
    registry: Mutex<Registry>,
}

impl Library {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            options: LoadOptions::default(),
            fallback: None,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// Loader for names that are not registered
    pub fn with_fallback(mut self, fallback: impl DependencyLoader + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Make an image available under `name`
    pub fn register(&self, name: &str, data: impl Into<Arc<[u8]>>) {
        self.registry.lock().sources.insert(normalize(name), data.into());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.lock().sources.contains_key(&normalize(name))
    }

    /// Whether an image for `name` is currently alive
    pub fn is_loaded(&self, name: &str) -> bool {
        self.registry.lock().live(&normalize(name)).is_some()
    }

    /// Load a registered image together with its registered dependencies
    ///
    /// The registry lock is held for the whole open, including the entry
    /// points and TLS callbacks of every image it loads. Concurrent opens are
    /// serialized and share one load. Image code must not call back into the
    /// same `Library` while it is being opened; the lock is a spin lock and
    /// such a call never returns.
    pub fn open(&self, name: &str) -> Result<Arc<LoadedImage>, LoadError> {
        let key = normalize(name);
        let mut registry = self.registry.lock();
        if let Some(image) = registry.live(&key) {
            trace!("[LDR] {} already loaded", key);
            return Ok(image);
        }
        if !registry.sources.contains_key(&key) {
            return Err(LoadError::DependencyNotFound(name.to_string()));
        }

        let page_size = self.host.memory().page_size();
        let order = registry.load_order(&key, page_size)?;
        debug!("[LDR] load order for {}: {:?}", key, order);

        // Holds every image of this open until the root owns its dependencies.
        let mut staged = Vec::with_capacity(order.len());
        for module in order {
            let data = match registry.sources.get(&module) {
                Some(data) => data.clone(),
                None => return Err(LoadError::DependencyNotFound(module)),
            };
            let loader = StagedLoader { registry: &registry, fallback: self.fallback.as_deref() };
            let image = Arc::new(LoadedImage::load_with_options(
                &data,
                &self.host,
                &loader,
                &self.options,
            )?);
            registry.loaded.insert(module, Arc::downgrade(&image));
            staged.push(image);
        }

        staged.pop().ok_or(LoadError::DependencyNotFound(name.to_string()))
    }
}

impl DependencyLoader for Library {
    fn load_dependency(&self, name: &str) -> Result<Box<dyn Dependency>, LoadError> {
        if self.is_registered(name) {
            let image = self.open(name)?;
            return Ok(Box::new(SharedImage::new(normalize(name), image)));
        }
        match &self.fallback {
            Some(fallback) => fallback.load_dependency(name),
            None => Err(LoadError::DependencyNotFound(name.to_string())),
        }
    }
}

#[cfg(windows)]
pub use system::{SystemLoader, SystemModule};

#[cfg(windows)]
mod system {
    use core::ffi::c_void;
    use std::ffi::CString;

    use log::warn;
    use windows::core::PCSTR;
    use windows::Win32::Foundation::{FreeLibrary, HMODULE};
    use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

    use super::{Dependency, DependencyLoader};
    use crate::error::LoadError;
    use crate::ldr::export::Symbol;

    /// Resolves dependencies through the operating system loader
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemLoader;

    /// A module loaded by the operating system
    #[derive(Debug)]
    pub struct SystemModule {
        name: String,
        handle: usize,
    }

    impl SystemModule {
        fn module(&self) -> HMODULE {
            HMODULE(self.handle as *mut c_void)
        }
    }

    impl DependencyLoader for SystemLoader {
        fn load_dependency(&self, name: &str) -> Result<Box<dyn Dependency>, LoadError> {
            let not_found = || LoadError::DependencyNotFound(name.to_string());
            let path = CString::new(name).map_err(|_| not_found())?;
            // SAFETY: `path` is NUL-terminated and outlives the call.
            let module = unsafe { LoadLibraryA(PCSTR(path.as_ptr() as *const u8)) }
                .map_err(|_| not_found())?;
            Ok(Box::new(SystemModule { name: name.to_string(), handle: module.0 as usize }))
        }
    }

    impl Dependency for SystemModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn resolve(&self, symbol: Symbol<'_>) -> Option<usize> {
            let address = match symbol {
                Symbol::Name(name) => {
                    let name = CString::new(name).ok()?;
                    // SAFETY: the module stays loaded while `self` lives.
                    unsafe { GetProcAddress(self.module(), PCSTR(name.as_ptr() as *const u8)) }
                }
                // SAFETY: as above; ordinals travel in the low word of the pointer.
                Symbol::Ordinal(ordinal) => unsafe {
                    GetProcAddress(self.module(), PCSTR(ordinal as usize as *const u8))
                },
            };
            address.map(|f| f as usize)
        }
    }

    impl Drop for SystemModule {
        fn drop(&mut self) {
            // SAFETY: the handle came from LoadLibraryA and is freed once.
            if let Err(err) = unsafe { FreeLibrary(self.module()) } {
                warn!("[LDR] FreeLibrary({}) failed: {}", self.name, err);
            }
        }
    }
}
