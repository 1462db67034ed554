//! Import binding

use core::mem::size_of;

use log::{debug, trace};

use crate::error::LoadError;
use crate::ldr::export::Symbol;
use crate::ldr::library::{Dependency, DependencyLoader};
use crate::ldr::pe::{directory_entry, snap_by_ordinal, thunk_ordinal, ImageImportDescriptor};
use crate::mm::MappedRegion;
use crate::rtl::image::{ByteView, HeaderLayout};

fn utf8(bytes: &[u8]) -> Result<&str, LoadError> {
    core::str::from_utf8(bytes).map_err(|_| LoadError::MalformedImage("import name is not valid UTF-8"))
}

/// Load every dependency and patch the import address tables
///
/// Handles are appended to `dependencies` as they are acquired. On failure
/// the handles acquired by this call are dropped before returning.
///
/// # Safety
/// The import tables must be committed and writable.
pub unsafe fn bind_imports(
    region: &MappedRegion,
    layout: &HeaderLayout,
    loader: &dyn DependencyLoader,
    dependencies: &mut Vec<Box<dyn Dependency>>,
) -> Result<(), LoadError> {
    let mark = dependencies.len();
    let result = bind_all(region, layout, loader, dependencies);
    if result.is_err() {
        while dependencies.len() > mark {
            drop(dependencies.pop());
        }
    }
    result
}

unsafe fn bind_all(
    region: &MappedRegion,
    layout: &HeaderLayout,
    loader: &dyn DependencyLoader,
    dependencies: &mut Vec<Box<dyn Dependency>>,
) -> Result<(), LoadError> {
    let directory = layout.data_directory(region, directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT)?;
    if !directory.is_present() {
        return Ok(());
    }

    let start = directory.virtual_address as usize;
    let count = directory.size as usize / size_of::<ImageImportDescriptor>();
    for index in 0..count {
        let descriptor: ImageImportDescriptor =
            region.read(start + index * size_of::<ImageImportDescriptor>())?;
        if descriptor.name == 0 {
            break;
        }

        let name = utf8(region.read_cstr(descriptor.name as usize)?)?;
        debug!("[LDR] importing from {}", name);
        let dependency = loader.load_dependency(name)?;
        dependencies.push(dependency);
        if let Some(dependency) = dependencies.last() {
            bind_descriptor(region, &descriptor, dependency.as_ref())?;
        }
    }
    Ok(())
}

unsafe fn bind_descriptor(
    region: &MappedRegion,
    descriptor: &ImageImportDescriptor,
    dependency: &dyn Dependency,
) -> Result<(), LoadError> {
    let slots = descriptor.first_thunk as usize;
    let lookup = match descriptor.original_first_thunk {
        0 => slots,
        rva => rva as usize,
    };

    for index in 0.. {
        let thunk: usize = region.read(lookup + index * size_of::<usize>())?;
        if thunk == 0 {
            break;
        }

        let symbol = if snap_by_ordinal(thunk) {
            Symbol::Ordinal(thunk_ordinal(thunk))
        } else {
            // Skip the two-byte hint.
            Symbol::Name(utf8(region.read_cstr(thunk + 2)?)?)
        };
        let address = dependency
            .resolve(symbol)
            .ok_or_else(|| LoadError::SymbolNotFound(format!("{}!{}", dependency.name(), symbol)))?;
        trace!("[LDR] {}!{} -> {:#x}", dependency.name(), symbol, address);
        region.write(slots + index * size_of::<usize>(), address)?;
    }
    Ok(())
}
