//! TLS callbacks and exception tables

use core::mem::size_of;

use log::debug;

use crate::error::LoadError;
use crate::ldr::pe::{directory_entry, ImageRuntimeFunctionEntry, ImageTlsDirectory};
use crate::mm::MappedRegion;
use crate::rtl::image::{ByteView, HeaderLayout};

/// Collect the TLS callback addresses of a relocated image
pub fn tls_callbacks(region: &MappedRegion, layout: &HeaderLayout) -> Result<Vec<usize>, LoadError> {
    let directory = layout.data_directory(region, directory_entry::IMAGE_DIRECTORY_ENTRY_TLS)?;
    if !directory.is_present() {
        return Ok(Vec::new());
    }

    let tls: ImageTlsDirectory = region.read(directory.virtual_address as usize)?;
    let array = tls.address_of_callbacks as usize;
    if array == 0 {
        return Ok(Vec::new());
    }

    let start = region.offset_of(array)?;
    let mut callbacks = Vec::new();
    loop {
        let callback: usize = region.read(start + callbacks.len() * size_of::<usize>())?;
        if callback == 0 {
            break;
        }
        if !region.contains(callback) {
            return Err(LoadError::MalformedImage("TLS callback outside the image"));
        }
        callbacks.push(callback);
    }
    debug!("[LDR] {} TLS callbacks", callbacks.len());
    Ok(callbacks)
}

/// Address and entry count of the exception table, if any
pub fn exception_table(
    region: &MappedRegion,
    layout: &HeaderLayout,
) -> Result<Option<(usize, usize)>, LoadError> {
    let directory = layout.data_directory(region, directory_entry::IMAGE_DIRECTORY_ENTRY_EXCEPTION)?;
    let count = directory.size as usize / size_of::<ImageRuntimeFunctionEntry>();
    if !directory.is_present() || count == 0 {
        return Ok(None);
    }
    let table = region.address(directory.virtual_address as usize, directory.size as usize)?;
    Ok(Some((table, count)))
}
