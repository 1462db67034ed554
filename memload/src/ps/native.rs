//! Windows process hooks

use core::ffi::c_void;
use core::mem;

use log::trace;

use super::{Notification, ProcessHooks};

type DllEntry = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;
type ExeEntry = unsafe extern "system" fn() -> i32;
type TlsCallback = unsafe extern "system" fn(*mut c_void, u32, *mut c_void);

/// Runs image code directly on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProcess;

impl ProcessHooks for NativeProcess {
    unsafe fn call_library_entry(&self, entry: usize, base: usize, reason: Notification) -> bool {
        trace!("[PS] DllMain {:#x} reason {}", entry, reason.as_raw());
        let entry: DllEntry = mem::transmute(entry);
        entry(base as *mut c_void, reason.as_raw(), core::ptr::null_mut()) != 0
    }

    unsafe fn call_executable_entry(&self, entry: usize) -> i32 {
        let entry: ExeEntry = mem::transmute(entry);
        entry()
    }

    unsafe fn dispatch_tls(&self, base: usize, callbacks: &[usize], reason: Notification) {
        for &callback in callbacks {
            trace!("[PS] TLS callback {:#x} reason {}", callback, reason.as_raw());
            let callback: TlsCallback = mem::transmute(callback);
            callback(base as *mut c_void, reason.as_raw(), core::ptr::null_mut());
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn add_function_table(&self, table: usize, count: usize, base: usize) -> bool {
        use windows::Win32::System::Diagnostics::Debug::{
            RtlAddFunctionTable, IMAGE_RUNTIME_FUNCTION_ENTRY,
        };
        let entries =
            core::slice::from_raw_parts(table as *const IMAGE_RUNTIME_FUNCTION_ENTRY, count);
        RtlAddFunctionTable(entries, base as u64).0 != 0
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn add_function_table(&self, _table: usize, _count: usize, _base: usize) -> bool {
        false
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn delete_function_table(&self, table: usize) -> bool {
        use windows::Win32::System::Diagnostics::Debug::{
            RtlDeleteFunctionTable, IMAGE_RUNTIME_FUNCTION_ENTRY,
        };
        RtlDeleteFunctionTable(table as *const IMAGE_RUNTIME_FUNCTION_ENTRY).0 != 0
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn delete_function_table(&self, _table: usize) -> bool {
        false
    }
}
