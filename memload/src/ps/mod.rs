//! Process hooks (ps)
//!
//! The points where a loaded image meets the running process:
//!
//! - **Entry points**: DllMain-style library entry, executable entry
//! - **TLS callbacks**: per-image thread-local-storage notifications
//! - **Function tables**: unwind data registration for exception dispatch
//!
//! The loader only ever reaches image code through `ProcessHooks`, so tests
//! can observe the calls without executing anything.

#[cfg(windows)]
pub mod native;

#[cfg(windows)]
pub use native::NativeProcess;

use crate::ldr::pe::dll_reason;

/// Reason passed to library entry points and TLS callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    ProcessDetach,
    ProcessAttach,
}

impl Notification {
    /// The DLL_PROCESS_* value
    pub fn as_raw(self) -> u32 {
        match self {
            Notification::ProcessDetach => dll_reason::DLL_PROCESS_DETACH,
            Notification::ProcessAttach => dll_reason::DLL_PROCESS_ATTACH,
        }
    }
}

/// Calls into image code and process-wide registration
///
/// All methods are unsafe: addresses come from a loaded image and are
/// executed or registered as-is.
pub trait ProcessHooks: Send + Sync {
    /// Invoke `BOOL entry(HINSTANCE base, DWORD reason, LPVOID reserved)`
    ///
    /// # Safety
    /// `entry` must be the entry point of the image mapped at `base`.
    unsafe fn call_library_entry(&self, entry: usize, base: usize, reason: Notification) -> bool;

    /// Invoke an executable entry point and return its exit code
    ///
    /// # Safety
    /// `entry` must be the entry point of a loaded executable image.
    unsafe fn call_executable_entry(&self, entry: usize) -> i32;

    /// Run TLS callbacks in order
    ///
    /// # Safety
    /// Every callback must be code inside the image mapped at `base`.
    unsafe fn dispatch_tls(&self, base: usize, callbacks: &[usize], reason: Notification);

    /// Register `count` runtime function entries at `table`
    ///
    /// # Safety
    /// `table` must stay mapped until `delete_function_table` is called.
    unsafe fn add_function_table(&self, table: usize, count: usize, base: usize) -> bool;

    /// # Safety
    /// `table` must have been registered with `add_function_table`.
    unsafe fn delete_function_table(&self, table: usize) -> bool;
}
