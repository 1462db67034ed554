//! Simulated host and synthetic images for unit tests
//!
//! `ArenaMemory` hands out reservations from one heap arena and tracks
//! commit state and protection per page, so load/unload accounting can be
//! checked without an OS loader. `RecordingHooks` records entry-point and
//! TLS notifications instead of executing image code. `ImageBuilder` writes
//! small but well-formed PE images for the host flavour.

use std::alloc::{self, Layout};
use std::collections::{BTreeMap, BTreeSet};
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;

use spin::Mutex;

use crate::error::MemoryError;
use crate::ldr::pe::*;
use crate::ldr::Host;
use crate::mm::{align_value_down, align_value_up, Protection, VirtualMemory};
use crate::ps::{Notification, ProcessHooks};
use crate::rtl::image::Pod;

pub(crate) const PAGE_SIZE: usize = 0x1000;

const ARENA_SIZE: usize = 256 * PAGE_SIZE;
// Twice the size, so the arena end never lands on a 4 GiB boundary.
const ARENA_ALIGN: usize = 2 * ARENA_SIZE;

const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
const ERROR_INVALID_ADDRESS: u32 = 487;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MemoryOp {
    Reserve { address: usize, size: usize },
    Commit { address: usize, size: usize },
    Protect { address: usize, size: usize, protection: Protection },
    Decommit { address: usize, size: usize },
    Release { address: usize },
}

#[derive(Default)]
struct ArenaState {
    reservations: BTreeMap<usize, usize>,
    pages: BTreeMap<usize, Protection>,
    ops: Vec<MemoryOp>,
    fail_commit_at: Option<usize>,
    fail_protect: bool,
}

impl ArenaState {
    fn reservation_for(&self, first: usize, end: usize) -> Option<(usize, usize)> {
        let (&start, &size) = self.reservations.range(..=first).next_back()?;
        (end <= start + size).then_some((start, size))
    }

    fn is_free(&self, address: usize, size: usize) -> bool {
        self.reservations
            .iter()
            .all(|(&start, &len)| address + size <= start || start + len <= address)
    }
}

/// Page-granular virtual memory simulated inside one heap allocation
pub(crate) struct ArenaMemory {
    base: usize,
    state: Mutex<ArenaState>,
}

impl ArenaMemory {
    pub fn new() -> Self {
        let layout = Self::layout();
        // SAFETY: non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena allocation failed");
        Self { base: base as usize, state: Mutex::new(ArenaState::default()) }
    }

    fn layout() -> Layout {
        Layout::from_size_align(ARENA_SIZE, ARENA_ALIGN).expect("arena layout")
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> usize {
        ARENA_SIZE
    }

    pub fn live_reservations(&self) -> usize {
        self.state.lock().reservations.len()
    }

    pub fn ops(&self) -> Vec<MemoryOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    pub fn protection_at(&self, address: usize) -> Option<Protection> {
        let page = align_value_down(address, PAGE_SIZE);
        self.state.lock().pages.get(&page).copied()
    }

    pub fn is_committed(&self, address: usize) -> bool {
        self.protection_at(address).is_some()
    }

    /// Make the next commit touching `address` fail
    pub fn fail_commit_at(&self, address: usize) {
        self.state.lock().fail_commit_at = Some(address);
    }

    pub fn fail_protect(&self, fail: bool) {
        self.state.lock().fail_protect = fail;
    }

    fn page_range(address: usize, size: usize) -> (usize, usize) {
        (
            align_value_down(address, PAGE_SIZE),
            align_value_up(address + size.max(1), PAGE_SIZE),
        )
    }
}

impl Drop for ArenaMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.base as *mut u8, Self::layout()) };
    }
}

impl VirtualMemory for ArenaMemory {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn reserve(&self, size: usize, preferred: Option<usize>) -> Result<usize, MemoryError> {
        let size = align_value_up(size, PAGE_SIZE);
        let end = self.base + ARENA_SIZE;
        let mut state = self.state.lock();
        if size == 0 {
            return Err(MemoryError::new(ERROR_INVALID_ADDRESS));
        }

        let address = match preferred {
            Some(address) => {
                let fits = address % PAGE_SIZE == 0
                    && address >= self.base
                    && address.checked_add(size).map_or(false, |e| e <= end);
                if !fits || !state.is_free(address, size) {
                    return Err(MemoryError::new(ERROR_INVALID_ADDRESS));
                }
                address
            }
            None => {
                let mut candidate = self.base;
                for (&start, &len) in state.reservations.iter() {
                    if candidate + size <= start {
                        break;
                    }
                    candidate = candidate.max(start + len);
                }
                if candidate + size > end {
                    return Err(MemoryError::new(ERROR_NOT_ENOUGH_MEMORY));
                }
                candidate
            }
        };

        state.reservations.insert(address, size);
        state.ops.push(MemoryOp::Reserve { address, size });
        Ok(address)
    }

    fn commit(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<(), MemoryError> {
        let (first, end) = Self::page_range(address, size);
        let mut state = self.state.lock();
        state
            .reservation_for(first, end)
            .ok_or(MemoryError::new(ERROR_INVALID_ADDRESS))?;
        if let Some(fail) = state.fail_commit_at {
            if fail >= first && fail < end {
                state.fail_commit_at = None;
                return Err(MemoryError::new(ERROR_NOT_ENOUGH_MEMORY));
            }
        }

        for page in (first..end).step_by(PAGE_SIZE) {
            if !state.pages.contains_key(&page) {
                // SAFETY: the page lies inside the arena.
                unsafe { ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE) };
            }
            state.pages.insert(page, protection);
        }
        state.ops.push(MemoryOp::Commit { address, size });
        Ok(())
    }

    fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError> {
        let (first, end) = Self::page_range(address, size);
        let mut state = self.state.lock();
        if state.fail_protect {
            return Err(MemoryError::new(ERROR_ACCESS_DENIED));
        }
        let old = *state.pages.get(&first).ok_or(MemoryError::new(ERROR_INVALID_ADDRESS))?;
        if !(first..end).step_by(PAGE_SIZE).all(|page| state.pages.contains_key(&page)) {
            return Err(MemoryError::new(ERROR_INVALID_ADDRESS));
        }
        for page in (first..end).step_by(PAGE_SIZE) {
            state.pages.insert(page, protection);
        }
        state.ops.push(MemoryOp::Protect { address, size, protection });
        Ok(old)
    }

    fn decommit(&self, address: usize, size: usize) -> Result<(), MemoryError> {
        let (first, end) = Self::page_range(address, size);
        let mut state = self.state.lock();
        state
            .reservation_for(first, end)
            .ok_or(MemoryError::new(ERROR_INVALID_ADDRESS))?;
        for page in (first..end).step_by(PAGE_SIZE) {
            state.pages.remove(&page);
        }
        state.ops.push(MemoryOp::Decommit { address, size });
        Ok(())
    }

    fn release(&self, address: usize) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        let size = state
            .reservations
            .remove(&address)
            .ok_or(MemoryError::new(ERROR_INVALID_ADDRESS))?;
        for page in (address..address + size).step_by(PAGE_SIZE) {
            state.pages.remove(&page);
        }
        state.ops.push(MemoryOp::Release { address });
        Ok(())
    }
}

/// Arena whose first unplaced reservations straddle a 4 GiB boundary
///
/// The straddling ranges are bookkeeping only. They are never committed or
/// touched, so a correct loader parks them and releases them later.
#[cfg(target_pointer_width = "64")]
pub(crate) struct StraddlingMemory {
    inner: ArenaMemory,
    decoys: Mutex<DecoyState>,
}

#[cfg(target_pointer_width = "64")]
#[derive(Default)]
struct DecoyState {
    remaining: usize,
    handed_out: usize,
    live: BTreeSet<usize>,
}

#[cfg(target_pointer_width = "64")]
impl StraddlingMemory {
    pub fn new(decoys: usize) -> Self {
        Self {
            inner: ArenaMemory::new(),
            decoys: Mutex::new(DecoyState { remaining: decoys, ..DecoyState::default() }),
        }
    }

    pub fn arena(&self) -> &ArenaMemory {
        &self.inner
    }

    pub fn live_decoys(&self) -> usize {
        self.decoys.lock().live.len()
    }

    pub fn decoys_handed_out(&self) -> usize {
        self.decoys.lock().handed_out
    }

    fn is_decoy(&self, address: usize) -> bool {
        self.decoys.lock().live.contains(&address)
    }
}

#[cfg(target_pointer_width = "64")]
impl VirtualMemory for StraddlingMemory {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn reserve(&self, size: usize, preferred: Option<usize>) -> Result<usize, MemoryError> {
        if preferred.is_none() {
            let mut decoys = self.decoys.lock();
            if decoys.remaining > 0 {
                decoys.remaining -= 1;
                decoys.handed_out += 1;
                // One page below the next 4 GiB line.
                let address = (decoys.handed_out << 32) - PAGE_SIZE;
                decoys.live.insert(address);
                return Ok(address);
            }
        }
        self.inner.reserve(size, preferred)
    }

    fn commit(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<(), MemoryError> {
        if self.is_decoy(address) {
            return Err(MemoryError::new(ERROR_INVALID_ADDRESS));
        }
        self.inner.commit(address, size, protection)
    }

    fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError> {
        if self.is_decoy(address) {
            return Err(MemoryError::new(ERROR_INVALID_ADDRESS));
        }
        self.inner.protect(address, size, protection)
    }

    fn decommit(&self, address: usize, size: usize) -> Result<(), MemoryError> {
        if self.is_decoy(address) {
            return Err(MemoryError::new(ERROR_INVALID_ADDRESS));
        }
        self.inner.decommit(address, size)
    }

    fn release(&self, address: usize) -> Result<(), MemoryError> {
        if self.decoys.lock().live.remove(&address) {
            return Ok(());
        }
        self.inner.release(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HookEvent {
    LibraryEntry { entry: usize, base: usize, reason: Notification },
    ExecutableEntry { entry: usize },
    Tls { base: usize, callbacks: Vec<usize>, reason: Notification },
    AddFunctionTable { table: usize, count: usize, base: usize },
    DeleteFunctionTable { table: usize },
}

struct HookState {
    events: Vec<HookEvent>,
    attach_result: bool,
    exit_code: i32,
}

/// Process hooks that record notifications instead of running image code
pub(crate) struct RecordingHooks {
    state: Mutex<HookState>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HookState { events: Vec::new(), attach_result: true, exit_code: 0 }),
        }
    }

    /// Value the library entry returns for `ProcessAttach`
    pub fn set_attach_result(&self, result: bool) {
        self.state.lock().attach_result = result;
    }

    pub fn set_exit_code(&self, code: i32) {
        self.state.lock().exit_code = code;
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.state.lock().events.clone()
    }
}

impl ProcessHooks for RecordingHooks {
    unsafe fn call_library_entry(&self, entry: usize, base: usize, reason: Notification) -> bool {
        let mut state = self.state.lock();
        state.events.push(HookEvent::LibraryEntry { entry, base, reason });
        reason != Notification::ProcessAttach || state.attach_result
    }

    unsafe fn call_executable_entry(&self, entry: usize) -> i32 {
        let mut state = self.state.lock();
        state.events.push(HookEvent::ExecutableEntry { entry });
        state.exit_code
    }

    unsafe fn dispatch_tls(&self, base: usize, callbacks: &[usize], reason: Notification) {
        self.state.lock().events.push(HookEvent::Tls {
            base,
            callbacks: callbacks.to_vec(),
            reason,
        });
    }

    unsafe fn add_function_table(&self, table: usize, count: usize, base: usize) -> bool {
        self.state.lock().events.push(HookEvent::AddFunctionTable { table, count, base });
        true
    }

    unsafe fn delete_function_table(&self, table: usize) -> bool {
        self.state.lock().events.push(HookEvent::DeleteFunctionTable { table });
        true
    }
}

/// Simulated memory and hooks wired into a `Host`
pub(crate) fn test_host() -> (Arc<ArenaMemory>, Arc<RecordingHooks>, Host) {
    let memory = Arc::new(ArenaMemory::new());
    let hooks = Arc::new(RecordingHooks::new());
    let host = Host::new(memory.clone(), hooks.clone());
    (memory, hooks, host)
}

// ============================================================================
// Image builder
// ============================================================================

const FILE_ALIGNMENT: usize = 0x200;
const SIZE_OF_HEADERS: usize = 0x400;
const NT_OFFSET: usize = 0x80;
const PTR: usize = size_of::<usize>();

#[cfg(target_pointer_width = "64")]
const NATIVE_RELOC: u16 = relocation_type::IMAGE_REL_BASED_DIR64;
#[cfg(not(target_pointer_width = "64"))]
const NATIVE_RELOC: u16 = relocation_type::IMAGE_REL_BASED_HIGHLOW;

#[cfg(target_pointer_width = "64")]
pub(crate) const DEFAULT_IMAGE_BASE: u64 = 0x1_8000_0000;
#[cfg(not(target_pointer_width = "64"))]
pub(crate) const DEFAULT_IMAGE_BASE: u64 = 0x1000_0000;

struct SectionSpec {
    name: String,
    characteristics: u32,
    data: Vec<u8>,
    virtual_size: usize,
}

enum ExportTarget {
    Code { section: usize, offset: u32 },
    Forward(String),
}

struct ExportSpec {
    name: Option<String>,
    target: ExportTarget,
}

#[derive(Clone)]
pub(crate) enum ImportSpec {
    Name(String),
    Ordinal(u16),
}

struct PointerSpec {
    section: usize,
    offset: usize,
    target_section: usize,
    target_offset: u32,
}

/// A built image plus the RVAs tests need to inspect it
pub(crate) struct BuiltImage {
    pub bytes: Vec<u8>,
    pub image_base: u64,
    pub section_rvas: Vec<u32>,
    /// Import address table slot RVAs, per import descriptor
    pub iat: Vec<Vec<u32>>,
}

impl BuiltImage {
    pub fn rva(&self, section: usize, offset: u32) -> u32 {
        self.section_rvas[section] + offset
    }
}

pub(crate) struct ImageBuilder {
    dll: bool,
    image_base: u64,
    section_alignment: u32,
    entry: Option<(usize, u32)>,
    sections: Vec<SectionSpec>,
    exports: Vec<ExportSpec>,
    ordinal_base: u32,
    imports: Vec<(String, Vec<ImportSpec>)>,
    lookup_tables: bool,
    relocations: Vec<(usize, u32, u16)>,
    pointers: Vec<PointerSpec>,
    tls_callbacks: Vec<(usize, u32)>,
    exception_entries: usize,
    strip_relocations: bool,
    initialized_data: u32,
    uninitialized_data: u32,
}

impl ImageBuilder {
    pub const CODE: u32 = 0x6000_0020;
    pub const DATA: u32 = 0xC000_0040;
    pub const RDATA: u32 = 0x4000_0040;
    pub const BSS: u32 = 0xC000_0080;
    pub const DISCARDABLE: u32 = 0x0200_0000;

    fn new(dll: bool) -> Self {
        Self {
            dll,
            image_base: DEFAULT_IMAGE_BASE,
            section_alignment: PAGE_SIZE as u32,
            entry: None,
            sections: Vec::new(),
            exports: Vec::new(),
            ordinal_base: 1,
            imports: Vec::new(),
            lookup_tables: true,
            relocations: Vec::new(),
            pointers: Vec::new(),
            tls_callbacks: Vec::new(),
            exception_entries: 0,
            strip_relocations: false,
            initialized_data: 0,
            uninitialized_data: 0,
        }
    }

    pub fn dll() -> Self {
        Self::new(true)
    }

    pub fn exe() -> Self {
        Self::new(false)
    }

    pub fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub fn section_alignment(mut self, alignment: u32) -> Self {
        self.section_alignment = alignment;
        self
    }

    pub fn section(mut self, name: &str, characteristics: u32, data: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            characteristics,
            data: data.to_vec(),
            virtual_size: data.len(),
        });
        self
    }

    /// Section with no raw data (e.g. `.bss`)
    pub fn empty_section(mut self, name: &str, characteristics: u32, virtual_size: usize) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            characteristics,
            data: Vec::new(),
            virtual_size,
        });
        self
    }

    pub fn data_sizes(mut self, initialized: u32, uninitialized: u32) -> Self {
        self.initialized_data = initialized;
        self.uninitialized_data = uninitialized;
        self
    }

    pub fn entry(mut self, section: usize, offset: u32) -> Self {
        self.entry = Some((section, offset));
        self
    }

    pub fn export(mut self, name: &str, section: usize, offset: u32) -> Self {
        self.exports.push(ExportSpec {
            name: Some(name.to_string()),
            target: ExportTarget::Code { section, offset },
        });
        self
    }

    /// Export reachable by ordinal only
    pub fn export_unnamed(mut self, section: usize, offset: u32) -> Self {
        self.exports.push(ExportSpec { name: None, target: ExportTarget::Code { section, offset } });
        self
    }

    pub fn export_forwarder(mut self, name: &str, forward: &str) -> Self {
        self.exports.push(ExportSpec {
            name: Some(name.to_string()),
            target: ExportTarget::Forward(forward.to_string()),
        });
        self
    }

    pub fn ordinal_base(mut self, base: u32) -> Self {
        self.ordinal_base = base;
        self
    }

    pub fn import(mut self, dll: &str, names: &[&str]) -> Self {
        let specs = names.iter().map(|n| ImportSpec::Name(n.to_string())).collect();
        self.imports.push((dll.to_string(), specs));
        self
    }

    pub fn import_specs(mut self, dll: &str, specs: &[ImportSpec]) -> Self {
        self.imports.push((dll.to_string(), specs.to_vec()));
        self
    }

    /// Emit imports with `OriginalFirstThunk == 0`
    pub fn without_lookup_tables(mut self) -> Self {
        self.lookup_tables = false;
        self
    }

    /// Raw relocation entry against `section + offset`
    pub fn relocation(mut self, section: usize, offset: u32, kind: u16) -> Self {
        self.relocations.push((section, offset, kind));
        self
    }

    /// Store the VA of `target_section + target_offset` at `section + offset`
    /// and emit a pointer-sized relocation for it
    pub fn pointer(
        mut self,
        section: usize,
        offset: usize,
        target_section: usize,
        target_offset: u32,
    ) -> Self {
        self.pointers.push(PointerSpec { section, offset, target_section, target_offset });
        self
    }

    pub fn tls_callback(mut self, section: usize, offset: u32) -> Self {
        self.tls_callbacks.push((section, offset));
        self
    }

    pub fn exception_entries(mut self, count: usize) -> Self {
        self.exception_entries = count;
        self
    }

    pub fn strip_relocations(mut self) -> Self {
        self.strip_relocations = true;
        self
    }

    pub fn build(self) -> BuiltImage {
        let mut sections = self.sections;
        let mut directories = [ImageDataDirectory::default(); IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
        let mut relocations = self.relocations;

        let mut next_rva = PAGE_SIZE;
        let mut section_rvas = Vec::new();
        for section in &sections {
            section_rvas.push(next_rva as u32);
            next_rva = align_value_up(next_rva + section.virtual_size.max(1), PAGE_SIZE);
        }
        let va = |rvas: &[u32], section: usize, offset: u32| -> u64 {
            self.image_base + (rvas[section] + offset) as u64
        };

        for pointer in &self.pointers {
            let value = va(&section_rvas, pointer.target_section, pointer.target_offset) as usize;
            put(&mut sections[pointer.section].data, pointer.offset, value);
            relocations.push((pointer.section, pointer.offset as u32, NATIVE_RELOC));
        }

        // Generated read-only data: exports, imports, TLS, exception table.
        let mut iat = Vec::new();
        let needs_rdata = !self.exports.is_empty()
            || !self.imports.is_empty()
            || !self.tls_callbacks.is_empty()
            || self.exception_entries > 0;
        if needs_rdata {
            let rdata_index = sections.len();
            let rdata_rva = next_rva as u32;
            let mut rdata = Vec::new();

            if !self.exports.is_empty() {
                let dir_off = rdata.len();
                rdata.resize(dir_off + size_of::<ImageExportDirectory>(), 0);
                let functions_off = rdata.len();
                rdata.resize(functions_off + 4 * self.exports.len(), 0);

                let mut named: Vec<(String, usize)> = self
                    .exports
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| e.name.clone().map(|n| (n, i)))
                    .collect();
                named.sort();

                let names_off = rdata.len();
                rdata.resize(names_off + 4 * named.len(), 0);
                let ordinals_off = rdata.len();
                rdata.resize(ordinals_off + 2 * named.len(), 0);

                for (slot, (name, index)) in named.iter().enumerate() {
                    let name_rva = rdata_rva + push_cstr(&mut rdata, name) as u32;
                    put(&mut rdata, names_off + 4 * slot, name_rva);
                    put(&mut rdata, ordinals_off + 2 * slot, *index as u16);
                }
                let dll_name_rva = rdata_rva + push_cstr(&mut rdata, "image.dll") as u32;

                for (index, export) in self.exports.iter().enumerate() {
                    let rva = match &export.target {
                        ExportTarget::Code { section, offset } => section_rvas[*section] + offset,
                        ExportTarget::Forward(target) => {
                            rdata_rva + push_cstr(&mut rdata, target) as u32
                        }
                    };
                    put(&mut rdata, functions_off + 4 * index, rva);
                }

                let directory = ImageExportDirectory {
                    name: dll_name_rva,
                    base: self.ordinal_base,
                    number_of_functions: self.exports.len() as u32,
                    number_of_names: named.len() as u32,
                    address_of_functions: rdata_rva + functions_off as u32,
                    address_of_names: rdata_rva + names_off as u32,
                    address_of_name_ordinals: rdata_rva + ordinals_off as u32,
                    ..Default::default()
                };
                put(&mut rdata, dir_off, directory);
                directories[directory_entry::IMAGE_DIRECTORY_ENTRY_EXPORT] = ImageDataDirectory {
                    virtual_address: rdata_rva + dir_off as u32,
                    size: (rdata.len() - dir_off) as u32,
                };
            }

            if !self.imports.is_empty() {
                align_vec(&mut rdata, PTR);
                let desc_off = rdata.len();
                let desc_size = size_of::<ImageImportDescriptor>() * (self.imports.len() + 1);
                rdata.resize(desc_off + desc_size, 0);

                for (index, (dll, specs)) in self.imports.iter().enumerate() {
                    align_vec(&mut rdata, PTR);
                    let lookup_off = rdata.len();
                    rdata.resize(lookup_off + PTR * (specs.len() + 1), 0);
                    let iat_off = rdata.len();
                    rdata.resize(iat_off + PTR * (specs.len() + 1), 0);

                    let mut slots = Vec::new();
                    for (slot, spec) in specs.iter().enumerate() {
                        let thunk = match spec {
                            ImportSpec::Ordinal(ordinal) => IMAGE_ORDINAL_FLAG | *ordinal as usize,
                            ImportSpec::Name(name) => {
                                align_vec(&mut rdata, 2);
                                let hint_off = rdata.len();
                                rdata.extend_from_slice(&0u16.to_le_bytes());
                                push_cstr(&mut rdata, name);
                                rdata_rva as usize + hint_off
                            }
                        };
                        put(&mut rdata, lookup_off + PTR * slot, thunk);
                        put(&mut rdata, iat_off + PTR * slot, thunk);
                        slots.push(rdata_rva + (iat_off + PTR * slot) as u32);
                    }
                    iat.push(slots);

                    let name_rva = rdata_rva + push_cstr(&mut rdata, dll) as u32;
                    let descriptor = ImageImportDescriptor {
                        original_first_thunk: if self.lookup_tables {
                            rdata_rva + lookup_off as u32
                        } else {
                            0
                        },
                        name: name_rva,
                        first_thunk: rdata_rva + iat_off as u32,
                        ..Default::default()
                    };
                    put(
                        &mut rdata,
                        desc_off + index * size_of::<ImageImportDescriptor>(),
                        descriptor,
                    );
                }
                directories[directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT] = ImageDataDirectory {
                    virtual_address: rdata_rva + desc_off as u32,
                    size: desc_size as u32,
                };
            }

            if !self.tls_callbacks.is_empty() {
                align_vec(&mut rdata, PTR);
                let callbacks_off = rdata.len();
                rdata.resize(callbacks_off + PTR * (self.tls_callbacks.len() + 1), 0);
                for (slot, (section, offset)) in self.tls_callbacks.iter().enumerate() {
                    let value = va(&section_rvas, *section, *offset) as usize;
                    put(&mut rdata, callbacks_off + PTR * slot, value);
                    relocations.push((rdata_index, (callbacks_off + PTR * slot) as u32, NATIVE_RELOC));
                }

                let dir_off = rdata.len();
                let mut tls = ImageTlsDirectory::default();
                tls.address_of_callbacks = (self.image_base + rdata_rva as u64 + callbacks_off as u64) as _;
                put(&mut rdata, dir_off, tls);
                let field = dir_off + core::mem::offset_of!(ImageTlsDirectory, address_of_callbacks);
                relocations.push((rdata_index, field as u32, NATIVE_RELOC));
                directories[directory_entry::IMAGE_DIRECTORY_ENTRY_TLS] = ImageDataDirectory {
                    virtual_address: rdata_rva + dir_off as u32,
                    size: size_of::<ImageTlsDirectory>() as u32,
                };
            }

            if self.exception_entries > 0 {
                align_vec(&mut rdata, 4);
                let table_off = rdata.len();
                let begin = section_rvas.first().copied().unwrap_or(0);
                for index in 0..self.exception_entries as u32 {
                    let entry = ImageRuntimeFunctionEntry {
                        begin_address: begin + index,
                        end_address: begin + index + 1,
                        unwind_info_address: 0,
                    };
                    put_append(&mut rdata, entry);
                }
                directories[directory_entry::IMAGE_DIRECTORY_ENTRY_EXCEPTION] = ImageDataDirectory {
                    virtual_address: rdata_rva + table_off as u32,
                    size: (rdata.len() - table_off) as u32,
                };
            }

            let virtual_size = rdata.len();
            sections.push(SectionSpec {
                name: ".rdata".to_string(),
                characteristics: Self::RDATA,
                data: rdata,
                virtual_size,
            });
            section_rvas.push(rdata_rva);
            next_rva = align_value_up(next_rva + virtual_size, PAGE_SIZE);
        }

        if !relocations.is_empty() && !self.strip_relocations {
            let reloc_rva = next_rva as u32;
            let mut by_page: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
            for (section, offset, kind) in &relocations {
                let rva = section_rvas[*section] + offset;
                by_page
                    .entry(rva & !0xFFF)
                    .or_default()
                    .push((kind << 12) | (rva & 0xFFF) as u16);
            }
            let mut reloc = Vec::new();
            for (page, mut entries) in by_page {
                if entries.len() % 2 == 1 {
                    entries.push(relocation_type::IMAGE_REL_BASED_ABSOLUTE << 12);
                }
                let block = ImageBaseRelocation {
                    virtual_address: page,
                    size_of_block: (IMAGE_SIZEOF_BASE_RELOCATION + 2 * entries.len()) as u32,
                };
                put_append(&mut reloc, block);
                for entry in entries {
                    reloc.extend_from_slice(&entry.to_le_bytes());
                }
            }
            directories[directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC] = ImageDataDirectory {
                virtual_address: reloc_rva,
                size: reloc.len() as u32,
            };
            let virtual_size = reloc.len();
            sections.push(SectionSpec {
                name: ".reloc".to_string(),
                characteristics: Self::RDATA | Self::DISCARDABLE,
                data: reloc,
                virtual_size,
            });
            section_rvas.push(reloc_rva);
        }

        // File layout: headers, then each section's raw data.
        let mut bytes = vec![0u8; SIZE_OF_HEADERS];
        let mut headers = Vec::new();
        let mut last_end = 0usize;
        for (section, &rva) in sections.iter().zip(&section_rvas) {
            let raw_size = align_value_up(section.data.len(), FILE_ALIGNMENT);
            let raw_pointer = if raw_size == 0 { 0 } else { bytes.len() };
            if raw_size > 0 {
                bytes.extend_from_slice(&section.data);
                bytes.resize(raw_pointer + raw_size, 0);
            }

            let mut header = ImageSectionHeader::default();
            let name = section.name.as_bytes();
            header.name[..name.len().min(IMAGE_SIZEOF_SHORT_NAME)]
                .copy_from_slice(&name[..name.len().min(IMAGE_SIZEOF_SHORT_NAME)]);
            header.virtual_size = section.virtual_size as u32;
            header.virtual_address = rva;
            header.size_of_raw_data = raw_size as u32;
            header.pointer_to_raw_data = raw_pointer as u32;
            header.characteristics = section.characteristics;
            headers.push(header);

            let extent = if raw_size == 0 { self.section_alignment as usize } else { raw_size };
            last_end = last_end.max(rva as usize + extent);
        }

        let dos = ImageDosHeader {
            e_magic: IMAGE_DOS_SIGNATURE,
            e_lfanew: NT_OFFSET as i32,
            ..Default::default()
        };
        put(&mut bytes, 0, dos);
        put(&mut bytes, NT_OFFSET, IMAGE_NT_SIGNATURE);

        let mut characteristics = file_characteristics::IMAGE_FILE_EXECUTABLE_IMAGE
            | file_characteristics::IMAGE_FILE_LARGE_ADDRESS_AWARE;
        if self.dll {
            characteristics |= file_characteristics::IMAGE_FILE_DLL;
        }
        if self.strip_relocations {
            characteristics |= file_characteristics::IMAGE_FILE_RELOCS_STRIPPED;
        }
        let file_header = ImageFileHeader {
            machine: HOST_MACHINE,
            number_of_sections: headers.len() as u16,
            size_of_optional_header: size_of::<ImageOptionalHeader>() as u16,
            characteristics,
            ..Default::default()
        };
        put(&mut bytes, NT_OFFSET + 4, file_header);

        let mut optional = ImageOptionalHeader::default();
        optional.magic = HOST_OPTIONAL_MAGIC;
        optional.address_of_entry_point =
            self.entry.map_or(0, |(section, offset)| section_rvas[section] + offset);
        optional.image_base = self.image_base as _;
        optional.section_alignment = self.section_alignment;
        optional.file_alignment = FILE_ALIGNMENT as u32;
        optional.size_of_image = align_value_up(last_end.max(PAGE_SIZE), PAGE_SIZE) as u32;
        optional.size_of_headers = SIZE_OF_HEADERS as u32;
        optional.size_of_initialized_data = self.initialized_data;
        optional.size_of_uninitialized_data = self.uninitialized_data;
        optional.number_of_rva_and_sizes = IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32;
        optional.data_directory = directories;
        put(&mut bytes, NT_OFFSET + 4 + size_of::<ImageFileHeader>(), optional);

        let table = NT_OFFSET + HOST_NT_HEADERS_SIZE;
        for (index, header) in headers.iter().enumerate() {
            put(&mut bytes, table + index * size_of::<ImageSectionHeader>(), *header);
        }

        BuiltImage {
            bytes,
            image_base: self.image_base,
            section_rvas,
            iat,
        }
    }
}

/// Write `value` at `offset`, growing the buffer if needed
pub(crate) fn put<T: Pod>(buffer: &mut Vec<u8>, offset: usize, value: T) {
    let end = offset + size_of::<T>();
    if buffer.len() < end {
        buffer.resize(end, 0);
    }
    // SAFETY: the range was just checked to be inside the buffer.
    unsafe { ptr::write_unaligned(buffer[offset..].as_mut_ptr() as *mut T, value) };
}

fn put_append<T: Pod>(buffer: &mut Vec<u8>, value: T) {
    let offset = buffer.len();
    put(buffer, offset, value);
}

fn push_cstr(buffer: &mut Vec<u8>, text: &str) -> usize {
    let offset = buffer.len();
    buffer.extend_from_slice(text.as_bytes());
    buffer.push(0);
    offset
}

fn align_vec(buffer: &mut Vec<u8>, alignment: usize) {
    let len = align_value_up(buffer.len(), alignment);
    buffer.resize(len, 0);
}
