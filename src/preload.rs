//! Hook engine for the `LD_PRELOAD` build.
//!
//! When the preload library is loaded first, the dynamic linker already binds
//! every tracked symbol in every library to its exports. Installing a hook
//! therefore only has to arm the corresponding entry: an armed entry routes
//! through the proxy, a disarmed one calls straight through.
//!
//! Arming is process-wide, so the only library pattern this engine accepts
//! is [`ALL_LIBRARIES`]. Any other name is refused with
//! [`Error::InvalidArgument`] instead of silently tracking every caller.
//! Arms are counted; a symbol stays armed until every stub for it is gone.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use libc::{c_char, c_int, c_void, mode_t, size_t, FILE};
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    hook::{HookEngine, HookSymbol, StubHandle, Target, ALL_LIBRARIES},
    proxy,
};

/// Per-symbol arm counts.
pub struct ArmTable {
    counts: [AtomicUsize; Target::COUNT],
}

impl ArmTable {
    pub const fn new() -> Self {
        ArmTable {
            counts: [const { AtomicUsize::new(0) }; Target::COUNT],
        }
    }

    pub fn arm(&self, target: Target) {
        self.counts[target.index()].fetch_add(1, Ordering::AcqRel);
    }

    pub fn disarm(&self, target: Target) {
        let _ = self.counts[target.index()].fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_sub(1)
        });
    }

    #[inline]
    pub fn is_armed(&self, target: Target) -> bool {
        self.counts[target.index()].load(Ordering::Acquire) > 0
    }
}

impl Default for ArmTable {
    fn default() -> Self {
        ArmTable::new()
    }
}

/// Table consulted by the exported entry points.
pub static ARMED: ArmTable = ArmTable::new();

pub struct PreloadEngine {
    table: &'static ArmTable,
    next_id: AtomicU64,
    stubs: Mutex<HashMap<StubHandle, Target>>,
}

impl PreloadEngine {
    pub fn new() -> Self {
        PreloadEngine::with_table(&ARMED)
    }

    pub fn with_table(table: &'static ArmTable) -> Self {
        PreloadEngine {
            table,
            next_id: AtomicU64::new(1),
            stubs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for PreloadEngine {
    fn default() -> Self {
        PreloadEngine::new()
    }
}

impl HookEngine for PreloadEngine {
    fn check_library(&self, library: &str) -> Result<()> {
        if library == ALL_LIBRARIES {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{}: preloaded symbols are hooked process-wide, use \"{}\"",
                library, ALL_LIBRARIES
            )))
        }
    }

    fn install(&self, library: &str, symbol: &HookSymbol) -> Result<StubHandle> {
        self.check_library(library)?;
        if symbol.proxy != proxy::proxy_address(symbol.target) {
            return Err(Error::Install {
                library: library.to_string(),
                symbol: symbol.target.symbol(),
                reason: "proxy does not match the exported entry point".into(),
            });
        }
        let handle = StubHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.stubs.lock().insert(handle, symbol.target);
        self.table.arm(symbol.target);
        Ok(handle)
    }

    fn uninstall(&self, stub: StubHandle) -> Result<()> {
        match self.stubs.lock().remove(&stub) {
            Some(target) => {
                self.table.disarm(target);
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!("unknown stub {}", stub.id()))),
        }
    }
}

// Entry points called from the exported symbols.

/// # Safety
///
/// Same contract as `malloc(3)`.
#[inline]
pub unsafe fn malloc_entry(size: size_t) -> *mut c_void {
    if ARMED.is_armed(Target::Malloc) {
        proxy::malloc_proxy(size)
    } else {
        crate::real::malloc(size)
    }
}

/// # Safety
///
/// Same contract as `calloc(3)`.
#[inline]
pub unsafe fn calloc_entry(nmemb: size_t, size: size_t) -> *mut c_void {
    if ARMED.is_armed(Target::Calloc) {
        proxy::calloc_proxy(nmemb, size)
    } else {
        crate::real::calloc(nmemb, size)
    }
}

/// # Safety
///
/// Same contract as `realloc(3)`.
#[inline]
pub unsafe fn realloc_entry(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if ARMED.is_armed(Target::Realloc) {
        proxy::realloc_proxy(ptr, size)
    } else {
        crate::real::realloc(ptr, size)
    }
}

/// # Safety
///
/// Same contract as `free(3)`.
#[inline]
pub unsafe fn free_entry(ptr: *mut c_void) {
    if ARMED.is_armed(Target::Free) {
        proxy::free_proxy(ptr)
    } else {
        crate::real::free(ptr)
    }
}

/// # Safety
///
/// Same contract as `operator new`.
#[inline]
pub unsafe fn new_entry(size: size_t) -> *mut c_void {
    if ARMED.is_armed(Target::New) {
        proxy::new_proxy(size)
    } else {
        proxy::next_new(size)
    }
}

/// # Safety
///
/// Same contract as `operator new[]`.
#[inline]
pub unsafe fn new_array_entry(size: size_t) -> *mut c_void {
    if ARMED.is_armed(Target::NewArray) {
        proxy::new_array_proxy(size)
    } else {
        proxy::next_new_array(size)
    }
}

/// # Safety
///
/// Same contract as `operator delete`.
#[inline]
pub unsafe fn delete_entry(ptr: *mut c_void) {
    if ARMED.is_armed(Target::Delete) {
        proxy::delete_proxy(ptr)
    } else {
        proxy::next_delete(ptr)
    }
}

/// # Safety
///
/// Same contract as `operator delete[]`.
#[inline]
pub unsafe fn delete_array_entry(ptr: *mut c_void) {
    if ARMED.is_armed(Target::DeleteArray) {
        proxy::delete_array_proxy(ptr)
    } else {
        proxy::next_delete_array(ptr)
    }
}

/// # Safety
///
/// Same contract as sized `operator delete`.
#[inline]
pub unsafe fn sized_delete_entry(ptr: *mut c_void, size: size_t) {
    if ARMED.is_armed(Target::SizedDelete) {
        proxy::sized_delete_proxy(ptr, size)
    } else {
        proxy::next_sized_delete(ptr, size)
    }
}

/// # Safety
///
/// Same contract as sized `operator delete[]`.
#[inline]
pub unsafe fn sized_delete_array_entry(ptr: *mut c_void, size: size_t) {
    if ARMED.is_armed(Target::SizedDeleteArray) {
        proxy::sized_delete_array_proxy(ptr, size)
    } else {
        proxy::next_sized_delete_array(ptr, size)
    }
}

/// # Safety
///
/// Same contract as `open(2)`.
#[inline]
pub unsafe fn open_entry(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    if ARMED.is_armed(Target::Open) {
        proxy::open_proxy(path, flags, mode)
    } else {
        proxy::next_open(path, flags, mode)
    }
}

/// # Safety
///
/// Same contract as `open64(2)`.
#[inline]
pub unsafe fn open64_entry(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    if ARMED.is_armed(Target::Open64) {
        proxy::open64_proxy(path, flags, mode)
    } else {
        proxy::next_open64(path, flags, mode)
    }
}

/// # Safety
///
/// Same contract as `__open_2`.
#[inline]
pub unsafe fn open2_entry(path: *const c_char, flags: c_int) -> c_int {
    if ARMED.is_armed(Target::Open2) {
        proxy::open2_proxy(path, flags)
    } else {
        proxy::next_open2(path, flags)
    }
}

/// # Safety
///
/// Same contract as `close(2)`.
#[inline]
pub unsafe fn close_entry(fd: c_int) -> c_int {
    if ARMED.is_armed(Target::Close) {
        proxy::close_proxy(fd)
    } else {
        proxy::next_close(fd)
    }
}

/// # Safety
///
/// Same contract as `fopen(3)`.
#[inline]
pub unsafe fn fopen_entry(path: *const c_char, mode: *const c_char) -> *mut FILE {
    if ARMED.is_armed(Target::Fopen) {
        proxy::fopen_proxy(path, mode)
    } else {
        proxy::next_fopen(path, mode)
    }
}

/// # Safety
///
/// Same contract as `fclose(3)`.
#[inline]
pub unsafe fn fclose_entry(stream: *mut FILE) -> c_int {
    if ARMED.is_armed(Target::Fclose) {
        proxy::fclose_proxy(stream)
    } else {
        proxy::next_fclose(stream)
    }
}
