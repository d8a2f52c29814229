//! Companion crate to [`leakhook`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept allocation and file-descriptor calls issued by the
//! program and redirect them to the `leakhook` trackers.
//!
//! On load, tracking starts with the configuration read from the environment and hooks every
//! library.  Preloaded symbols are preempted process-wide, so the only accepted library pattern
//! is `*`; `LEAKHOOK_TARGETS` naming anything else makes startup fail.  Set `LEAKHOOK_LOG` to a
//! `tracing` filter directive (e.g. `leakhook=debug`) to see what the tracker does.  If
//! `LEAKHOOK_REPORT` names a file, the leak report is written there when the program exits and
//! the descriptor report next to it with a `.fd` suffix.
//!
//! The `leakhook_*` functions let the program drive the tracker itself.  Functions returning
//! `c_int` return zero or a count on success and a negative error code on failure.  Strings are
//! allocated by the library and must be released with [`leakhook_free_string`].

use std::{
    ffi::{CStr, CString},
    path::{Path, PathBuf},
    ptr, slice,
};

use ctor::{ctor, dtor};
use leakhook::{guard::ReentryGuard, preload, service, Config, Error, JsonFormat, ALL_LIBRARIES};
use libc::{c_char, c_int, c_void, mode_t, size_t, FILE};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static REPORT_PATH: OnceCell<PathBuf> = OnceCell::new();

// Interposed symbols.

/// # Safety
///
/// Same contract as `malloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    preload::malloc_entry(size)
}

/// # Safety
///
/// Same contract as `calloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    preload::calloc_entry(nmemb, size)
}

/// # Safety
///
/// Same contract as `realloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    preload::realloc_entry(ptr, size)
}

/// # Safety
///
/// Same contract as `free(3)`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    preload::free_entry(ptr)
}

/// `operator new(size_t)`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[cfg_attr(target_pointer_width = "64", export_name = "_Znwm")]
#[cfg_attr(target_pointer_width = "32", export_name = "_Znwj")]
pub unsafe extern "C-unwind" fn operator_new(size: size_t) -> *mut c_void {
    preload::new_entry(size)
}

/// `operator new[](size_t)`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[cfg_attr(target_pointer_width = "64", export_name = "_Znam")]
#[cfg_attr(target_pointer_width = "32", export_name = "_Znaj")]
pub unsafe extern "C-unwind" fn operator_new_array(size: size_t) -> *mut c_void {
    preload::new_array_entry(size)
}

/// `operator delete(void*)`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[export_name = "_ZdlPv"]
pub unsafe extern "C" fn operator_delete(ptr: *mut c_void) {
    preload::delete_entry(ptr)
}

/// `operator delete[](void*)`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[export_name = "_ZdaPv"]
pub unsafe extern "C" fn operator_delete_array(ptr: *mut c_void) {
    preload::delete_array_entry(ptr)
}

/// `operator delete(void*, size_t)`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[cfg_attr(target_pointer_width = "64", export_name = "_ZdlPvm")]
#[cfg_attr(target_pointer_width = "32", export_name = "_ZdlPvj")]
pub unsafe extern "C" fn operator_sized_delete(ptr: *mut c_void, size: size_t) {
    preload::sized_delete_entry(ptr, size)
}

/// `operator delete[](void*, size_t)`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[cfg_attr(target_pointer_width = "64", export_name = "_ZdaPvm")]
#[cfg_attr(target_pointer_width = "32", export_name = "_ZdaPvj")]
pub unsafe extern "C" fn operator_sized_delete_array(ptr: *mut c_void, size: size_t) {
    preload::sized_delete_array_entry(ptr, size)
}

// `open` and `open64` are variadic in C; the optional mode is taken as a
// named argument and only read when the flags call for it.

/// # Safety
///
/// Same contract as `open(2)`.
#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    preload::open_entry(path, flags, mode)
}

/// # Safety
///
/// Same contract as `open64(2)`.
#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    preload::open64_entry(path, flags, mode)
}

/// # Safety
///
/// Same contract as glibc's `__open_2`.
#[no_mangle]
pub unsafe extern "C" fn __open_2(path: *const c_char, flags: c_int) -> c_int {
    preload::open2_entry(path, flags)
}

/// # Safety
///
/// Same contract as `close(2)`.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    preload::close_entry(fd)
}

/// # Safety
///
/// Same contract as `fopen(3)`.
#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    preload::fopen_entry(path, mode)
}

/// # Safety
///
/// Same contract as `fclose(3)`.
#[no_mangle]
pub unsafe extern "C" fn fclose(stream: *mut FILE) -> c_int {
    preload::fclose_entry(stream)
}

// Control surface.

/// Memory statistics as returned by [`leakhook_get_stats`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LeakhookStats {
    pub total_alloc_count: u64,
    pub total_alloc_size: u64,
    pub total_free_count: u64,
    pub total_free_size: u64,
    pub current_alloc_count: u64,
    pub current_alloc_size: u64,
}

/// Descriptor statistics as returned by [`leakhook_fd_get_stats`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LeakhookFdStats {
    pub total_open_count: u64,
    pub total_close_count: u64,
    pub current_open_count: u64,
}

fn status(res: leakhook::Result<()>) -> c_int {
    match res {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!("leakhook call failed: {}", e);
            e.error_code()
        }
    }
}

fn count(res: leakhook::Result<usize>) -> c_int {
    match res {
        Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
        Err(e) => {
            tracing::debug!("leakhook call failed: {}", e);
            e.error_code()
        }
    }
}

// Hand a string to the caller; null on failure.
fn into_c_string(res: leakhook::Result<String>) -> *mut c_char {
    let _reentry = ReentryGuard::enter();
    match res.map(CString::new) {
        Ok(Ok(s)) => s.into_raw(),
        Ok(Err(_)) => {
            tracing::error!("report contains an interior NUL byte");
            ptr::null_mut()
        }
        Err(e) => {
            tracing::debug!("leakhook call failed: {}", e);
            ptr::null_mut()
        }
    }
}

unsafe fn library_names(libs: *const *const c_char, n: size_t) -> leakhook::Result<Vec<String>> {
    if libs.is_null() || n == 0 {
        return Err(Error::InvalidArgument("no libraries given".into()));
    }
    slice::from_raw_parts(libs, n)
        .iter()
        .map(|lib| {
            if lib.is_null() {
                Err(Error::InvalidArgument("null library name".into()))
            } else {
                Ok(CStr::from_ptr(*lib).to_string_lossy().into_owned())
            }
        })
        .collect()
}

unsafe fn report_path<'a>(path: *const c_char) -> leakhook::Result<&'a Path> {
    if path.is_null() {
        return Err(Error::InvalidArgument("null report path".into()));
    }
    CStr::from_ptr(path)
        .to_str()
        .map(Path::new)
        .map_err(|_| Error::InvalidArgument("report path is not UTF-8".into()))
}

/// Start tracking. Options not given here are read from the environment.
#[no_mangle]
pub extern "C" fn leakhook_init(debug: c_int, backtrace: c_int) -> c_int {
    let _reentry = ReentryGuard::enter();
    status(Config::from_env().and_then(|mut config| {
        config.debug = debug != 0;
        config.backtrace = backtrace != 0;
        service::init(&config).map(|_| ())
    }))
}

/// Unhook everything and stop tracking.
#[no_mangle]
pub extern "C" fn leakhook_teardown() {
    service::teardown();
}

/// Only the `*` pattern can be hooked; any other name fails with -2.
///
/// # Safety
///
/// `libs` must point to `n` NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn leakhook_hook(libs: *const *const c_char, n: size_t) -> c_int {
    let _reentry = ReentryGuard::enter();
    count(library_names(libs, n).and_then(|libs| service::hook(&libs)))
}

/// # Safety
///
/// `libs` must point to `n` NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn leakhook_unhook(libs: *const *const c_char, n: size_t) -> c_int {
    let _reentry = ReentryGuard::enter();
    count(library_names(libs, n).and_then(|libs| service::unhook(&libs)))
}

#[no_mangle]
pub extern "C" fn leakhook_unhook_all() -> c_int {
    count(service::unhook_all())
}

#[no_mangle]
pub extern "C" fn leakhook_get_leak_report() -> *mut c_char {
    into_c_string(service::text_report())
}

/// # Safety
///
/// `path` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn leakhook_dump_leak_report(path: *const c_char) -> c_int {
    status(report_path(path).and_then(service::dump_report))
}

#[no_mangle]
pub extern "C" fn leakhook_get_leaks_json() -> *mut c_char {
    into_c_string(service::json(JsonFormat::Raw))
}

#[no_mangle]
pub extern "C" fn leakhook_get_leaks_aggregated_json() -> *mut c_char {
    into_c_string(service::json(JsonFormat::Aggregated))
}

/// # Safety
///
/// `out` must point to writable memory for one [`LeakhookStats`].
#[no_mangle]
pub unsafe extern "C" fn leakhook_get_stats(out: *mut LeakhookStats) -> c_int {
    if out.is_null() {
        return Error::InvalidArgument(String::new()).error_code();
    }
    status(service::stats().map(|s| {
        out.write(LeakhookStats {
            total_alloc_count: s.total_alloc_count,
            total_alloc_size: s.total_alloc_size,
            total_free_count: s.total_free_count,
            total_free_size: s.total_free_size,
            current_alloc_count: s.current_alloc_count,
            current_alloc_size: s.current_alloc_size,
        })
    }))
}

#[no_mangle]
pub extern "C" fn leakhook_get_stats_json() -> *mut c_char {
    into_c_string(service::stats().and_then(|s| Ok(s.to_json()?)))
}

#[no_mangle]
pub extern "C" fn leakhook_reset_stats() -> c_int {
    status(service::reset_stats())
}

#[no_mangle]
pub extern "C" fn leakhook_set_backtrace_enabled(enabled: c_int) -> c_int {
    status(service::set_backtrace_enabled(enabled != 0))
}

#[no_mangle]
pub extern "C" fn leakhook_is_backtrace_enabled() -> c_int {
    service::is_backtrace_enabled() as c_int
}

/// # Safety
///
/// `libs` must point to `n` NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn leakhook_fd_hook(libs: *const *const c_char, n: size_t) -> c_int {
    let _reentry = ReentryGuard::enter();
    count(library_names(libs, n).and_then(|libs| service::fd_hook(&libs)))
}

/// # Safety
///
/// `libs` must point to `n` NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn leakhook_fd_unhook(libs: *const *const c_char, n: size_t) -> c_int {
    let _reentry = ReentryGuard::enter();
    count(library_names(libs, n).and_then(|libs| service::fd_unhook(&libs)))
}

#[no_mangle]
pub extern "C" fn leakhook_fd_unhook_all() -> c_int {
    count(service::fd_unhook_all())
}

#[no_mangle]
pub extern "C" fn leakhook_fd_get_report() -> *mut c_char {
    into_c_string(service::fd_report())
}

/// # Safety
///
/// `path` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn leakhook_fd_dump_report(path: *const c_char) -> c_int {
    status(report_path(path).and_then(service::fd_dump_report))
}

/// # Safety
///
/// `out` must point to writable memory for one [`LeakhookFdStats`].
#[no_mangle]
pub unsafe extern "C" fn leakhook_fd_get_stats(out: *mut LeakhookFdStats) -> c_int {
    if out.is_null() {
        return Error::InvalidArgument(String::new()).error_code();
    }
    status(service::fd_stats().map(|s| {
        out.write(LeakhookFdStats {
            total_open_count: s.total_open_count,
            total_close_count: s.total_close_count,
            current_open_count: s.current_open_count,
        })
    }))
}

#[no_mangle]
pub extern "C" fn leakhook_fd_reset_stats() -> c_int {
    status(service::fd_reset_stats())
}

#[no_mangle]
pub extern "C" fn leakhook_fd_get_leaks_json() -> *mut c_char {
    into_c_string(service::fd_leaks_json())
}

/// Release a string returned by this library.
///
/// # Safety
///
/// `s` must come from a `leakhook_*` function and not have been freed yet.
#[no_mangle]
pub unsafe extern "C" fn leakhook_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _reentry = ReentryGuard::enter();
        drop(CString::from_raw(s));
    }
}

fn start() -> leakhook::Result<()> {
    let config = Config::from_env()?;
    let service = service::init(&config)?;
    let targets = if config.targets.is_empty() {
        vec![ALL_LIBRARIES.to_string()]
    } else {
        config.targets.clone()
    };
    service.memory_hooks().hook(&targets)?;
    service.fd_hooks().hook(&targets)?;
    if let Some(path) = config.report_path {
        let _ = REPORT_PATH.set(path);
    }
    Ok(())
}

// Invoked when the library is loaded.
#[ctor]
fn autostart() {
    let _reentry = ReentryGuard::enter();
    if let Ok(directive) = std::env::var("LEAKHOOK_LOG") {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(directive))
            .with_writer(std::io::stderr)
            .try_init();
    }
    if let Err(e) = start() {
        tracing::error!("leakhook failed to start: {}", e);
    }
}

// Invoked when the program exits.  Dump the reports if asked to.
#[dtor]
fn dump_on_exit() {
    let _reentry = ReentryGuard::enter();
    let Some(path) = REPORT_PATH.get() else {
        return;
    };
    if let Err(e) = service::dump_report(path) {
        tracing::error!("failed to write leak report: {}", e);
    }
    let fd_path = PathBuf::from(format!("{}.fd", path.display()));
    if let Err(e) = service::fd_dump_report(&fd_path) {
        tracing::error!("failed to write fd report: {}", e);
    }
}
