//! Proxy functions for every tracked symbol.
//!
//! A proxy is what an installed hook points at. While the service is active
//! it routes the call through the memory or descriptor tracker; otherwise it
//! is a plain call-through to the next definition. Either way the real
//! function runs exactly once.
//!
//! `open` is variadic in C. The proxies take the optional `mode` as a named
//! third argument, which is ABI-compatible on the supported Linux targets,
//! and only forward it when the flags say it is present.

use std::ffi::CStr;

use libc::{c_char, c_int, c_uint, c_void, mode_t, size_t, FILE};

use crate::{
    fd::FdTracker,
    guard::EntryMark,
    hook::{HookSymbol, Target},
    real::{self, NextFns},
    service,
    tracker::MemoryTracker,
};

#[inline]
fn memory() -> Option<&'static MemoryTracker> {
    service::active().map(|s| s.memory())
}

#[inline]
fn fds() -> Option<&'static FdTracker> {
    service::active().map(|s| s.fds())
}

unsafe fn cstr<'a>(p: *const c_char) -> Option<&'a CStr> {
    (!p.is_null()).then(|| CStr::from_ptr(p))
}

fn fail_errno<T>(value: T) -> T {
    // SAFETY: `__errno_location` always returns the calling thread's errno.
    unsafe { *libc::__errno_location() = libc::ENOSYS };
    value
}

fn mode_present(flags: c_int) -> bool {
    flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE
}

// Call-throughs to the next definitions.

pub(crate) unsafe fn next_new(size: size_t) -> *mut c_void {
    match real::next().and_then(|n| n.new) {
        Some(new) => new(size),
        None => real::malloc(size),
    }
}

pub(crate) unsafe fn next_new_array(size: size_t) -> *mut c_void {
    match real::next().and_then(|n| n.new_array) {
        Some(new) => new(size),
        None => real::malloc(size),
    }
}

pub(crate) unsafe fn next_delete(ptr: *mut c_void) {
    match real::next().and_then(|n| n.delete) {
        Some(delete) => delete(ptr),
        None => real::free(ptr),
    }
}

pub(crate) unsafe fn next_delete_array(ptr: *mut c_void) {
    match real::next().and_then(|n| n.delete_array) {
        Some(delete) => delete(ptr),
        None => real::free(ptr),
    }
}

pub(crate) unsafe fn next_sized_delete(ptr: *mut c_void, size: size_t) {
    match real::next().and_then(|n| n.sized_delete) {
        Some(delete) => delete(ptr, size),
        None => next_delete(ptr),
    }
}

pub(crate) unsafe fn next_sized_delete_array(ptr: *mut c_void, size: size_t) {
    match real::next().and_then(|n| n.sized_delete_array) {
        Some(delete) => delete(ptr, size),
        None => next_delete_array(ptr),
    }
}

unsafe fn call_open(
    pick: fn(&NextFns) -> real::OpenFn,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    let Some(next) = real::next() else {
        return fail_errno(-1);
    };
    let open = pick(next);
    if mode_present(flags) {
        open(path, flags, mode as c_uint)
    } else {
        open(path, flags)
    }
}

pub(crate) unsafe fn next_open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    call_open(|n| n.open, path, flags, mode)
}

pub(crate) unsafe fn next_open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    call_open(|n| n.open64, path, flags, mode)
}

pub(crate) unsafe fn next_open2(path: *const c_char, flags: c_int) -> c_int {
    match real::next() {
        Some(next) => match next.open2 {
            Some(open2) => open2(path, flags),
            None => (next.open)(path, flags),
        },
        None => fail_errno(-1),
    }
}

pub(crate) unsafe fn next_close(fd: c_int) -> c_int {
    match real::next() {
        Some(next) => (next.close)(fd),
        None => fail_errno(-1),
    }
}

pub(crate) unsafe fn next_fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    match real::next() {
        Some(next) => (next.fopen)(path, mode),
        None => fail_errno(std::ptr::null_mut()),
    }
}

pub(crate) unsafe fn next_fclose(stream: *mut FILE) -> c_int {
    match real::next() {
        Some(next) => (next.fclose)(stream),
        None => fail_errno(libc::EOF),
    }
}

// Memory proxies.

/// # Safety
///
/// Same contract as `malloc(3)`.
#[inline(never)]
pub unsafe extern "C" fn malloc_proxy(size: size_t) -> *mut c_void {
    let anchor = 0u8;
    let _mark = EntryMark::enter(&anchor);
    match memory() {
        Some(t) => t.track_alloc(size, || real::malloc(size)),
        None => real::malloc(size),
    }
}

/// # Safety
///
/// Same contract as `calloc(3)`.
#[inline(never)]
pub unsafe extern "C" fn calloc_proxy(nmemb: size_t, size: size_t) -> *mut c_void {
    let anchor = 0u8;
    let _mark = EntryMark::enter(&anchor);
    match memory() {
        Some(t) => t.track_alloc(nmemb.saturating_mul(size), || real::calloc(nmemb, size)),
        None => real::calloc(nmemb, size),
    }
}

/// # Safety
///
/// Same contract as `realloc(3)`.
#[inline(never)]
pub unsafe extern "C" fn realloc_proxy(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let anchor = 0u8;
    let _mark = EntryMark::enter(&anchor);
    match memory() {
        Some(t) => t.track_realloc(ptr, size, || real::realloc(ptr, size)),
        None => real::realloc(ptr, size),
    }
}

/// # Safety
///
/// Same contract as `free(3)`.
pub unsafe extern "C" fn free_proxy(ptr: *mut c_void) {
    match memory() {
        Some(t) => t.track_free(ptr, || real::free(ptr)),
        None => real::free(ptr),
    }
}

/// `operator new(size_t)`. May unwind with `std::bad_alloc`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[inline(never)]
pub unsafe extern "C-unwind" fn new_proxy(size: size_t) -> *mut c_void {
    let anchor = 0u8;
    let _mark = EntryMark::enter(&anchor);
    match memory() {
        Some(t) => t.track_alloc(size, || next_new(size)),
        None => next_new(size),
    }
}

/// `operator new[](size_t)`.
///
/// # Safety
///
/// Same contract as the C++ operator.
#[inline(never)]
pub unsafe extern "C-unwind" fn new_array_proxy(size: size_t) -> *mut c_void {
    let anchor = 0u8;
    let _mark = EntryMark::enter(&anchor);
    match memory() {
        Some(t) => t.track_alloc(size, || next_new_array(size)),
        None => next_new_array(size),
    }
}

/// # Safety
///
/// `ptr` must come from `operator new`.
pub unsafe extern "C" fn delete_proxy(ptr: *mut c_void) {
    match memory() {
        Some(t) => t.track_free(ptr, || next_delete(ptr)),
        None => next_delete(ptr),
    }
}

/// # Safety
///
/// `ptr` must come from `operator new[]`.
pub unsafe extern "C" fn delete_array_proxy(ptr: *mut c_void) {
    match memory() {
        Some(t) => t.track_free(ptr, || next_delete_array(ptr)),
        None => next_delete_array(ptr),
    }
}

/// # Safety
///
/// `ptr` must come from `operator new` with `size` bytes.
pub unsafe extern "C" fn sized_delete_proxy(ptr: *mut c_void, size: size_t) {
    match memory() {
        Some(t) => t.track_free(ptr, || next_sized_delete(ptr, size)),
        None => next_sized_delete(ptr, size),
    }
}

/// # Safety
///
/// `ptr` must come from `operator new[]` with `size` bytes.
pub unsafe extern "C" fn sized_delete_array_proxy(ptr: *mut c_void, size: size_t) {
    match memory() {
        Some(t) => t.track_free(ptr, || next_sized_delete_array(ptr, size)),
        None => next_sized_delete_array(ptr, size),
    }
}

// Descriptor proxies.

/// # Safety
///
/// Same contract as `open(2)`; `mode` is only read when `flags` asks for it.
pub unsafe extern "C" fn open_proxy(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    match fds() {
        Some(t) => t.track_open(cstr(path), flags, || next_open(path, flags, mode)),
        None => next_open(path, flags, mode),
    }
}

/// # Safety
///
/// Same contract as `open64(2)`.
pub unsafe extern "C" fn open64_proxy(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    match fds() {
        Some(t) => t.track_open(cstr(path), flags, || next_open64(path, flags, mode)),
        None => next_open64(path, flags, mode),
    }
}

/// Fortified `open` used by `_FORTIFY_SOURCE` builds.
///
/// # Safety
///
/// Same contract as `open(2)` without `O_CREAT`.
pub unsafe extern "C" fn open2_proxy(path: *const c_char, flags: c_int) -> c_int {
    match fds() {
        Some(t) => t.track_open(cstr(path), flags, || next_open2(path, flags)),
        None => next_open2(path, flags),
    }
}

/// # Safety
///
/// Same contract as `close(2)`.
pub unsafe extern "C" fn close_proxy(fd: c_int) -> c_int {
    match fds() {
        Some(t) => t.track_close(fd, || next_close(fd)),
        None => next_close(fd),
    }
}

/// # Safety
///
/// Same contract as `fopen(3)`.
pub unsafe extern "C" fn fopen_proxy(path: *const c_char, mode: *const c_char) -> *mut FILE {
    match fds() {
        Some(t) => t.track_fopen(cstr(path), cstr(mode), || next_fopen(path, mode)),
        None => next_fopen(path, mode),
    }
}

/// # Safety
///
/// Same contract as `fclose(3)`.
pub unsafe extern "C" fn fclose_proxy(stream: *mut FILE) -> c_int {
    match fds() {
        Some(t) => t.track_fclose(stream, || next_fclose(stream)),
        None => next_fclose(stream),
    }
}

/// Address of the proxy for `target`.
pub fn proxy_address(target: Target) -> usize {
    match target {
        Target::Malloc => malloc_proxy as *const () as usize,
        Target::Calloc => calloc_proxy as *const () as usize,
        Target::Realloc => realloc_proxy as *const () as usize,
        Target::Free => free_proxy as *const () as usize,
        Target::New => new_proxy as *const () as usize,
        Target::NewArray => new_array_proxy as *const () as usize,
        Target::Delete => delete_proxy as *const () as usize,
        Target::DeleteArray => delete_array_proxy as *const () as usize,
        Target::SizedDelete => sized_delete_proxy as *const () as usize,
        Target::SizedDeleteArray => sized_delete_array_proxy as *const () as usize,
        Target::Open => open_proxy as *const () as usize,
        Target::Open64 => open64_proxy as *const () as usize,
        Target::Open2 => open2_proxy as *const () as usize,
        Target::Close => close_proxy as *const () as usize,
        Target::Fopen => fopen_proxy as *const () as usize,
        Target::Fclose => fclose_proxy as *const () as usize,
    }
}

/// Hook table pairing each of `targets` with its proxy.
pub fn hook_symbols(targets: &[Target]) -> Vec<HookSymbol> {
    targets
        .iter()
        .map(|target| HookSymbol {
            target: *target,
            proxy: proxy_address(*target),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{FD_TARGETS, MEMORY_TARGETS};
    use std::collections::HashSet;

    #[test]
    fn every_target_has_a_distinct_proxy() {
        let addrs: HashSet<usize> = MEMORY_TARGETS
            .iter()
            .chain(FD_TARGETS.iter())
            .map(|t| proxy_address(*t))
            .collect();
        assert_eq!(addrs.len(), Target::COUNT);
        assert_eq!(hook_symbols(&MEMORY_TARGETS).len(), 10);
    }

    #[test]
    fn proxy_address_is_the_code_address() {
        let free: unsafe extern "C" fn(*mut c_void) = free_proxy;
        let open: unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int = open_proxy;
        assert_eq!(proxy_address(Target::Free), free as usize);
        assert_eq!(proxy_address(Target::Open), open as usize);
        assert!(hook_symbols(&FD_TARGETS)
            .iter()
            .all(|s| s.proxy == proxy_address(s.target)));
    }

    #[test]
    fn mode_only_with_creat_or_tmpfile() {
        assert!(mode_present(libc::O_CREAT | libc::O_WRONLY));
        assert!(mode_present(libc::O_TMPFILE | libc::O_RDWR));
        assert!(!mode_present(libc::O_DIRECTORY));
        assert!(!mode_present(libc::O_RDONLY));
    }

    #[test]
    fn call_throughs_work_without_a_service() {
        unsafe {
            let p = next_new(24);
            assert!(!p.is_null());
            next_sized_delete(p, 24);

            let path = std::ffi::CString::new("/dev/null").unwrap();
            let fd = next_open(path.as_ptr(), libc::O_RDONLY, 0);
            assert!(fd >= 0);
            assert_eq!(next_close(fd), 0);
        }
    }
}
