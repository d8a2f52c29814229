//! Pre-interception ("next") definitions of every tracked symbol.
//!
//! The malloc family is reached through glibc's `__libc_*` entry points,
//! which can never land back in an interposed `malloc`. Everything else is
//! looked up once with `dlsym(RTLD_NEXT, ..)` and memoized; the lookup is
//! forced from `init` so that no hot path has to resolve lazily.

use libc::{c_char, c_int, c_void, dlsym, size_t, FILE, RTLD_NEXT};
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};

pub type NewFn = unsafe extern "C-unwind" fn(size: size_t) -> *mut c_void;
pub type DeleteFn = unsafe extern "C" fn(ptr: *mut c_void);
pub type SizedDeleteFn = unsafe extern "C" fn(ptr: *mut c_void, size: size_t);
pub type OpenFn = unsafe extern "C" fn(path: *const c_char, flags: c_int, ...) -> c_int;
pub type Open2Fn = unsafe extern "C" fn(path: *const c_char, flags: c_int) -> c_int;
pub type CloseFn = unsafe extern "C" fn(fd: c_int) -> c_int;
pub type FopenFn = unsafe extern "C" fn(path: *const c_char, mode: *const c_char) -> *mut FILE;
pub type FcloseFn = unsafe extern "C" fn(stream: *mut FILE) -> c_int;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod glibc {
    use libc::{c_void, size_t};

    extern "C" {
        pub fn __libc_malloc(size: size_t) -> *mut c_void;
        pub fn __libc_calloc(nmemb: size_t, size: size_t) -> *mut c_void;
        pub fn __libc_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
        pub fn __libc_free(ptr: *mut c_void);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod fallback {
    use super::*;
    use once_cell::sync::Lazy;

    pub struct AllocFns {
        pub malloc: unsafe extern "C" fn(size_t) -> *mut c_void,
        pub calloc: unsafe extern "C" fn(size_t, size_t) -> *mut c_void,
        pub realloc: unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void,
        pub free: unsafe extern "C" fn(*mut c_void),
    }

    pub static ALLOC: Lazy<AllocFns> = Lazy::new(|| unsafe {
        AllocFns {
            malloc: std::mem::transmute(lookup("malloc").unwrap_or(libc::malloc as *mut c_void)),
            calloc: std::mem::transmute(lookup("calloc").unwrap_or(libc::calloc as *mut c_void)),
            realloc: std::mem::transmute(
                lookup("realloc").unwrap_or(libc::realloc as *mut c_void),
            ),
            free: std::mem::transmute(lookup("free").unwrap_or(libc::free as *mut c_void)),
        }
    });
}

/// The real `malloc`.
///
/// # Safety
///
/// Same contract as `malloc(3)`.
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        glibc::__libc_malloc(size)
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        (fallback::ALLOC.malloc)(size)
    }
}

/// The real `calloc`.
///
/// # Safety
///
/// Same contract as `calloc(3)`.
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        glibc::__libc_calloc(nmemb, size)
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        (fallback::ALLOC.calloc)(nmemb, size)
    }
}

/// The real `realloc`.
///
/// # Safety
///
/// Same contract as `realloc(3)`.
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        glibc::__libc_realloc(ptr, size)
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        (fallback::ALLOC.realloc)(ptr, size)
    }
}

/// The real `free`.
///
/// # Safety
///
/// Same contract as `free(3)`.
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        glibc::__libc_free(ptr)
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        (fallback::ALLOC.free)(ptr)
    }
}

/// Allocator used for the tracker's own fixed-shape bookkeeping.
///
/// Going through these pointers instead of the Rust global allocator keeps
/// pool chunks out of the interposed `malloc` entirely.
#[derive(Clone, Copy)]
pub struct RawAlloc {
    pub malloc: unsafe extern "C" fn(size: size_t) -> *mut c_void,
    pub free: unsafe extern "C" fn(ptr: *mut c_void),
}

impl RawAlloc {
    pub fn real() -> Self {
        RawAlloc { malloc, free }
    }
}

impl Default for RawAlloc {
    fn default() -> Self {
        RawAlloc::real()
    }
}

/// Next definitions of the non-malloc symbols.
pub struct NextFns {
    pub new: Option<NewFn>,
    pub new_array: Option<NewFn>,
    pub delete: Option<DeleteFn>,
    pub delete_array: Option<DeleteFn>,
    pub sized_delete: Option<SizedDeleteFn>,
    pub sized_delete_array: Option<SizedDeleteFn>,
    pub open: OpenFn,
    pub open64: OpenFn,
    pub open2: Option<Open2Fn>,
    pub close: CloseFn,
    pub fopen: FopenFn,
    pub fclose: FcloseFn,
}

#[cfg(target_pointer_width = "64")]
pub mod mangled {
    pub const NEW: &str = "_Znwm";
    pub const NEW_ARRAY: &str = "_Znam";
    pub const SIZED_DELETE: &str = "_ZdlPvm";
    pub const SIZED_DELETE_ARRAY: &str = "_ZdaPvm";
}

#[cfg(target_pointer_width = "32")]
pub mod mangled {
    pub const NEW: &str = "_Znwj";
    pub const NEW_ARRAY: &str = "_Znaj";
    pub const SIZED_DELETE: &str = "_ZdlPvj";
    pub const SIZED_DELETE_ARRAY: &str = "_ZdaPvj";
}

pub const DELETE: &str = "_ZdlPv";
pub const DELETE_ARRAY: &str = "_ZdaPv";

static NEXT: OnceCell<NextFns> = OnceCell::new();

// `name` must not contain NUL; names are the fixed symbol constants above.
fn lookup(name: &str) -> Option<*mut c_void> {
    let mut buf = [0u8; 32];
    let bytes = name.as_bytes();
    if bytes.len() >= buf.len() {
        return None;
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    let sym = unsafe { dlsym(RTLD_NEXT, buf.as_ptr() as *const c_char) };
    if sym.is_null() {
        None
    } else {
        Some(sym)
    }
}

fn required(name: &'static str) -> Result<*mut c_void> {
    lookup(name).ok_or(Error::SymbolResolution(name))
}

fn resolve() -> Result<NextFns> {
    // SAFETY: each pointer comes from `dlsym` for a symbol whose C signature
    // matches the function-pointer type it is transmuted to.
    unsafe {
        let open: OpenFn = std::mem::transmute(required("open")?);
        Ok(NextFns {
            new: lookup(mangled::NEW).map(|p| std::mem::transmute(p)),
            new_array: lookup(mangled::NEW_ARRAY).map(|p| std::mem::transmute(p)),
            delete: lookup(DELETE).map(|p| std::mem::transmute(p)),
            delete_array: lookup(DELETE_ARRAY).map(|p| std::mem::transmute(p)),
            sized_delete: lookup(mangled::SIZED_DELETE).map(|p| std::mem::transmute(p)),
            sized_delete_array: lookup(mangled::SIZED_DELETE_ARRAY)
                .map(|p| std::mem::transmute(p)),
            open,
            open64: lookup("open64").map_or(open, |p| std::mem::transmute(p)),
            open2: lookup("__open_2").map(|p| std::mem::transmute(p)),
            close: std::mem::transmute(required("close")?),
            fopen: std::mem::transmute(required("fopen")?),
            fclose: std::mem::transmute(required("fclose")?),
        })
    }
}

/// Resolve the next definitions, failing if a required symbol is missing.
pub fn prepare() -> Result<&'static NextFns> {
    NEXT.get_or_try_init(resolve)
}

/// Next definitions for a proxy, resolving on first use if `prepare` never ran.
pub fn next() -> Option<&'static NextFns> {
    match NEXT.get() {
        Some(fns) => Some(fns),
        None => prepare().ok(),
    }
}
