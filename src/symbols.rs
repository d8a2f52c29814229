//! Address-to-symbol resolution and its cache.

use std::{
    ffi::CStr,
    fmt,
    mem::MaybeUninit,
    path::Path,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use backtrace::SymbolName;
use parking_lot::Mutex;

use crate::unwind::ip_ptr;

/// A return address mapped back to its enclosing function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    /// Byte offset of the address from the start of the symbol.
    pub offset: usize,
    /// File name (without directory) of the object that defines the symbol.
    pub library: Option<String>,
}

impl fmt::Display for ResolvedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.name, self.offset)
    }
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, addr: usize) -> Option<ResolvedSymbol>;
}

/// Resolves through the dynamic linker's symbol tables, falling back to
/// debug info for addresses without an exported symbol.
///
/// The library is always the object `dladdr` places the address in. Offsets
/// are measured from runtime symbol starts only; when no start is known the
/// offset is 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct DladdrResolver;

extern "C" {
    // From the unwinder runtime std already links against.
    fn _Unwind_FindEnclosingFunction(pc: *mut libc::c_void) -> *mut libc::c_void;
}

fn dl_info(addr: usize) -> Option<libc::Dl_info> {
    let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: `dladdr` only inspects the address and fills `info`.
    unsafe {
        if libc::dladdr(ip_ptr(addr), info.as_mut_ptr()) == 0 {
            return None;
        }
        Some(info.assume_init())
    }
}

/// Load address of the object containing `addr`.
pub(crate) fn object_base(addr: usize) -> Option<usize> {
    dl_info(addr)
        .map(|info| info.dli_fbase as usize)
        .filter(|base| *base != 0)
}

/// Runtime start of the function containing `addr`, from the unwind tables.
fn enclosing_function(addr: usize) -> Option<usize> {
    // SAFETY: the lookup only reads the loaded objects' unwind tables.
    let start = unsafe { _Unwind_FindEnclosingFunction(ip_ptr(addr)) } as usize;
    (start != 0 && start <= addr).then(|| start)
}

impl DladdrResolver {
    fn library(info: &libc::Dl_info) -> Option<String> {
        if info.dli_fname.is_null() {
            return None;
        }
        // SAFETY: a non-null `dli_fname` is a NUL-terminated string owned by
        // the loader.
        let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
        (!path.is_empty()).then(|| basename(&path))
    }

    fn exported(addr: usize, info: &libc::Dl_info) -> Option<ResolvedSymbol> {
        if info.dli_sname.is_null() || info.dli_saddr.is_null() {
            return None;
        }
        // SAFETY: as above, for `dli_sname`.
        let raw = unsafe { CStr::from_ptr(info.dli_sname) };
        Some(ResolvedSymbol {
            name: SymbolName::new(raw.to_bytes()).to_string(),
            offset: addr.saturating_sub(info.dli_saddr as usize),
            library: Self::library(info),
        })
    }

    fn debug_info(addr: usize, library: Option<String>) -> Option<ResolvedSymbol> {
        // Inlined frames come first; the last name is the function whose
        // code actually contains `addr`.
        let mut name = None;
        backtrace::resolve(ip_ptr(addr), |s| {
            if let Some(n) = s.name() {
                name = Some(n.to_string());
            }
        });
        Some(ResolvedSymbol {
            name: name?,
            offset: enclosing_function(addr).map_or(0, |start| addr - start),
            library,
        })
    }
}

impl Resolver for DladdrResolver {
    fn resolve(&self, addr: usize) -> Option<ResolvedSymbol> {
        match dl_info(addr) {
            Some(info) => Self::exported(addr, &info)
                .or_else(|| Self::debug_info(addr, Self::library(&info))),
            None => Self::debug_info(addr, None),
        }
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned())
}

/// Slots in the cache's hash table.
pub const CACHE_SLOTS: usize = 4096;

struct CacheEntry {
    addr: usize,
    symbol: Option<ResolvedSymbol>,
    next: *mut CacheEntry,
}

/// Memoized resolutions, including failed ones.
///
/// Lookups walk the slot chains without locking. Inserts take the table lock
/// and re-check the chain first, so racing resolvers never insert twice.
/// Entries are published with release stores and only freed by
/// [`SymbolCache::clear`], which requires exclusive access.
pub struct SymbolCache {
    slots: Box<[AtomicPtr<CacheEntry>]>,
    write: Mutex<()>,
}

unsafe impl Send for SymbolCache {}
unsafe impl Sync for SymbolCache {}

impl SymbolCache {
    pub fn new() -> Self {
        SymbolCache {
            slots: (0..CACHE_SLOTS)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            write: Mutex::new(()),
        }
    }

    fn slot(addr: usize) -> usize {
        (addr >> 2) % CACHE_SLOTS
    }

    fn find(&self, addr: usize) -> Option<&CacheEntry> {
        let mut entry = self.slots[Self::slot(addr)].load(Ordering::Acquire);
        while !entry.is_null() {
            // SAFETY: published entries live until `clear(&mut self)`.
            let e = unsafe { &*entry };
            if e.addr == addr {
                return Some(e);
            }
            entry = e.next;
        }
        None
    }

    /// Cached resolution of `addr`. The outer `None` means "not cached".
    pub fn lookup(&self, addr: usize) -> Option<Option<&ResolvedSymbol>> {
        self.find(addr).map(|e| e.symbol.as_ref())
    }

    pub fn insert(&self, addr: usize, symbol: Option<ResolvedSymbol>) -> Option<&ResolvedSymbol> {
        let _write = self.write.lock();
        if let Some(existing) = self.find(addr) {
            return existing.symbol.as_ref();
        }
        let slot = &self.slots[Self::slot(addr)];
        let entry = Box::into_raw(Box::new(CacheEntry {
            addr,
            symbol,
            next: slot.load(Ordering::Relaxed),
        }));
        slot.store(entry, Ordering::Release);
        unsafe { (*entry).symbol.as_ref() }
    }

    /// Cached resolution of `addr`, asking `resolver` on a miss.
    pub fn resolve_with(&self, addr: usize, resolver: &dyn Resolver) -> Option<&ResolvedSymbol> {
        match self.lookup(addr) {
            Some(symbol) => symbol,
            None => self.insert(addr, resolver.resolve(addr)),
        }
    }

    pub fn len(&self) -> usize {
        let mut len = 0;
        for slot in self.slots.iter() {
            let mut entry = slot.load(Ordering::Acquire);
            while !entry.is_null() {
                len += 1;
                entry = unsafe { (*entry).next };
            }
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            let mut entry = std::mem::replace(slot.get_mut(), ptr::null_mut());
            while !entry.is_null() {
                // SAFETY: every entry came from `Box::into_raw` and is unreachable now.
                let boxed = unsafe { Box::from_raw(entry) };
                entry = boxed.next;
            }
        }
    }
}

impl Default for SymbolCache {
    fn default() -> Self {
        SymbolCache::new()
    }
}

impl Drop for SymbolCache {
    fn drop(&mut self) {
        self.clear();
    }
}

/// JSON rendering of one frame: `name+offset`, or the raw address.
pub fn frame_label(addr: usize, symbol: Option<&ResolvedSymbol>) -> String {
    match symbol {
        Some(s) => s.to_string(),
        None => format!("{:#x}", addr),
    }
}
