//! Installing proxies into target libraries.
//!
//! The mechanism that actually redirects a library's calls is a
//! [`HookEngine`]. [`HookController`] decides what to install where, keeps
//! the handle of every installed stub, and removes them again.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    guard::ReentryGuard,
    real::{mangled, DELETE, DELETE_ARRAY},
};

/// A tracked symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Malloc,
    Calloc,
    Realloc,
    Free,
    New,
    NewArray,
    Delete,
    DeleteArray,
    SizedDelete,
    SizedDeleteArray,
    Open,
    Open64,
    Open2,
    Close,
    Fopen,
    Fclose,
}

impl Target {
    pub const COUNT: usize = 16;

    pub const ALL: [Target; Target::COUNT] = [
        Target::Malloc,
        Target::Calloc,
        Target::Realloc,
        Target::Free,
        Target::New,
        Target::NewArray,
        Target::Delete,
        Target::DeleteArray,
        Target::SizedDelete,
        Target::SizedDeleteArray,
        Target::Open,
        Target::Open64,
        Target::Open2,
        Target::Close,
        Target::Fopen,
        Target::Fclose,
    ];

    /// Linker-level symbol name.
    pub const fn symbol(self) -> &'static str {
        match self {
            Target::Malloc => "malloc",
            Target::Calloc => "calloc",
            Target::Realloc => "realloc",
            Target::Free => "free",
            Target::New => mangled::NEW,
            Target::NewArray => mangled::NEW_ARRAY,
            Target::Delete => DELETE,
            Target::DeleteArray => DELETE_ARRAY,
            Target::SizedDelete => mangled::SIZED_DELETE,
            Target::SizedDeleteArray => mangled::SIZED_DELETE_ARRAY,
            Target::Open => "open",
            Target::Open64 => "open64",
            Target::Open2 => "__open_2",
            Target::Close => "close",
            Target::Fopen => "fopen",
            Target::Fclose => "fclose",
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Symbols hooked for memory tracking.
pub const MEMORY_TARGETS: [Target; 10] = [
    Target::Malloc,
    Target::Calloc,
    Target::Realloc,
    Target::Free,
    Target::New,
    Target::NewArray,
    Target::Delete,
    Target::DeleteArray,
    Target::SizedDelete,
    Target::SizedDeleteArray,
];

/// Symbols hooked for descriptor tracking.
pub const FD_TARGETS: [Target; 6] = [
    Target::Open,
    Target::Open64,
    Target::Open2,
    Target::Close,
    Target::Fopen,
    Target::Fclose,
];

/// A symbol together with the proxy that should replace it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookSymbol {
    pub target: Target,
    /// Address of the replacement function.
    pub proxy: usize,
}

/// Opaque token for one installed interception.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StubHandle(u64);

impl StubHandle {
    pub const fn new(id: u64) -> Self {
        StubHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Library pattern that stands for every loaded object.
pub const ALL_LIBRARIES: &str = "*";

/// Mechanism that redirects a library's calls to a proxy.
pub trait HookEngine: Send + Sync {
    /// Fails if this engine cannot hook `library` at all.
    fn check_library(&self, library: &str) -> Result<()> {
        let _ = library;
        Ok(())
    }

    /// Redirect `symbol` inside `library`.
    fn install(&self, library: &str, symbol: &HookSymbol) -> Result<StubHandle>;

    /// Undo one [`install`](HookEngine::install).
    fn uninstall(&self, stub: StubHandle) -> Result<()>;
}

struct InstalledStub {
    library: String,
    target: Target,
    handle: StubHandle,
}

pub struct HookController {
    name: &'static str,
    engine: Arc<dyn HookEngine>,
    symbols: Vec<HookSymbol>,
    installed: Mutex<Vec<InstalledStub>>,
    max_installs: AtomicUsize,
}

impl HookController {
    pub fn new(
        name: &'static str,
        engine: Arc<dyn HookEngine>,
        symbols: Vec<HookSymbol>,
        max_installs: usize,
    ) -> Self {
        HookController {
            name,
            engine,
            symbols,
            installed: Mutex::new(Vec::new()),
            max_installs: AtomicUsize::new(max_installs),
        }
    }

    pub fn set_max_installs(&self, max: usize) {
        self.max_installs.store(max, Ordering::Relaxed);
    }

    /// Install every symbol in every library in `libraries`.
    ///
    /// Every name is first checked with [`HookEngine::check_library`]; a
    /// rejected name fails the whole call before anything is installed.
    /// Symbols already installed for a library are left alone. A symbol that
    /// fails to install is logged and skipped. If a library would push the
    /// stub count over the limit, it and every library after it are refused
    /// with [`Error::HookLimit`]; stubs installed up to that point stay.
    pub fn hook<S: AsRef<str>>(&self, libraries: &[S]) -> Result<usize> {
        let _reentry = ReentryGuard::enter();
        if libraries.is_empty() {
            return Err(Error::InvalidArgument("no libraries to hook".into()));
        }
        if libraries.iter().any(|l| l.as_ref().is_empty()) {
            return Err(Error::InvalidArgument("empty library name".into()));
        }
        for library in libraries {
            let library: &str = library.as_ref();
            if let Err(e) = self.engine.check_library(library) {
                tracing::error!("{}: cannot hook {}: {}", self.name, library, e);
                return Err(e);
            }
        }

        let limit = self.max_installs.load(Ordering::Relaxed);
        let mut installed = self.installed.lock();
        let mut count = 0;
        for library in libraries.iter().map(AsRef::as_ref) {
            let pending: Vec<&HookSymbol> = self
                .symbols
                .iter()
                .filter(|s| {
                    !installed
                        .iter()
                        .any(|i| i.library == library && i.target == s.target)
                })
                .collect();
            if installed.len() + pending.len() > limit {
                tracing::error!(
                    "{}: cannot hook {}: {} stubs installed, limit is {}",
                    self.name,
                    library,
                    installed.len(),
                    limit
                );
                return Err(Error::HookLimit {
                    installed: installed.len(),
                    limit,
                });
            }

            tracing::info!("{}: hooking {}", self.name, library);
            for symbol in pending {
                match self.engine.install(library, symbol) {
                    Ok(handle) => {
                        tracing::debug!("  {} hooked ({:?})", symbol.target.symbol(), handle);
                        installed.push(InstalledStub {
                            library: library.to_string(),
                            target: symbol.target,
                            handle,
                        });
                        count += 1;
                    }
                    Err(e) => tracing::warn!("  {} not hooked: {}", symbol.target.symbol(), e),
                }
            }
        }
        Ok(count)
    }

    /// Remove the stubs installed for `libraries`.
    pub fn unhook<S: AsRef<str>>(&self, libraries: &[S]) -> Result<usize> {
        let _reentry = ReentryGuard::enter();
        if libraries.is_empty() {
            return Err(Error::InvalidArgument("no libraries to unhook".into()));
        }
        let mut installed = self.installed.lock();
        let (remove, keep): (Vec<_>, Vec<_>) = installed
            .drain(..)
            .partition(|s| libraries.iter().any(|l| l.as_ref() == s.library));
        *installed = keep;
        drop(installed);
        Ok(self.uninstall(remove))
    }

    /// Remove every installed stub. Calling it again is a no-op.
    pub fn unhook_all(&self) -> usize {
        let _reentry = ReentryGuard::enter();
        let stubs = std::mem::take(&mut *self.installed.lock());
        self.uninstall(stubs)
    }

    fn uninstall(&self, stubs: Vec<InstalledStub>) -> usize {
        let mut removed = 0;
        for stub in stubs {
            match self.engine.uninstall(stub.handle) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    "{}: failed to unhook {} in {}: {}",
                    self.name,
                    stub.target.symbol(),
                    stub.library,
                    e
                ),
            }
        }
        if removed > 0 {
            tracing::info!("{}: {} stubs removed", self.name, removed);
        }
        removed
    }

    pub fn installed_count(&self) -> usize {
        self.installed.lock().len()
    }

    pub fn is_hooked(&self, library: &str) -> bool {
        self.installed.lock().iter().any(|s| s.library == library)
    }
}
