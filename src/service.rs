//! The process-wide tracking service and its control surface.
//!
//! Hooking is process-wide, so the proxies need one shared [`LeakHook`].
//! It is created by the first [`init`] and lives for the rest of the
//! process; [`teardown`] only deactivates and resets it, and a later `init`
//! re-activates it with new options. Everything in here except the proxies
//! goes through [`service`], which fails with [`Error::NotInitialized`]
//! while the service is inactive.
//!
//! Tests that need an isolated instance construct a [`LeakHook`] directly.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use once_cell::sync::OnceCell;

use crate::{
    config::Config,
    error::{Error, Result},
    fd::{FdStats, FdTracker},
    hook::{HookController, HookEngine, FD_TARGETS, MEMORY_TARGETS},
    json::JsonFormat,
    pool::PoolStats,
    preload::PreloadEngine,
    proxy::hook_symbols,
    real,
    stats::MemoryStats,
    store::StoreStats,
    tracker::MemoryTracker,
};

/// One tracking session: both trackers and their hook controllers.
pub struct LeakHook {
    memory: MemoryTracker,
    fds: FdTracker,
    memory_hooks: HookController,
    fd_hooks: HookController,
}

impl LeakHook {
    pub fn new(config: &Config, engine: Arc<dyn HookEngine>) -> Self {
        LeakHook {
            memory: MemoryTracker::from_config(config),
            fds: FdTracker::new(config.debug),
            memory_hooks: HookController::new(
                "memory",
                engine.clone(),
                hook_symbols(&MEMORY_TARGETS),
                config.max_installs,
            ),
            fd_hooks: HookController::new(
                "fd",
                engine,
                hook_symbols(&FD_TARGETS),
                config.max_installs,
            ),
        }
    }

    pub fn configure(&self, config: &Config) {
        self.memory.configure(config);
        self.fds.set_debug(config.debug);
        self.memory_hooks.set_max_installs(config.max_installs);
        self.fd_hooks.set_max_installs(config.max_installs);
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    pub fn fds(&self) -> &FdTracker {
        &self.fds
    }

    pub fn memory_hooks(&self) -> &HookController {
        &self.memory_hooks
    }

    pub fn fd_hooks(&self) -> &HookController {
        &self.fd_hooks
    }

    /// Remove every stub and forget everything tracked so far.
    pub fn shutdown(&self) {
        self.memory_hooks.unhook_all();
        self.fd_hooks.unhook_all();
        self.memory.reset();
        self.fds.reset();
    }
}

static SERVICE: OnceCell<LeakHook> = OnceCell::new();
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Start tracking with `config`.
///
/// Calling it again while active logs a warning and returns the running
/// service unchanged.
pub fn init(config: &Config) -> Result<&'static LeakHook> {
    // Resolve before anything is hooked, so no proxy resolves lazily.
    real::prepare()?;

    let mut created = false;
    let service = SERVICE.get_or_init(|| {
        created = true;
        LeakHook::new(config, Arc::new(PreloadEngine::new()))
    });
    if ACTIVE.load(Ordering::Acquire) {
        tracing::warn!("leakhook already initialized");
        return Ok(service);
    }
    if !created {
        service.configure(config);
    }
    ACTIVE.store(true, Ordering::Release);
    tracing::info!(
        "leakhook initialized (debug={}, backtrace={})",
        config.debug,
        config.backtrace
    );
    Ok(service)
}

/// Unhook everything, deactivate the proxies and reset all tracking state.
pub fn teardown() {
    if let Some(service) = SERVICE.get() {
        if ACTIVE.swap(false, Ordering::AcqRel) {
            service.shutdown();
            tracing::info!("leakhook shut down");
        }
    }
}

/// The running service, or `None` while inactive. Used by the proxies.
#[inline]
pub fn active() -> Option<&'static LeakHook> {
    if ACTIVE.load(Ordering::Acquire) {
        SERVICE.get()
    } else {
        None
    }
}

pub fn service() -> Result<&'static LeakHook> {
    active().ok_or(Error::NotInitialized)
}

pub fn hook<S: AsRef<str>>(libraries: &[S]) -> Result<usize> {
    service()?.memory_hooks.hook(libraries)
}

pub fn unhook<S: AsRef<str>>(libraries: &[S]) -> Result<usize> {
    service()?.memory_hooks.unhook(libraries)
}

pub fn unhook_all() -> Result<usize> {
    Ok(service()?.memory_hooks.unhook_all())
}

pub fn text_report() -> Result<String> {
    service()?.memory.text_report()
}

pub fn dump_report(path: &Path) -> Result<()> {
    service()?.memory.dump_report(path)
}

pub fn json(format: JsonFormat) -> Result<String> {
    service()?.memory.json(format)
}

pub fn leaks_json() -> Result<String> {
    json(JsonFormat::Raw)
}

pub fn aggregated_json() -> Result<String> {
    json(JsonFormat::Aggregated)
}

pub fn stats() -> Result<MemoryStats> {
    Ok(service()?.memory.stats())
}

pub fn reset_stats() -> Result<()> {
    service()?.memory.reset();
    Ok(())
}

pub fn set_backtrace_enabled(enabled: bool) -> Result<()> {
    service()?.memory.set_backtrace_enabled(enabled);
    Ok(())
}

pub fn is_backtrace_enabled() -> bool {
    active().is_some_and(|s| s.memory.is_backtrace_enabled())
}

pub fn store_stats() -> Result<StoreStats> {
    Ok(service()?.memory.store_stats())
}

pub fn pool_stats() -> Result<PoolStats> {
    Ok(service()?.memory.pool_stats())
}

pub fn fd_hook<S: AsRef<str>>(libraries: &[S]) -> Result<usize> {
    service()?.fd_hooks.hook(libraries)
}

pub fn fd_unhook<S: AsRef<str>>(libraries: &[S]) -> Result<usize> {
    service()?.fd_hooks.unhook(libraries)
}

pub fn fd_unhook_all() -> Result<usize> {
    Ok(service()?.fd_hooks.unhook_all())
}

pub fn fd_report() -> Result<String> {
    service()?.fds.text_report()
}

pub fn fd_dump_report(path: &Path) -> Result<()> {
    service()?.fds.dump_report(path)
}

pub fn fd_stats() -> Result<FdStats> {
    Ok(service()?.fds.stats())
}

pub fn fd_reset_stats() -> Result<()> {
    service()?.fds.reset();
    Ok(())
}

pub fn fd_leaks_json() -> Result<String> {
    service()?.fds.leaks_json()
}
