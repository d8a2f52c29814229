//! The memory tracker: records live allocations and answers report queries.
//!
//! Proxies call [`MemoryTracker::track_alloc`], [`MemoryTracker::track_free`]
//! and [`MemoryTracker::track_realloc`] with a closure that performs the real
//! call. The tracker decides, from the thread's depth counters and reentrancy
//! flag, whether the event is recorded; the real call always happens.

use std::{
    path::Path,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Instant,
};

use libc::c_void;
use parking_lot::RwLock;

use crate::{
    config::{Config, DEFAULT_MAX_REPORT_LEAKS},
    error::{Error, Result},
    guard::{in_tracker, DepthGuard, EntryMark, OpClass, ReentryGuard},
    json::{self, JsonFormat},
    pool::{PoolStats, RecordPool},
    real::RawAlloc,
    record::{Addr, AllocRecord, Backtrace},
    report::{self, ReportBuffer, Symbolizer, INITIAL_REPORT_CAPACITY},
    stats::{LifetimeCounters, MemoryStats},
    store::{Contended, RecordStore, RemoveOutcome, StoreStats},
    symbols::{DladdrResolver, Resolver, SymbolCache},
    unwind::{BacktraceUnwinder, Unwinder},
};

/// Reports slower than this are logged.
const SLOW_REPORT_MS: u128 = 10;

struct TrackerState {
    store: RecordStore,
    pool: RecordPool,
    symbols: SymbolCache,
}

impl TrackerState {
    fn new(alloc: RawAlloc) -> Self {
        TrackerState {
            store: RecordStore::new(),
            pool: RecordPool::new(alloc),
            symbols: SymbolCache::new(),
        }
    }
}

pub struct MemoryTracker {
    // Proxies only `try_read`, reports `read`, reset `write`.
    state: RwLock<TrackerState>,
    counters: LifetimeCounters,
    backtrace: AtomicBool,
    debug: AtomicBool,
    max_report_leaks: AtomicUsize,
    report_capacity: AtomicUsize,
    unwinder: Box<dyn Unwinder>,
    resolver: Box<dyn Resolver>,
}

impl MemoryTracker {
    pub fn new(debug: bool, backtrace: bool) -> Self {
        MemoryTracker {
            state: RwLock::new(TrackerState::new(RawAlloc::real())),
            counters: LifetimeCounters::new(),
            backtrace: AtomicBool::new(backtrace),
            debug: AtomicBool::new(debug),
            max_report_leaks: AtomicUsize::new(DEFAULT_MAX_REPORT_LEAKS),
            report_capacity: AtomicUsize::new(INITIAL_REPORT_CAPACITY),
            unwinder: Box::new(BacktraceUnwinder::new()),
            resolver: Box::new(DladdrResolver),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let tracker = Self::new(config.debug, config.backtrace);
        tracker.configure(config);
        tracker
    }

    /// Apply the runtime options of `config`.
    pub fn configure(&self, config: &Config) {
        self.set_debug(config.debug);
        self.set_backtrace_enabled(config.backtrace);
        self.max_report_leaks
            .store(config.max_report_leaks, Ordering::Relaxed);
    }

    pub fn with_unwinder(mut self, unwinder: impl Unwinder + 'static) -> Self {
        self.unwinder = Box::new(unwinder);
        self
    }

    pub fn with_resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Use `alloc` for record pool chunks.
    pub fn with_raw_alloc(self, alloc: RawAlloc) -> Self {
        *self.state.write() = TrackerState::new(alloc);
        self
    }

    pub fn with_max_report_leaks(self, max: usize) -> Self {
        self.max_report_leaks.store(max, Ordering::Relaxed);
        self
    }

    /// Initial capacity of report and listing buffers.
    pub fn with_report_capacity(self, capacity: usize) -> Self {
        self.report_capacity.store(capacity, Ordering::Relaxed);
        self
    }

    pub fn set_backtrace_enabled(&self, enabled: bool) {
        self.backtrace.store(enabled, Ordering::Relaxed);
    }

    pub fn is_backtrace_enabled(&self) -> bool {
        self.backtrace.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Run an allocating call and record the block it returns.
    ///
    /// The recorded backtrace starts at the caller of the outermost proxy,
    /// or at the caller of this function when no proxy is involved.
    #[inline(never)]
    pub fn track_alloc<F>(&self, size: usize, call: F) -> *mut c_void
    where
        F: FnOnce() -> *mut c_void,
    {
        let anchor = 0u8;
        let _mark = EntryMark::enter(&anchor);
        let depth = DepthGuard::enter(OpClass::Alloc);
        let ptr = call();
        if !ptr.is_null() && depth.is_outermost() && !in_tracker() {
            self.record_alloc(Addr::from_ptr(ptr), size);
        }
        ptr
    }

    /// Forget `ptr`, then run the releasing call.
    ///
    /// The record goes first: once the block is released its address may be
    /// handed to another thread, whose record must not be the one removed.
    #[inline]
    pub fn track_free<F, R>(&self, ptr: *mut c_void, call: F) -> R
    where
        F: FnOnce() -> R,
    {
        let depth = DepthGuard::enter(OpClass::Free);
        if !ptr.is_null() && depth.is_outermost() && !in_tracker() {
            if let Some(size) = self.take_record(Addr::from_ptr(ptr)).map(|r| r.size) {
                self.counters.record_free(size);
            }
        }
        call()
    }

    /// `realloc` as a release of the old block followed by an acquisition.
    #[inline(never)]
    pub fn track_realloc<F>(&self, ptr: *mut c_void, size: usize, call: F) -> *mut c_void
    where
        F: FnOnce() -> *mut c_void,
    {
        let anchor = 0u8;
        let _mark = EntryMark::enter(&anchor);
        let alloc_depth = DepthGuard::enter(OpClass::Alloc);
        let free_depth = DepthGuard::enter(OpClass::Free);

        let old = if !ptr.is_null() && free_depth.is_outermost() && !in_tracker() {
            self.take_record(Addr::from_ptr(ptr))
        } else {
            None
        };

        let new = call();

        if let Some(old) = old {
            if new.is_null() && size != 0 {
                // Failed: the old block is still live and still ours to track.
                self.reinstate(old);
            } else {
                self.counters.record_free(old.size);
            }
        }
        if !new.is_null() && alloc_depth.is_outermost() && !in_tracker() {
            self.record_alloc(Addr::from_ptr(new), size);
        }
        new
    }

    fn capture(&self) -> Backtrace {
        if self.is_backtrace_enabled() {
            Backtrace::capture_with(|frames| self.unwinder.capture(frames))
        } else {
            Backtrace::EMPTY
        }
    }

    fn record_alloc(&self, addr: Addr, size: usize) {
        let _reentry = ReentryGuard::enter();
        let backtrace = self.capture();
        if self.insert(AllocRecord::new(addr, size, backtrace)) {
            self.counters.record_alloc(size);
        }
    }

    // Link a copy of `record` through a fresh pool slot.
    fn insert(&self, record: AllocRecord) -> bool {
        let Some(state) = self.state.try_read() else {
            self.miss("alloc", record.addr, "session busy");
            return false;
        };
        let Some(slot) = state.pool.alloc_record() else {
            self.miss("alloc", record.addr, "record pool exhausted");
            return false;
        };
        let addr = record.addr;
        // SAFETY: the slot is unclaimed, and it stays valid while `state` is
        // read-locked; reset takes the write lock before releasing chunks.
        let added = unsafe {
            slot.as_ptr().write(record);
            state.store.add(slot)
        };
        match added {
            Ok(()) => true,
            Err(Contended) => {
                state.pool.free_record(slot);
                self.miss("alloc", addr, "bucket contended");
                false
            }
        }
    }

    fn reinstate(&self, old: AllocRecord) {
        let _reentry = ReentryGuard::enter();
        self.insert(old);
    }

    // Unlink the record for `addr` and return a copy of it.
    fn take_record(&self, addr: Addr) -> Option<AllocRecord> {
        let _reentry = ReentryGuard::enter();
        let state = match self.state.try_read() {
            Some(state) => state,
            None => {
                self.miss("free", addr, "session busy");
                return None;
            }
        };
        match state.store.remove(addr) {
            RemoveOutcome::Removed(record) => {
                // SAFETY: the record was just unlinked and its chunk cannot be
                // released while `state` is held.
                let r = unsafe { record.as_ref() };
                let copy = AllocRecord::new(r.addr, r.size, r.backtrace);
                state.pool.free_record(record);
                Some(copy)
            }
            RemoveOutcome::NotFound => None,
            RemoveOutcome::Skipped => {
                self.miss("free", addr, "bucket contended");
                None
            }
        }
    }

    fn miss(&self, op: &str, addr: Addr, why: &str) {
        if self.is_debug() {
            tracing::debug!("tracking miss on {} of {}: {}", op, addr, why);
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let _reentry = ReentryGuard::enter();
        let state = self.state.read();
        MemoryStats::collect(&self.counters, &state.store)
    }

    pub fn store_stats(&self) -> StoreStats {
        let _reentry = ReentryGuard::enter();
        self.state.read().store.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        let _reentry = ReentryGuard::enter();
        self.state.read().pool.stats()
    }

    /// Drop every record, release the pool, clear the symbol cache and zero
    /// the lifetime counters.
    pub fn reset(&self) {
        let _reentry = ReentryGuard::enter();
        let mut state = self.state.write();
        state.store.clear();
        state.pool.reset();
        state.symbols.clear();
        self.counters.reset();
        tracing::info!("memory tracking state reset");
    }

    fn log_timing(&self, what: &str, started: Instant, entries: usize) {
        let elapsed = started.elapsed().as_millis();
        if self.is_debug() || elapsed > SLOW_REPORT_MS {
            tracing::info!("{} took {} ms, {} entries", what, elapsed, entries);
        }
    }

    fn report_buffer(&self) -> Result<ReportBuffer> {
        ReportBuffer::with_capacity(self.report_capacity.load(Ordering::Relaxed)).map_err(|e| {
            tracing::error!("cannot allocate report buffer: {}", e);
            e
        })
    }

    /// Text leak report.
    ///
    /// Fails with [`Error::OutOfMemory`] when no buffer can be allocated at
    /// all; a buffer that cannot grow cuts the report short instead.
    pub fn text_report(&self) -> Result<String> {
        let _reentry = ReentryGuard::enter();
        let started = Instant::now();
        let state = self.state.read();
        let stats = MemoryStats::collect(&self.counters, &state.store);
        let mut out = self.report_buffer()?;
        let symbols = Symbolizer {
            cache: &state.symbols,
            resolver: &*self.resolver,
        };
        let max_leaks = self.max_report_leaks.load(Ordering::Relaxed);
        let written = report::write_text_report(&mut out, &stats, &state.store, &symbols, max_leaks)
            .unwrap_or_else(|_| {
                tracing::warn!("leak report truncated after {} bytes", out.len());
                0
            });
        self.log_timing("leak report", started, written);
        Ok(out.into_string())
    }

    pub fn json(&self, format: JsonFormat) -> Result<String> {
        let _reentry = ReentryGuard::enter();
        let started = Instant::now();
        let state = self.state.read();
        let mut out = self.report_buffer()?;
        let symbols = Symbolizer {
            cache: &state.symbols,
            resolver: &*self.resolver,
        };
        let (what, entries) = match format {
            JsonFormat::Raw => ("leak listing", json::write_raw(&mut out, &state.store, &symbols)?),
            JsonFormat::Aggregated => (
                "stack aggregation",
                json::write_aggregated(&mut out, &state.store, &symbols)?,
            ),
        };
        self.log_timing(what, started, entries);
        if self.is_debug() {
            tracing::debug!("generated {} bytes of JSON", out.len());
        }
        Ok(out.into_string())
    }

    pub fn leaks_json(&self) -> Result<String> {
        self.json(JsonFormat::Raw)
    }

    pub fn aggregated_json(&self) -> Result<String> {
        self.json(JsonFormat::Aggregated)
    }

    pub fn dump_report(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("empty report path".into()));
        }
        let report = self.text_report()?;
        let _reentry = ReentryGuard::enter();
        report::dump_to_file(path, &report)?;
        tracing::info!("leak report dumped to {} ({} bytes)", path.display(), report.len());
        Ok(())
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        MemoryTracker::new(false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{json::RawLeak, symbols::ResolvedSymbol, unwind::NoUnwinder};
    use std::{
        collections::HashMap,
        ptr,
        sync::{Arc, Mutex},
    };

    struct FixedUnwinder(Vec<usize>);

    impl Unwinder for FixedUnwinder {
        fn capture(&self, frames: &mut [usize]) -> usize {
            let n = self.0.len().min(frames.len());
            frames[..n].copy_from_slice(&self.0[..n]);
            n
        }
    }

    struct NoResolver;

    impl Resolver for NoResolver {
        fn resolve(&self, _addr: usize) -> Option<ResolvedSymbol> {
            None
        }
    }

    fn tracker() -> MemoryTracker {
        MemoryTracker::new(false, false)
            .with_unwinder(NoUnwinder)
            .with_resolver(NoResolver)
    }

    // Fake heap handing out distinct, never-dereferenced addresses.
    struct FakeHeap {
        next: usize,
    }

    impl FakeHeap {
        fn new() -> Self {
            FakeHeap { next: 0x10_0000 }
        }

        fn take(&mut self, size: usize) -> *mut c_void {
            let p = self.next;
            self.next += size.max(1).next_multiple_of(16) + 16;
            p as *mut c_void
        }
    }

    #[test]
    fn hundred_allocs_forty_frees() {
        let t = tracker();
        let mut heap = FakeHeap::new();
        let blocks: Vec<_> = (0..100).map(|_| t.track_alloc(64, || heap.take(64))).collect();
        for p in &blocks[..40] {
            t.track_free(*p, || ());
        }
        let stats = t.stats();
        assert_eq!(stats.total_alloc_count, 100);
        assert_eq!(stats.total_alloc_size, 6400);
        assert_eq!(stats.total_free_count, 40);
        assert_eq!(stats.total_free_size, 40 * 64);
        assert_eq!(stats.current_alloc_count, 60);
        assert_eq!(stats.current_alloc_size, 60 * 64);
    }

    #[test]
    fn realloc_moves_the_record() {
        let t = tracker();
        let old = 0x5000 as *mut c_void;
        let new = 0x9000 as *mut c_void;
        t.track_alloc(64, || old);
        assert_eq!(t.track_realloc(old, 128, || new), new);

        let leaks: Vec<RawLeak> = serde_json::from_str(&t.leaks_json().unwrap()).unwrap();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].ptr, "0x9000");
        assert_eq!(leaks[0].size, 128);

        let stats = t.stats();
        assert_eq!((stats.total_alloc_count, stats.total_free_count), (2, 1));
        assert_eq!(stats.total_free_size, 64);
    }

    #[test]
    fn realloc_in_place_resizes() {
        let t = tracker();
        let p = 0x7000 as *mut c_void;
        t.track_alloc(10, || p);
        t.track_realloc(p, 20, || p);
        let stats = t.stats();
        assert_eq!((stats.current_alloc_count, stats.current_alloc_size), (1, 20));
    }

    #[test]
    fn failed_realloc_keeps_old_block() {
        let t = tracker();
        let p = 0x7000 as *mut c_void;
        t.track_alloc(10, || p);
        assert!(t.track_realloc(p, 1 << 40, ptr::null_mut).is_null());
        let stats = t.stats();
        assert_eq!((stats.current_alloc_count, stats.current_alloc_size), (1, 10));
        assert_eq!(stats.total_free_count, 0);
    }

    #[test]
    fn realloc_to_zero_frees() {
        let t = tracker();
        let p = 0x7000 as *mut c_void;
        t.track_alloc(10, || p);
        assert!(t.track_realloc(p, 0, ptr::null_mut).is_null());
        let stats = t.stats();
        assert_eq!(stats.current_alloc_count, 0);
        assert_eq!(stats.total_free_count, 1);
    }

    #[test]
    fn realloc_of_null_allocates() {
        let t = tracker();
        t.track_realloc(ptr::null_mut(), 32, || 0x3000 as *mut c_void);
        let stats = t.stats();
        assert_eq!((stats.total_alloc_count, stats.current_alloc_size), (1, 32));
        assert_eq!(stats.total_free_count, 0);
    }

    #[test]
    fn nested_calls_record_once() {
        let t = tracker();
        let p = 0x4000 as *mut c_void;
        // operator new calling malloc.
        let r = t.track_alloc(48, || t.track_alloc(48, || p));
        assert_eq!(r, p);
        assert_eq!(t.stats().current_alloc_count, 1);

        // operator delete calling free.
        t.track_free(p, || t.track_free(p, || ()));
        let stats = t.stats();
        assert_eq!(stats.current_alloc_count, 0);
        assert_eq!(stats.total_free_count, 1);
    }

    #[test]
    fn tracker_internal_calls_are_ignored() {
        let t = tracker();
        {
            let _inside = ReentryGuard::enter();
            t.track_alloc(8, || 0x100 as *mut c_void);
        }
        assert_eq!(t.stats().total_alloc_count, 0);
        // Producing reports does not add records either.
        let _ = t.text_report();
        let _ = t.aggregated_json().unwrap();
        assert_eq!(t.stats().current_alloc_count, 0);
    }

    #[test]
    fn null_results_are_not_recorded() {
        let t = tracker();
        assert!(t.track_alloc(8, ptr::null_mut).is_null());
        t.track_free(ptr::null_mut(), || ());
        assert_eq!(t.stats(), MemoryStats::default());
    }

    #[test]
    fn zero_size_allocations_are_tracked() {
        let t = tracker();
        t.track_alloc(0, || 0x2000 as *mut c_void);
        let stats = t.stats();
        assert_eq!((stats.current_alloc_count, stats.current_alloc_size), (1, 0));
    }

    #[test]
    fn unknown_free_is_silent() {
        let t = tracker();
        t.track_free(0xdead0 as *mut c_void, || ());
        assert_eq!(t.stats().total_free_count, 0);
    }

    #[test]
    fn busy_session_skips_tracking() {
        let t = tracker();
        let held = t.state.write();
        let p = t.track_alloc(8, || 0x2000 as *mut c_void);
        drop(held);
        assert_eq!(p, 0x2000 as *mut c_void);
        assert_eq!(t.stats().total_alloc_count, 0);
    }

    #[test]
    fn backtraces_follow_the_toggle() {
        let t = tracker().with_unwinder(FixedUnwinder(vec![0xaa, 0xbb]));
        t.track_alloc(1, || 0x100 as *mut c_void);
        t.set_backtrace_enabled(true);
        assert!(t.is_backtrace_enabled());
        t.track_alloc(1, || 0x200 as *mut c_void);

        let leaks: Vec<RawLeak> = serde_json::from_str(&t.leaks_json().unwrap()).unwrap();
        let by_ptr: HashMap<_, _> = leaks.into_iter().map(|l| (l.ptr, l.backtrace)).collect();
        assert!(by_ptr["0x100"].is_empty());
        assert_eq!(by_ptr["0x200"], vec!["0xaa", "0xbb"]);

        let report = t.text_report().unwrap();
        assert!(report.contains("Current Leaks: 2 (2 bytes)"));
        assert!(report.contains("  Backtrace (2 frames):\n    #0: 0xaa\n    #1: 0xbb\n"));
    }

    #[test]
    fn recorded_backtrace_starts_at_the_caller() {
        let t = MemoryTracker::new(false, true);
        t.track_alloc(8, || 0x4000 as *mut c_void);
        t.track_realloc(ptr::null_mut(), 16, || 0x5000 as *mut c_void);

        let leaks: Vec<RawLeak> = serde_json::from_str(&t.leaks_json().unwrap()).unwrap();
        assert_eq!(leaks.len(), 2);
        for leak in leaks {
            let first = &leak.backtrace[0];
            assert!(first.contains("recorded_backtrace_starts_at_the_caller"), "{:?}", leak);
            assert!(leak.backtrace.iter().all(|f| !f.contains("MemoryTracker")));
        }
    }

    #[test]
    fn unallocatable_report_is_an_error() {
        let t = tracker().with_report_capacity(usize::MAX);
        t.track_alloc(8, || 0x100 as *mut c_void);
        assert!(matches!(t.text_report(), Err(Error::OutOfMemory)));
        assert!(matches!(t.leaks_json(), Err(Error::OutOfMemory)));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        assert!(matches!(t.dump_report(&path), Err(Error::OutOfMemory)));
        assert!(!path.exists());

        let t = t.with_report_capacity(16);
        assert!(t.text_report().unwrap().contains("Leak #1: ptr=0x100, size=8"));
    }

    #[test]
    fn reset_clears_everything() {
        let t = tracker();
        for i in 1..=2000 {
            t.track_alloc(8, || (i * 64) as *mut c_void);
        }
        assert_eq!(t.pool_stats().chunks, 2);
        assert_eq!(t.store_stats().total_records, 2000);
        t.reset();
        assert_eq!(t.stats(), MemoryStats::default());
        assert_eq!(t.pool_stats(), PoolStats::default());

        t.track_alloc(8, || 0x40 as *mut c_void);
        assert_eq!(t.stats().current_alloc_count, 1);
    }

    #[test]
    fn report_leak_limit() {
        let t = tracker().with_max_report_leaks(5);
        for i in 1..=20 {
            t.track_alloc(i, || (i * 0x1000) as *mut c_void);
        }
        let report = t.text_report().unwrap();
        assert!(report.starts_with("=== Memory Leak Report ===\nTotal Allocations: 20 (210 bytes)\n"));
        assert_eq!(report.matches("Leak #").count(), 5);
    }

    #[test]
    fn dump_report_writes_file() {
        let t = tracker();
        t.track_alloc(77, || 0x1230 as *mut c_void);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        t.dump_report(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Leak #1: ptr=0x1230, size=77"));
        assert!(matches!(
            t.dump_report(Path::new("")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn concurrent_alloc_free_never_deadlocks() {
        let t = Arc::new(tracker());
        let reports = Arc::new(Mutex::new(0usize));
        let workers: Vec<_> = (0..8usize)
            .map(|id| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    let base = 0x1000_0000 + id * 0x100_0000;
                    for round in 0..50 {
                        let blocks: Vec<_> = (0..100)
                            .map(|i| t.track_alloc(16, || (base + (round * 100 + i) * 32) as *mut c_void))
                            .collect();
                        for p in blocks {
                            t.track_free(p, || ());
                        }
                    }
                })
            })
            .collect();
        let reporter = {
            let (t, reports) = (Arc::clone(&t), Arc::clone(&reports));
            std::thread::spawn(move || {
                for _ in 0..20 {
                    let _ = t.stats();
                    let _ = t.aggregated_json().unwrap();
                    *reports.lock().unwrap() += 1;
                }
            })
        };
        for w in workers {
            w.join().unwrap();
        }
        reporter.join().unwrap();
        assert_eq!(*reports.lock().unwrap(), 20);

        // Misses may leave stale records, never more than were allocated.
        let stats = t.stats();
        assert!(stats.total_alloc_count <= 8 * 50 * 100);
        assert!(stats.current_alloc_count <= stats.total_alloc_count);
    }
}
