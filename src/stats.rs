//! Lifetime counters and leak statistics.

use std::{
    ops::ControlFlow,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::store::RecordStore;

/// Monotonic totals updated on every tracked event.
///
/// Relaxed ordering is enough: the counters are only read as approximate
/// aggregates and never order any other memory access.
#[derive(Debug, Default)]
pub struct LifetimeCounters {
    alloc_count: AtomicU64,
    alloc_size: AtomicU64,
    free_count: AtomicU64,
    free_size: AtomicU64,
}

impl LifetimeCounters {
    pub const fn new() -> Self {
        LifetimeCounters {
            alloc_count: AtomicU64::new(0),
            alloc_size: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            free_size: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_alloc(&self, size: usize) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.alloc_size.fetch_add(size as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_free(&self, size: usize) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.free_size.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// `(alloc_count, alloc_size, free_count, free_size)`
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.alloc_count.load(Ordering::Relaxed),
            self.alloc_size.load(Ordering::Relaxed),
            self.free_count.load(Ordering::Relaxed),
            self.free_size.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.alloc_count.store(0, Ordering::Relaxed);
        self.alloc_size.store(0, Ordering::Relaxed);
        self.free_count.store(0, Ordering::Relaxed);
        self.free_size.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time memory statistics.
///
/// Serialized with camelCase keys (`totalAllocCount`, ...).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_alloc_count: u64,
    pub total_alloc_size: u64,
    pub total_free_count: u64,
    pub total_free_size: u64,
    pub current_alloc_count: u64,
    pub current_alloc_size: u64,
}

impl MemoryStats {
    pub fn collect(counters: &LifetimeCounters, store: &RecordStore) -> Self {
        let (total_alloc_count, total_alloc_size, total_free_count, total_free_size) =
            counters.snapshot();
        let (current_alloc_count, current_alloc_size) = current_usage(store);
        MemoryStats {
            total_alloc_count,
            total_alloc_size,
            total_free_count,
            total_free_size,
            current_alloc_count,
            current_alloc_size,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Count and bytes of every record currently in `store`.
pub fn current_usage(store: &RecordStore) -> (u64, u64) {
    let mut count = 0u64;
    let mut bytes = 0u64;
    store.for_each(|record| {
        count += 1;
        bytes += record.size() as u64;
        ControlFlow::Continue(())
    });
    (count, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pool::RecordPool,
        real::RawAlloc,
        record::{Addr, AllocRecord, Backtrace},
    };

    #[test]
    fn counters_accumulate_and_reset() {
        let counters = LifetimeCounters::new();
        counters.record_alloc(64);
        counters.record_alloc(36);
        counters.record_free(64);
        assert_eq!(counters.snapshot(), (2, 100, 1, 64));
        counters.reset();
        assert_eq!(counters.snapshot(), (0, 0, 0, 0));
    }

    #[test]
    fn current_usage_walks_the_store() {
        let pool = RecordPool::new(RawAlloc::real());
        let store = RecordStore::new();
        for (i, size) in [10usize, 20, 30].iter().enumerate() {
            let slot = pool.alloc_record().unwrap();
            unsafe {
                slot.as_ptr().write(AllocRecord::new(
                    Addr::new(0x1000 * (i + 1)),
                    *size,
                    Backtrace::EMPTY,
                ));
                store.add(slot).unwrap();
            }
        }
        assert_eq!(current_usage(&store), (3, 60));

        let counters = LifetimeCounters::new();
        counters.record_alloc(60);
        let stats = MemoryStats::collect(&counters, &store);
        assert_eq!(stats.current_alloc_count, 3);
        assert_eq!(stats.total_alloc_size, 60);
    }

    #[test]
    fn json_uses_camel_case() {
        let stats = MemoryStats {
            total_alloc_count: 100,
            total_alloc_size: 6400,
            total_free_count: 40,
            total_free_size: 2560,
            current_alloc_count: 60,
            current_alloc_size: 3840,
        };
        let json = stats.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"totalAllocCount":100,"totalAllocSize":6400,"totalFreeCount":40,"totalFreeSize":2560,"currentAllocCount":60,"currentAllocSize":3840}"#
        );
        let back: MemoryStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
