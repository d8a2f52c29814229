//! Address-indexed record store.
//!
//! A fixed array of buckets, each an intrusive singly linked list of
//! [`AllocRecord`]s behind its own lock. Writers coming from the allocation
//! hot path only ever *try* a bucket lock: when it is contended the event is
//! skipped rather than waited for, so the application's allocator can never
//! stall behind tracker bookkeeping. Traversals for reports take each bucket
//! lock for real.

use std::{ops::ControlFlow, ptr, ptr::NonNull};

use parking_lot::Mutex;

use crate::record::{Addr, AllocRecord};

/// Number of buckets. Prime, to spread aligned addresses.
pub const BUCKET_COUNT: usize = 10007;

struct Chain {
    head: *mut AllocRecord,
}

// The chain owns its records exclusively; access is serialized by the bucket lock.
unsafe impl Send for Chain {}

/// Run `f` under `lock` if it can be taken without blocking.
///
/// `None` means the lock was contended and `f` never ran.
pub fn try_with<T, R>(lock: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    let mut guard = lock.try_lock()?;
    Some(f(&mut guard))
}

/// The bucket was busy and the record was not added.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Contended;

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The record was unlinked; the caller now owns it.
    Removed(NonNull<AllocRecord>),
    /// The address was never tracked (or its add was skipped).
    NotFound,
    /// The bucket was busy; the store is unchanged.
    Skipped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StoreStats {
    pub total_records: usize,
    pub max_bucket_len: usize,
    pub mean_bucket_len: f64,
}

pub struct RecordStore {
    buckets: Box<[Mutex<Chain>]>,
}

impl RecordStore {
    pub fn new() -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|_| {
                Mutex::new(Chain {
                    head: ptr::null_mut(),
                })
            })
            .collect();
        RecordStore { buckets }
    }

    #[inline]
    pub fn bucket_index(addr: Addr) -> usize {
        // Drop the alignment bits; they are identical for most blocks.
        (addr.get() >> 3) % BUCKET_COUNT
    }

    /// Link `record` at the head of its bucket.
    ///
    /// # Safety
    ///
    /// `record` must point to an initialized record that is not in any store
    /// and that stays valid until it is removed or the store is cleared.
    pub unsafe fn add(&self, record: NonNull<AllocRecord>) -> Result<(), Contended> {
        let bucket = &self.buckets[Self::bucket_index(record.as_ref().addr)];
        try_with(bucket, |chain| {
            (*record.as_ptr()).next = chain.head;
            chain.head = record.as_ptr();
        })
        .ok_or(Contended)
    }

    /// Unlink the record for `addr`.
    pub fn remove(&self, addr: Addr) -> RemoveOutcome {
        let bucket = &self.buckets[Self::bucket_index(addr)];
        try_with(bucket, |chain| {
            let mut link: *mut *mut AllocRecord = &mut chain.head;
            // SAFETY: every pointer in the chain is a live record owned by it.
            unsafe {
                while !(*link).is_null() {
                    let curr = *link;
                    if (*curr).addr == addr {
                        *link = (*curr).next;
                        (*curr).next = ptr::null_mut();
                        return RemoveOutcome::Removed(NonNull::new_unchecked(curr));
                    }
                    link = ptr::addr_of_mut!((*curr).next);
                }
            }
            RemoveOutcome::NotFound
        })
        .unwrap_or(RemoveOutcome::Skipped)
    }

    /// Visit every record, bucket by bucket, until `f` breaks.
    ///
    /// Each bucket lock is held while its records are visited.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&AllocRecord) -> ControlFlow<()>,
    {
        for bucket in self.buckets.iter() {
            let chain = bucket.lock();
            let mut curr = chain.head;
            while !curr.is_null() {
                // SAFETY: the bucket lock keeps the chain stable.
                let record = unsafe { &*curr };
                let next = record.next;
                if f(record).is_break() {
                    return;
                }
                curr = next;
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        let mut total = 0;
        let mut max = 0;
        for bucket in self.buckets.iter() {
            let chain = bucket.lock();
            let mut len = 0;
            let mut curr = chain.head;
            while !curr.is_null() {
                len += 1;
                curr = unsafe { (*curr).next };
            }
            total += len;
            max = max.max(len);
        }
        StoreStats {
            total_records: total,
            max_bucket_len: max,
            mean_bucket_len: total as f64 / BUCKET_COUNT as f64,
        }
    }

    /// Forget every record. The records themselves belong to the pool.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.get_mut().head = ptr::null_mut();
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_bucket_of(&self, addr: Addr) -> parking_lot::MutexGuard<'_, impl Sized> {
        self.buckets[Self::bucket_index(addr)].lock()
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        RecordStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pool::RecordPool, real::RawAlloc, record::Backtrace};
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    fn record(pool: &RecordPool, addr: usize, size: usize) -> NonNull<AllocRecord> {
        let slot = pool.alloc_record().unwrap();
        unsafe {
            slot.as_ptr()
                .write(AllocRecord::new(Addr::new(addr), size, Backtrace::EMPTY))
        };
        slot
    }

    fn contents(store: &RecordStore) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        store.for_each(|r| {
            out.push((r.addr().get(), r.size()));
            ControlFlow::Continue(())
        });
        out.sort_unstable();
        out
    }

    #[test]
    fn add_remove_roundtrip() {
        let pool = RecordPool::new(RawAlloc::real());
        let store = RecordStore::new();
        unsafe {
            store.add(record(&pool, 0x1000, 16)).unwrap();
            store.add(record(&pool, 0x2000, 32)).unwrap();
        }
        assert_eq!(contents(&store), vec![(0x1000, 16), (0x2000, 32)]);

        match store.remove(Addr::new(0x1000)) {
            RemoveOutcome::Removed(r) => assert_eq!(unsafe { r.as_ref() }.size(), 16),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.remove(Addr::new(0x1000)), RemoveOutcome::NotFound);
        assert_eq!(contents(&store), vec![(0x2000, 32)]);
    }

    #[test]
    fn colliding_addresses_share_a_bucket() {
        let pool = RecordPool::new(RawAlloc::real());
        let store = RecordStore::new();
        let a = 0x10_0000;
        let b = a + (BUCKET_COUNT << 3);
        let c = b + (BUCKET_COUNT << 3);
        assert_eq!(RecordStore::bucket_index(Addr::new(a)), RecordStore::bucket_index(Addr::new(c)));
        unsafe {
            for addr in [a, b, c] {
                store.add(record(&pool, addr, 1)).unwrap();
            }
        }
        assert_eq!(store.stats().max_bucket_len, 3);

        // Unlink from the middle of the chain.
        assert!(matches!(store.remove(Addr::new(b)), RemoveOutcome::Removed(_)));
        assert_eq!(contents(&store), vec![(a, 1), (c, 1)]);
    }

    #[test]
    fn contended_bucket_skips() {
        let pool = RecordPool::new(RawAlloc::real());
        let store = RecordStore::new();
        let addr = Addr::new(0x4000);
        unsafe { store.add(record(&pool, addr.get(), 8)).unwrap() };

        let guard = store.lock_bucket_of(addr);
        assert_eq!(unsafe { store.add(record(&pool, 0x4000, 8)) }, Err(Contended));
        assert_eq!(store.remove(addr), RemoveOutcome::Skipped);
        drop(guard);

        assert!(matches!(store.remove(addr), RemoveOutcome::Removed(_)));
    }

    #[test]
    fn traversal_stops_on_break() {
        let pool = RecordPool::new(RawAlloc::real());
        let store = RecordStore::new();
        for i in 1..=50 {
            unsafe { store.add(record(&pool, i * 4096, i)).unwrap() };
        }
        let mut visited = 0;
        store.for_each(|_| {
            visited += 1;
            if visited == 10 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(visited, 10);
    }

    #[test]
    fn stats_and_clear() {
        let pool = RecordPool::new(RawAlloc::real());
        let mut store = RecordStore::new();
        for i in 0..100 {
            unsafe { store.add(record(&pool, 0x8000 + i * 16, 1)).unwrap() };
        }
        let stats = store.stats();
        assert_eq!(stats.total_records, 100);
        assert!(stats.max_bucket_len >= 1);
        assert!((stats.mean_bucket_len - 100.0 / BUCKET_COUNT as f64).abs() < 1e-12);

        store.clear();
        assert_eq!(store.stats().total_records, 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        // Eight buckets with eight candidate addresses each.
        let addr = (0usize..64).prop_map(|i| 0x1000 + (i % 8) * 8 + (i / 8) * (BUCKET_COUNT << 3));
        prop_oneof![addr.clone().prop_map(Op::Add), addr.prop_map(Op::Remove)]
    }

    proptest! {
        #[test]
        fn every_address_lives_in_exactly_its_bucket(ops in proptest::collection::vec(op(), 1..300)) {
            let pool = RecordPool::new(RawAlloc::real());
            let store = RecordStore::new();
            let mut live: HashSet<usize> = HashSet::new();

            for op in ops {
                match op {
                    Op::Add(addr) => {
                        // Addresses are unique among live blocks.
                        if live.insert(addr) {
                            unsafe { store.add(record(&pool, addr, addr)).unwrap() };
                        }
                    }
                    Op::Remove(addr) => {
                        let outcome = store.remove(Addr::new(addr));
                        prop_assert_eq!(matches!(outcome, RemoveOutcome::Removed(_)), live.remove(&addr));
                    }
                }
            }

            let mut seen: HashMap<usize, usize> = HashMap::new();
            for (index, bucket) in store.buckets.iter().enumerate() {
                let chain = bucket.lock();
                let mut curr = chain.head;
                while !curr.is_null() {
                    let addr = unsafe { (*curr).addr };
                    prop_assert_eq!(RecordStore::bucket_index(addr), index);
                    *seen.entry(addr.get()).or_default() += 1;
                    curr = unsafe { (*curr).next };
                }
            }
            prop_assert!(seen.values().all(|n| *n == 1));
            prop_assert_eq!(seen.keys().copied().collect::<HashSet<_>>(), live);
        }
    }
}
