//! Bump pool of allocation records.
//!
//! Records live in fixed-size chunks obtained from the real allocator, so
//! tracking an allocation never calls back into the interposed `malloc`.
//! Slots are claimed with an atomic counter per chunk and are never handed
//! back: the pool only grows until [`RecordPool::reset`].

use std::{
    mem::{size_of, MaybeUninit},
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{real::RawAlloc, record::AllocRecord};

/// Record slots per chunk.
pub const CHUNK_SLOTS: usize = 1024;

struct Chunk {
    slots: [MaybeUninit<AllocRecord>; CHUNK_SLOTS],
    used: AtomicUsize,
    next: *mut Chunk,
}

impl Chunk {
    /// # Safety
    ///
    /// `chunk` must point to a live chunk and `index < CHUNK_SLOTS`.
    unsafe fn slot(chunk: *mut Chunk, index: usize) -> NonNull<AllocRecord> {
        let slots = ptr::addr_of_mut!((*chunk).slots) as *mut AllocRecord;
        NonNull::new_unchecked(slots.add(index))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub chunks: usize,
    /// Slots claimed since the last reset, live or abandoned.
    pub records: usize,
}

pub struct RecordPool {
    // Newest chunk first. Chunks are only ever prepended.
    head: AtomicPtr<Chunk>,
    chunks: AtomicUsize,
    grow: Mutex<()>,
    alloc: RawAlloc,
}

// Chunks are reached through raw pointers but are only released by
// `reset(&mut self)`, when no other reference to the pool exists.
unsafe impl Send for RecordPool {}
unsafe impl Sync for RecordPool {}

impl RecordPool {
    pub fn new(alloc: RawAlloc) -> Self {
        RecordPool {
            head: AtomicPtr::new(ptr::null_mut()),
            chunks: AtomicUsize::new(0),
            grow: Mutex::new(()),
            alloc,
        }
    }

    /// Claim an unused, uninitialized record slot.
    ///
    /// Returns `None` only when the real allocator cannot provide a new chunk.
    /// The slot stays valid until the pool is reset.
    pub fn alloc_record(&self) -> Option<NonNull<AllocRecord>> {
        if let Some(slot) = self.claim() {
            return Some(slot);
        }

        let _grow = self.grow.lock();
        // Another thread may have grown the pool while we waited.
        if let Some(slot) = self.claim() {
            return Some(slot);
        }

        let chunk = unsafe { (self.alloc.malloc)(size_of::<Chunk>()) } as *mut Chunk;
        if chunk.is_null() {
            return None;
        }
        // SAFETY: `chunk` is a fresh allocation large enough for a `Chunk`;
        // the slots stay uninitialized until claimed.
        unsafe {
            ptr::addr_of_mut!((*chunk).used).write(AtomicUsize::new(1));
            ptr::addr_of_mut!((*chunk).next).write(self.head.load(Ordering::Acquire));
        }
        self.head.store(chunk, Ordering::Release);
        self.chunks.fetch_add(1, Ordering::Relaxed);
        Some(unsafe { Chunk::slot(chunk, 0) })
    }

    fn claim(&self) -> Option<NonNull<AllocRecord>> {
        let mut chunk = self.head.load(Ordering::Acquire);
        while !chunk.is_null() {
            // SAFETY: chunks reachable from `head` stay alive until `reset`.
            let used = unsafe { &(*chunk).used };
            let mut current = used.load(Ordering::Relaxed);
            while current < CHUNK_SLOTS {
                match used.compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(unsafe { Chunk::slot(chunk, current) }),
                    Err(actual) => current = actual,
                }
            }
            chunk = unsafe { (*chunk).next };
        }
        None
    }

    /// Give a record back. Slots are not recycled, so this does nothing.
    pub fn free_record(&self, _record: NonNull<AllocRecord>) {}

    /// Release every chunk. All records handed out so far become invalid.
    pub fn reset(&mut self) {
        let mut chunk = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        let mut released = 0;
        while !chunk.is_null() {
            // SAFETY: we have exclusive access; every chunk came from `alloc.malloc`.
            let next = unsafe { (*chunk).next };
            unsafe { (self.alloc.free)(chunk.cast()) };
            chunk = next;
            released += 1;
        }
        *self.chunks.get_mut() = 0;
        if released > 0 {
            tracing::debug!("record pool reset: {} chunks released", released);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        let mut chunk = self.head.load(Ordering::Acquire);
        while !chunk.is_null() {
            stats.chunks += 1;
            stats.records += unsafe { (*chunk).used.load(Ordering::Relaxed) }.min(CHUNK_SLOTS);
            chunk = unsafe { (*chunk).next };
        }
        stats
    }
}

impl Drop for RecordPool {
    fn drop(&mut self) {
        self.reset();
    }
}
