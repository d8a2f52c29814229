//! Per-thread depth counters and the reentrancy flag.
//!
//! Some tracked functions are implemented on top of other tracked functions
//! (`operator new` calls `malloc`, `fopen` calls `open`). Each proxy bumps the
//! depth counter of its operation class and only the outermost call records
//! anything. Separately, the reentrancy flag is raised while the tracker does
//! its own bookkeeping so that allocations made by the tracker itself are
//! never tracked.
//!
//! The entry mark remembers where on the stack the outermost leakhook frame
//! of the current call sits, so captured backtraces can start at its caller.
//!
//! All guards restore their state on drop, so every exit path (including an
//! unwinding `operator new`) leaves the thread in a consistent state.

use std::cell::Cell;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// malloc, calloc, new, new[] and the acquiring side of realloc.
    Alloc = 0,
    /// free, delete, delete[] and the releasing side of realloc.
    Free = 1,
    /// open and fopen.
    Open = 2,
    /// close and fclose.
    Close = 3,
}

thread_local! {
    static DEPTH: [Cell<u32>; 4] = const {
        [Cell::new(0), Cell::new(0), Cell::new(0), Cell::new(0)]
    };

    // Flag used to detect calls made from inside the tracker.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };

    // Address of a local in the outermost marked frame, 0 when unmarked.
    static ENTRY_MARK: Cell<usize> = const { Cell::new(0) };
}

/// Scoped increment of one operation class's depth counter.
#[must_use]
pub struct DepthGuard {
    class: OpClass,
    // Zero when the thread-local was unavailable (thread teardown).
    depth: u32,
}

impl DepthGuard {
    pub fn enter(class: OpClass) -> Self {
        let depth = DEPTH
            .try_with(|depth| {
                let counter = &depth[class as usize];
                let value = counter.get().saturating_add(1);
                counter.set(value);
                value
            })
            .unwrap_or(0);
        DepthGuard { class, depth }
    }

    /// True for the top-level hooked call of this class on this thread.
    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        if self.depth == 0 {
            return;
        }
        // Ignore errors accessing the TLS when the thread is being destroyed.
        let _ = DEPTH.try_with(|depth| {
            let counter = &depth[self.class as usize];
            counter.set(counter.get().saturating_sub(1));
        });
    }
}

/// Raises the reentrancy flag for the current scope.
///
/// Nesting is allowed; the previous value is restored on drop.
#[must_use]
pub struct ReentryGuard {
    previous: bool,
}

impl ReentryGuard {
    pub fn enter() -> Self {
        let previous = IN_TRACKER.try_with(|flag| flag.replace(true)).unwrap_or(true);
        ReentryGuard { previous }
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_TRACKER.try_with(|flag| flag.set(self.previous));
    }
}

/// Whether the current thread is inside tracker bookkeeping.
///
/// A thread whose thread-locals are already gone counts as inside, which
/// makes every proxy on that thread a plain call-through.
pub fn in_tracker() -> bool {
    IN_TRACKER.try_with(Cell::get).unwrap_or(true)
}

/// Marks the calling function as the outermost leakhook frame.
///
/// `anchor` must be a local of the marking function, and that function must
/// never be inlined: every frame the unwinder finds below the anchor, and the
/// marking frame itself, belongs to leakhook. An inner mark while one is
/// already set is a no-op.
#[must_use]
pub struct EntryMark {
    set: bool,
}

impl EntryMark {
    pub fn enter<T>(anchor: &T) -> Self {
        let addr = anchor as *const T as usize;
        let set = ENTRY_MARK
            .try_with(|mark| {
                if mark.get() != 0 {
                    return false;
                }
                mark.set(addr);
                true
            })
            .unwrap_or(false);
        EntryMark { set }
    }
}

impl Drop for EntryMark {
    fn drop(&mut self) {
        if self.set {
            let _ = ENTRY_MARK.try_with(|mark| mark.set(0));
        }
    }
}

/// Stack address recorded by the outermost [`EntryMark`], 0 when none.
pub fn entry_mark() -> usize {
    ENTRY_MARK.try_with(Cell::get).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_entries_are_not_outermost() {
        let outer = DepthGuard::enter(OpClass::Alloc);
        assert!(outer.is_outermost());
        {
            let inner = DepthGuard::enter(OpClass::Alloc);
            assert!(!inner.is_outermost());
            assert_eq!(inner.depth(), 2);

            // Classes are independent.
            let free = DepthGuard::enter(OpClass::Free);
            assert!(free.is_outermost());
        }
        drop(outer);
        assert!(DepthGuard::enter(OpClass::Alloc).is_outermost());
    }

    #[test]
    fn depth_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            let _g = DepthGuard::enter(OpClass::Open);
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(DepthGuard::enter(OpClass::Open).is_outermost());
    }

    #[test]
    fn reentry_guard_nests() {
        assert!(!in_tracker());
        {
            let _outer = ReentryGuard::enter();
            assert!(in_tracker());
            {
                let _inner = ReentryGuard::enter();
                assert!(in_tracker());
            }
            assert!(in_tracker());
        }
        assert!(!in_tracker());
    }

    #[test]
    fn outermost_entry_mark_wins() {
        assert_eq!(entry_mark(), 0);
        let outer_anchor = 0u8;
        let outer = EntryMark::enter(&outer_anchor);
        assert_eq!(entry_mark(), &outer_anchor as *const u8 as usize);
        {
            let inner_anchor = 0u64;
            let _inner = EntryMark::enter(&inner_anchor);
            assert_eq!(entry_mark(), &outer_anchor as *const u8 as usize);
        }
        assert_eq!(entry_mark(), &outer_anchor as *const u8 as usize);
        drop(outer);
        assert_eq!(entry_mark(), 0);
    }

    #[test]
    fn counters_are_per_thread() {
        let _g = DepthGuard::enter(OpClass::Close);
        std::thread::spawn(|| assert!(DepthGuard::enter(OpClass::Close).is_outermost()))
            .join()
            .unwrap();
    }
}
