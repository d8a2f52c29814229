//! Call-stack capture.

use std::ffi::c_void;

use crate::{guard::entry_mark, symbols::object_base};

/// Source of return addresses for the current thread.
pub trait Unwinder: Send + Sync {
    /// Fill `frames` with return addresses, innermost first, and return how
    /// many were written.
    fn capture(&self, frames: &mut [usize]) -> usize;
}

/// DWARF unwinding through the `backtrace` crate.
///
/// Leakhook's own frames are left out. Frames below the current
/// [`EntryMark`](crate::guard::EntryMark), and the marking frame itself, are
/// dropped by stack address. When leakhook lives in its own shared object
/// (the preload case), leading frames inside that object are dropped as well,
/// which covers the exported wrappers above the mark.
#[derive(Clone, Copy, Debug)]
pub struct BacktraceUnwinder {
    own_object: Option<usize>,
}

impl BacktraceUnwinder {
    pub fn new() -> Self {
        BacktraceUnwinder {
            own_object: separate_object(),
        }
    }
}

impl Default for BacktraceUnwinder {
    fn default() -> Self {
        Self::new()
    }
}

// Load address of the object holding this code, unless it is the main program.
fn separate_object() -> Option<usize> {
    let own = object_base(separate_object as *const () as usize)?;
    // SAFETY: `getauxval` only reads the auxiliary vector.
    let phdr = unsafe { libc::getauxval(libc::AT_PHDR) } as usize;
    let exe = object_base(phdr);
    (exe != Some(own)).then(|| own)
}

impl Unwinder for BacktraceUnwinder {
    fn capture(&self, frames: &mut [usize]) -> usize {
        let mark = entry_mark();
        let mut below_mark = mark != 0;
        let mut in_own_object = self.own_object.is_some();
        let mut len = 0;
        // SAFETY: callers are serialized per thread and the closure does not
        // allocate, so the unsynchronized walk cannot re-enter itself.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if len >= frames.len() {
                    return false;
                }
                let ip = frame.ip() as usize;
                if ip == 0 {
                    return false;
                }
                if below_mark {
                    // `sp` is the frame's CFA, above all of its locals.
                    let sp = frame.sp() as usize;
                    if sp != 0 && sp <= mark {
                        return true;
                    }
                    below_mark = false;
                    if sp != 0 {
                        return true;
                    }
                }
                if in_own_object {
                    if object_base(ip) == self.own_object {
                        return true;
                    }
                    in_own_object = false;
                }
                frames[len] = ip;
                len += 1;
                true
            });
        }
        len
    }
}

/// An unwinder that never captures anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoUnwinder;

impl Unwinder for NoUnwinder {
    fn capture(&self, _frames: &mut [usize]) -> usize {
        0
    }
}

pub(crate) fn ip_ptr(ip: usize) -> *mut c_void {
    ip as *mut c_void
}
