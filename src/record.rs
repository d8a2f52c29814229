//! Allocation records and the identities they are keyed by.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// Frames kept per allocation.
pub const MAX_FRAMES: usize = 16;

/// Address of a tracked block.
///
/// The tracker never dereferences a tracked address; it only hashes and
/// compares it, so it is kept as a plain integer rather than a pointer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(usize);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub const fn new(addr: usize) -> Self {
        Addr(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Addr(ptr as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Return addresses captured at allocation time, innermost first.
#[derive(Clone, Copy)]
pub struct Backtrace {
    frames: [usize; MAX_FRAMES],
    len: u8,
}

impl Backtrace {
    pub const EMPTY: Backtrace = Backtrace {
        frames: [0; MAX_FRAMES],
        len: 0,
    };

    /// Copy up to [`MAX_FRAMES`] frames.
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut bt = Backtrace::EMPTY;
        let len = frames.len().min(MAX_FRAMES);
        bt.frames[..len].copy_from_slice(&frames[..len]);
        bt.len = len as u8;
        bt
    }

    /// Fill the frame buffer with `capture` and keep as many frames as it reports.
    pub(crate) fn capture_with<F>(capture: F) -> Self
    where
        F: FnOnce(&mut [usize]) -> usize,
    {
        let mut bt = Backtrace::EMPTY;
        let len = capture(&mut bt.frames).min(MAX_FRAMES);
        bt.len = len as u8;
        bt
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Backtrace {
    fn default() -> Self {
        Backtrace::EMPTY
    }
}

impl PartialEq for Backtrace {
    fn eq(&self, other: &Self) -> bool {
        self.frames() == other.frames()
    }
}

impl Eq for Backtrace {}

// Only the captured prefix takes part in equality, so only it is hashed.
impl Hash for Backtrace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frames().hash(state);
    }
}

impl fmt::Debug for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| Addr(*ip)))
            .finish()
    }
}

/// One live allocation.
///
/// Records are handed out by the [`RecordPool`](crate::pool::RecordPool) and
/// linked into a [`RecordStore`](crate::store::RecordStore) bucket; they are
/// moved between the two by pointer and never copied.
#[derive(Debug)]
pub struct AllocRecord {
    pub(crate) addr: Addr,
    pub(crate) size: usize,
    pub(crate) backtrace: Backtrace,
    pub(crate) next: *mut AllocRecord,
}

impl AllocRecord {
    pub(crate) fn new(addr: Addr, size: usize, backtrace: Backtrace) -> Self {
        AllocRecord {
            addr,
            size,
            backtrace,
            next: std::ptr::null_mut(),
        }
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}
