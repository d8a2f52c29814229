//! File-descriptor tracking.
//!
//! Same shape as the memory tracker at a smaller scale: open descriptors are
//! kept in one singly linked list behind one lock, and the open/close depth
//! counters make sure `fopen`'s internal `open` (and `fclose`'s `close`) are
//! not recorded a second time.

use std::{
    ffi::CStr,
    fmt::Write as _,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use libc::{c_int, FILE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    guard::{in_tracker, DepthGuard, OpClass, ReentryGuard},
    report::{self, ReportBuffer},
};

/// Longest stored path, in bytes.
pub const MAX_PATH_LEN: usize = 255;

/// Path recorded when the caller passed none.
pub const UNKNOWN_PATH: &str = "<unknown>";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FdStats {
    pub total_open_count: u64,
    pub total_close_count: u64,
    pub current_open_count: u64,
}

/// One open descriptor as listed in the JSON output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdLeak {
    pub fd: c_int,
    pub path: String,
    pub flags: c_int,
}

struct FdRecord {
    fd: c_int,
    path: String,
    flags: c_int,
    next: Option<Box<FdRecord>>,
}

#[derive(Default)]
struct FdList {
    head: Option<Box<FdRecord>>,
    stats: FdStats,
}

impl FdList {
    fn push(&mut self, fd: c_int, path: String, flags: c_int) {
        let next = self.head.take();
        self.head = Some(Box::new(FdRecord {
            fd,
            path,
            flags,
            next,
        }));
        self.stats.total_open_count += 1;
        self.stats.current_open_count += 1;
    }

    fn remove(&mut self, fd: c_int) -> Option<Box<FdRecord>> {
        let mut link = &mut self.head;
        while link.as_ref().is_some_and(|node| node.fd != fd) {
            link = &mut link.as_mut()?.next;
        }
        let mut node = link.take()?;
        *link = node.next.take();
        self.stats.total_close_count += 1;
        self.stats.current_open_count = self.stats.current_open_count.saturating_sub(1);
        Some(node)
    }

    fn iter(&self) -> impl Iterator<Item = &FdRecord> {
        std::iter::successors(self.head.as_deref(), |r| r.next.as_deref())
    }

    fn clear(&mut self) {
        // Unlink iteratively so long lists cannot overflow the stack on drop.
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
        self.stats = FdStats::default();
    }
}

impl Drop for FdList {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Open flags implied by an `fopen` mode string.
pub fn mode_flags(mode: &str) -> c_int {
    let plus = mode.contains('+');
    if mode.contains('r') {
        if plus {
            libc::O_RDWR
        } else {
            libc::O_RDONLY
        }
    } else if mode.contains('w') || mode.contains('a') {
        if plus {
            libc::O_RDWR
        } else {
            libc::O_WRONLY
        }
    } else {
        0
    }
}

fn stored_path(path: Option<&CStr>) -> String {
    match path {
        None => UNKNOWN_PATH.to_string(),
        Some(p) => {
            let bytes = p.to_bytes();
            String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_PATH_LEN)]).into_owned()
        }
    }
}

#[derive(Default)]
pub struct FdTracker {
    list: Mutex<FdList>,
    debug: AtomicBool,
}

impl FdTracker {
    pub fn new(debug: bool) -> Self {
        FdTracker {
            list: Mutex::new(FdList::default()),
            debug: AtomicBool::new(debug),
        }
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    fn should_record(depth: &DepthGuard) -> bool {
        depth.is_outermost() && !in_tracker()
    }

    fn add(&self, fd: c_int, path: Option<&CStr>, flags: c_int) {
        let _reentry = ReentryGuard::enter();
        let path = stored_path(path);
        if self.is_debug() {
            tracing::debug!("fd opened: fd={}, path={}, flags={:#x}", fd, path, flags);
        }
        self.list.lock().push(fd, path, flags);
    }

    fn remove(&self, fd: c_int) {
        let _reentry = ReentryGuard::enter();
        let removed = self.list.lock().remove(fd);
        if self.is_debug() {
            match removed {
                Some(r) => tracing::debug!("fd closed: fd={}, path={}", fd, r.path),
                None => tracing::debug!("fd closed (not tracked): fd={}", fd),
            }
        }
    }

    /// Run an `open`-like call and record the descriptor it returns.
    pub fn track_open<F>(&self, path: Option<&CStr>, flags: c_int, call: F) -> c_int
    where
        F: FnOnce() -> c_int,
    {
        let depth = DepthGuard::enter(OpClass::Open);
        let fd = call();
        if fd >= 0 && Self::should_record(&depth) {
            self.add(fd, path, flags);
        }
        fd
    }

    /// Forget `fd`, then run the `close` call.
    pub fn track_close<F>(&self, fd: c_int, call: F) -> c_int
    where
        F: FnOnce() -> c_int,
    {
        let depth = DepthGuard::enter(OpClass::Close);
        if Self::should_record(&depth) {
            self.remove(fd);
        }
        call()
    }

    pub fn track_fopen<F>(&self, path: Option<&CStr>, mode: Option<&CStr>, call: F) -> *mut FILE
    where
        F: FnOnce() -> *mut FILE,
    {
        let depth = DepthGuard::enter(OpClass::Open);
        let stream = call();
        if !stream.is_null() && Self::should_record(&depth) {
            // SAFETY: `stream` is a live stream just returned by `fopen`.
            let fd = unsafe { libc::fileno(stream) };
            if fd >= 0 {
                let flags = mode.map_or(0, |m| mode_flags(&m.to_string_lossy()));
                self.add(fd, path, flags);
            }
        }
        stream
    }

    pub fn track_fclose<F>(&self, stream: *mut FILE, call: F) -> c_int
    where
        F: FnOnce() -> c_int,
    {
        let depth = DepthGuard::enter(OpClass::Close);
        if !stream.is_null() && Self::should_record(&depth) {
            // SAFETY: the caller is about to close `stream`, so it is still open.
            let fd = unsafe { libc::fileno(stream) };
            if fd >= 0 {
                self.remove(fd);
            }
        }
        call()
    }

    pub fn stats(&self) -> FdStats {
        self.list.lock().stats
    }

    /// Forget every open descriptor and zero the counters.
    pub fn reset(&self) {
        let _reentry = ReentryGuard::enter();
        self.list.lock().clear();
        tracing::info!("fd tracking state reset");
    }

    pub fn leaks(&self) -> Vec<FdLeak> {
        let _reentry = ReentryGuard::enter();
        self.list
            .lock()
            .iter()
            .map(|r| FdLeak {
                fd: r.fd,
                path: r.path.clone(),
                flags: r.flags,
            })
            .collect()
    }

    pub fn leaks_json(&self) -> Result<String> {
        let _reentry = ReentryGuard::enter();
        Ok(serde_json::to_string(&self.leaks())?)
    }

    pub fn text_report(&self) -> Result<String> {
        let _reentry = ReentryGuard::enter();
        let mut out = ReportBuffer::new()?;
        let list = self.list.lock();
        let stats = list.stats;
        let res = (|| {
            writeln!(out, "=== File Descriptor Leak Report ===")?;
            writeln!(out, "Total opened: {}", stats.total_open_count)?;
            writeln!(out, "Total closed: {}", stats.total_close_count)?;
            writeln!(out, "Currently open: {}", stats.current_open_count)?;
            writeln!(out)?;
            if list.head.is_none() {
                return writeln!(out, "No file descriptor leaks detected.");
            }
            writeln!(out, "Open file descriptors:")?;
            for (i, r) in list.iter().enumerate() {
                writeln!(
                    out,
                    "[{}] FD={}, Path={}, Flags={:#x}",
                    i + 1,
                    r.fd,
                    r.path,
                    r.flags
                )?;
            }
            Ok(())
        })();
        drop(list);
        if res.is_err() {
            tracing::warn!("fd report truncated after {} bytes", out.len());
        }
        Ok(out.into_string())
    }

    pub fn dump_report(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("empty report path".into()));
        }
        let text = self.text_report()?;
        let _reentry = ReentryGuard::enter();
        report::dump_to_file(path, &text)?;
        tracing::info!("fd report dumped to {}", path.display());
        Ok(())
    }
}
