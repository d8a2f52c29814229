//! Human-readable leak reports.

use std::{
    fmt,
    fs::OpenOptions,
    io::{self, Write as _},
    ops::ControlFlow,
    path::Path,
};

use crate::{
    error::{Error, Result},
    record::{Addr, AllocRecord},
    stats::MemoryStats,
    store::RecordStore,
    symbols::{Resolver, SymbolCache},
};

/// Initial capacity of a report buffer.
pub const INITIAL_REPORT_CAPACITY: usize = 4096;

/// Growable output buffer for reports.
///
/// Capacity doubles whenever a write would not fit. Growth is fallible: when
/// the allocator refuses, the write fails, the buffer keeps everything
/// written so far, and [`ReportBuffer::is_exhausted`] turns true.
#[derive(Debug)]
pub struct ReportBuffer {
    bytes: Vec<u8>,
    exhausted: bool,
}

impl ReportBuffer {
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(ReportBuffer {
            bytes,
            exhausted: false,
        })
    }

    pub fn new() -> Result<Self> {
        Self::with_capacity(INITIAL_REPORT_CAPACITY)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn push(&mut self, data: &[u8]) -> bool {
        if self.exhausted {
            return false;
        }
        let needed = self.bytes.len() + data.len();
        if needed > self.bytes.capacity() {
            let mut capacity = self.bytes.capacity().max(1);
            while capacity < needed {
                capacity *= 2;
            }
            if self
                .bytes
                .try_reserve_exact(capacity - self.bytes.len())
                .is_err()
            {
                self.exhausted = true;
                return false;
            }
        }
        self.bytes.extend_from_slice(data);
        true
    }

    pub fn as_str(&self) -> &str {
        // Only `str` data and serde_json output are ever pushed.
        std::str::from_utf8(&self.bytes).unwrap_or_default()
    }

    pub fn into_string(self) -> String {
        String::from_utf8(self.bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }
}

impl fmt::Write for ReportBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.push(s.as_bytes()) {
            Ok(())
        } else {
            Err(fmt::Error)
        }
    }
}

impl io::Write for ReportBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.push(buf) {
            Ok(buf.len())
        } else {
            Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "report buffer exhausted",
            ))
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Everything a report needs to turn frames into names.
pub struct Symbolizer<'a> {
    pub cache: &'a SymbolCache,
    pub resolver: &'a dyn Resolver,
}

pub fn write_header<W: fmt::Write>(out: &mut W, stats: &MemoryStats) -> fmt::Result {
    writeln!(out, "=== Memory Leak Report ===")?;
    writeln!(
        out,
        "Total Allocations: {} ({} bytes)",
        stats.total_alloc_count, stats.total_alloc_size
    )?;
    writeln!(
        out,
        "Total Frees: {} ({} bytes)",
        stats.total_free_count, stats.total_free_size
    )?;
    writeln!(
        out,
        "Current Leaks: {} ({} bytes)",
        stats.current_alloc_count, stats.current_alloc_size
    )?;
    writeln!(out)
}

fn write_leak<W: fmt::Write>(
    out: &mut W,
    index: usize,
    record: &AllocRecord,
    symbols: &Symbolizer<'_>,
) -> fmt::Result {
    writeln!(
        out,
        "Leak #{}: ptr={}, size={}",
        index,
        record.addr(),
        record.size()
    )?;
    let frames = record.backtrace().frames();
    if frames.is_empty() {
        return Ok(());
    }
    writeln!(out, "  Backtrace ({} frames):", frames.len())?;
    for (i, ip) in frames.iter().enumerate() {
        match symbols.cache.resolve_with(*ip, symbols.resolver) {
            Some(sym) => writeln!(
                out,
                "    #{}: {} {}+{} ({})",
                i,
                Addr::new(*ip),
                sym.name,
                sym.offset,
                sym.library.as_deref().unwrap_or("?")
            )?,
            None => writeln!(out, "    #{}: {}", i, Addr::new(*ip))?,
        }
    }
    Ok(())
}

/// Write the header and up to `max_leaks` leak entries.
///
/// Returns the number of entries written. Stops at the first failed write,
/// leaving the output as far as it got.
pub fn write_text_report(
    out: &mut ReportBuffer,
    stats: &MemoryStats,
    store: &RecordStore,
    symbols: &Symbolizer<'_>,
    max_leaks: usize,
) -> std::result::Result<usize, fmt::Error> {
    write_header(out, stats)?;

    let mut written = 0;
    let mut failed = false;
    store.for_each(|record| {
        if written >= max_leaks {
            return ControlFlow::Break(());
        }
        if write_leak(out, written + 1, record, symbols).is_err() {
            failed = true;
            return ControlFlow::Break(());
        }
        written += 1;
        ControlFlow::Continue(())
    });
    if failed {
        Err(fmt::Error)
    } else {
        Ok(written)
    }
}

/// Write `contents` to `path`, replacing whatever was there.
pub fn dump_to_file(path: &Path, contents: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("empty report path".into()));
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pool::RecordPool,
        real::RawAlloc,
        record::Backtrace,
        symbols::ResolvedSymbol,
    };

    struct EvenResolver;

    impl Resolver for EvenResolver {
        fn resolve(&self, addr: usize) -> Option<ResolvedSymbol> {
            (addr % 2 == 0).then(|| ResolvedSymbol {
                name: "do_work".into(),
                offset: 16,
                library: Some("libapp.so".into()),
            })
        }
    }

    fn add(pool: &RecordPool, store: &RecordStore, addr: usize, size: usize, frames: &[usize]) {
        let slot = pool.alloc_record().unwrap();
        unsafe {
            slot.as_ptr().write(AllocRecord::new(
                Addr::new(addr),
                size,
                Backtrace::from_frames(frames),
            ));
            store.add(slot).unwrap();
        }
    }

    #[test]
    fn buffer_doubles_and_keeps_contents() {
        let mut buf = ReportBuffer::with_capacity(8).unwrap();
        fmt::Write::write_str(&mut buf, "0123456").unwrap();
        fmt::Write::write_fmt(&mut buf, format_args!("{}", 789)).unwrap();
        assert!(buf.capacity() >= 16);
        io::Write::write_all(&mut buf, "x".repeat(100).as_bytes()).unwrap();
        assert!(buf.as_str().starts_with("0123456789x"));
        assert_eq!(buf.len(), 110);
        assert!(!buf.is_exhausted());
    }

    #[test]
    fn report_layout() {
        let pool = RecordPool::new(RawAlloc::real());
        let store = RecordStore::new();
        add(&pool, &store, 0x1000, 64, &[0x400010, 0x400021]);

        let stats = MemoryStats {
            total_alloc_count: 3,
            total_alloc_size: 192,
            total_free_count: 2,
            total_free_size: 128,
            current_alloc_count: 1,
            current_alloc_size: 64,
        };
        let cache = SymbolCache::new();
        let symbols = Symbolizer {
            cache: &cache,
            resolver: &EvenResolver,
        };
        let mut buf = ReportBuffer::new().unwrap();
        assert_eq!(write_text_report(&mut buf, &stats, &store, &symbols, 100), Ok(1));
        assert_eq!(
            buf.into_string(),
            "=== Memory Leak Report ===\n\
             Total Allocations: 3 (192 bytes)\n\
             Total Frees: 2 (128 bytes)\n\
             Current Leaks: 1 (64 bytes)\n\
             \n\
             Leak #1: ptr=0x1000, size=64\n\
             \x20 Backtrace (2 frames):\n\
             \x20   #0: 0x400010 do_work+16 (libapp.so)\n\
             \x20   #1: 0x400021\n"
        );
    }

    #[test]
    fn report_honours_leak_limit() {
        let pool = RecordPool::new(RawAlloc::real());
        let store = RecordStore::new();
        for i in 1..=10 {
            add(&pool, &store, i * 0x100, i, &[]);
        }
        let cache = SymbolCache::new();
        let symbols = Symbolizer {
            cache: &cache,
            resolver: &EvenResolver,
        };
        let mut buf = ReportBuffer::new().unwrap();
        let written =
            write_text_report(&mut buf, &MemoryStats::default(), &store, &symbols, 3).unwrap();
        assert_eq!(written, 3);
        assert_eq!(buf.as_str().matches("Leak #").count(), 3);
        assert!(!buf.as_str().contains("Backtrace"));
    }

    #[test]
    fn dump_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaks.txt");
        std::fs::write(&path, "x".repeat(1000)).unwrap();
        dump_to_file(&path, "short").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "short");
    }

    #[test]
    fn dump_rejects_bad_paths() {
        assert!(matches!(
            dump_to_file(Path::new(""), "x"),
            Err(Error::InvalidArgument(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir/leaks.txt");
        assert!(matches!(dump_to_file(&missing, "x"), Err(Error::Io(_))));
    }
}
