//! `leakhook` is an in-process leak detector for native code.  It records every heap block
//! and every file descriptor the program acquires, forgets them again when they are released,
//! and reports whatever is still outstanding: as a text report, as JSON listings for tools, or
//! as running statistics.
//!
//! Tracking is done by proxies that sit in front of `malloc`, `calloc`, `realloc`, `free`, the
//! C++ `new`/`delete` operators, and `open`/`open64`/`__open_2`/`close`/`fopen`/`fclose`.  A
//! proxy always performs the real call; whether the call is also recorded depends on the
//! thread's depth counters (only the outermost tracked call counts) and on whether the
//! tracker itself is running on that thread.  The allocation hot path never blocks on tracker
//! locks: if a bucket is contended, the event goes unrecorded instead.
//!
//! ## Using `leakhook` via `LD_PRELOAD`
//!
//! The companion [`lib_leakhook`] crate produces a dynamic library that interposes all tracked
//! symbols.  With `LEAKHOOK_REPORT` set, the leak report is written when the program exits:
//!
//! ```bash
//! LEAKHOOK_BACKTRACE=1 LEAKHOOK_REPORT=leaks.txt LD_PRELOAD=libleakhook.so ./my_program
//! ```
//!
//! The program can also drive the tracker through the `leakhook_*` C functions exported by the
//! same library, or, from Rust, through the functions in [`service`]:
//!
//! ```no_run
//! use leakhook::{service, Config};
//!
//! fn main() -> leakhook::Result<()> {
//!     service::init(&Config::new(false, true))?;
//!     service::hook(&["*"])?;
//!     // ... run the workload ...
//!     println!("{}", service::text_report()?);
//!     service::teardown();
//!     Ok(())
//! }
//! ```
//!
//! ## Viewing leak listings
//!
//! JSON listings (see [`service::leaks_json`] and [`service::aggregated_json`]) saved as
//! `leakhook*.json` can be merged and printed as a call tree with the `lh_print` tool from
//! this crate:
//!
//! ```bash
//! lh_print --dir dumps --threshold 0.5
//! ```
//!
//! where `--threshold` hides call stacks holding less than the given percentage of leaked
//! bytes.

pub mod config;
pub mod error;
pub mod fd;
pub mod guard;
pub mod hook;
pub mod json;
pub mod pool;
pub mod preload;
pub mod profile;
pub mod proxy;
pub mod real;
pub mod record;
pub mod report;
pub mod service;
pub mod stats;
pub mod store;
pub mod symbols;
pub mod tracker;
pub mod unwind;

pub use config::Config;
pub use error::{Error, Result};
pub use fd::{FdLeak, FdStats, FdTracker};
pub use hook::{HookController, HookEngine, HookSymbol, StubHandle, Target, ALL_LIBRARIES};
pub use json::{JsonFormat, RawLeak, StackGroup};
pub use pool::PoolStats;
pub use preload::PreloadEngine;
pub use profile::{LeakProfile, LeakTotals};
pub use record::{Addr, Backtrace};
pub use service::LeakHook;
pub use stats::MemoryStats;
pub use store::StoreStats;
pub use symbols::{ResolvedSymbol, Resolver};
pub use tracker::MemoryTracker;
pub use unwind::Unwinder;
