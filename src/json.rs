//! Machine-readable leak listings.
//!
//! Two shapes are produced, both JSON arrays:
//!
//! * raw: one `{"ptr", "size", "backtrace"}` object per live record;
//! * aggregated: one `{"count", "totalSize", "backtrace"}` object per distinct
//!   call stack, largest cumulative size first.
//!
//! Frames are rendered as `symbol+offset`, or as the hex address when the
//! frame cannot be resolved.

use std::{collections::HashMap, io::Write as _, ops::ControlFlow};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    record::Backtrace,
    report::{ReportBuffer, Symbolizer},
    store::RecordStore,
    symbols::frame_label,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLeak {
    pub ptr: String,
    pub size: u64,
    pub backtrace: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackGroup {
    pub count: u64,
    pub total_size: u64,
    pub backtrace: Vec<String>,
}

/// Which JSON listing to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonFormat {
    Raw,
    Aggregated,
}

fn labels(backtrace: &Backtrace, symbols: &Symbolizer<'_>) -> Vec<String> {
    backtrace
        .frames()
        .iter()
        .map(|ip| frame_label(*ip, symbols.cache.resolve_with(*ip, symbols.resolver)))
        .collect()
}

fn check(out: &ReportBuffer, res: serde_json::Result<()>) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(_) if out.is_exhausted() => Err(Error::OutOfMemory),
        Err(e) => Err(e.into()),
    }
}

fn push(out: &mut ReportBuffer, s: &[u8]) -> Result<()> {
    out.write_all(s).map_err(|_| Error::OutOfMemory)
}

/// Stream every live record into `out`. Returns the number of entries.
pub fn write_raw(out: &mut ReportBuffer, store: &RecordStore, symbols: &Symbolizer<'_>) -> Result<usize> {
    push(out, b"[")?;
    let mut count = 0;
    let mut result = Ok(());
    store.for_each(|record| {
        let entry = RawLeak {
            ptr: record.addr().to_string(),
            size: record.size() as u64,
            backtrace: labels(record.backtrace(), symbols),
        };
        result = (if count > 0 { push(out, b",") } else { Ok(()) }).and_then(|()| {
            let res = serde_json::to_writer(&mut *out, &entry);
            check(out, res)
        });
        if result.is_err() {
            return ControlFlow::Break(());
        }
        count += 1;
        ControlFlow::Continue(())
    });
    result?;
    push(out, b"]")?;
    Ok(count)
}

/// Group live records by identical call stack, largest total size first.
///
/// Groups with equal totals keep their first-seen order.
pub fn aggregate(store: &RecordStore) -> Vec<(Backtrace, u64, u64)> {
    let mut index: HashMap<Backtrace, usize> = HashMap::new();
    let mut groups: Vec<(Backtrace, u64, u64)> = Vec::new();
    store.for_each(|record| {
        let bt = *record.backtrace();
        let slot = *index.entry(bt).or_insert_with(|| {
            groups.push((bt, 0, 0));
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.1 += 1;
        group.2 += record.size() as u64;
        ControlFlow::Continue(())
    });
    groups.sort_by(|a, b| b.2.cmp(&a.2));
    groups
}

/// Write the aggregated listing. Returns the number of groups.
pub fn write_aggregated(
    out: &mut ReportBuffer,
    store: &RecordStore,
    symbols: &Symbolizer<'_>,
) -> Result<usize> {
    let groups = aggregate(store);
    push(out, b"[")?;
    for (i, (bt, count, total_size)) in groups.iter().enumerate() {
        if i > 0 {
            push(out, b",")?;
        }
        let group = StackGroup {
            count: *count,
            total_size: *total_size,
            backtrace: labels(bt, symbols),
        };
        let res = serde_json::to_writer(&mut *out, &group);
        check(out, res)?;
    }
    push(out, b"]")?;
    Ok(groups.len())
}
