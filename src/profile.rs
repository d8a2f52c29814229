//! Offline view of leak listings.
//!
//! A [`LeakProfile`] folds one or more JSON listings (raw or aggregated)
//! into a trie keyed by call stack, allocation site first. Printing it
//! shows, for every stack prefix, how many leaked blocks and bytes sit
//! underneath it, most bytes first, hiding subtrees below a significance
//! threshold.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    fmt::{Display, Formatter},
};

use num_format::{Locale, ToFormattedString};
use radix_trie::{iter::Children, SubTrie, Trie, TrieCommon, TrieKey};
use serde::Deserialize;

use crate::json::{RawLeak, StackGroup};

// Interned frame labels, allocation site first.
type CallStack = Vec<usize>;

/// Label used for records captured without a backtrace.
pub const NO_BACKTRACE: &str = "<no backtrace>";

/// Leaked blocks and bytes under one stack prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeakTotals {
    pub leaks: u64,
    pub bytes: u64,
}

impl LeakTotals {
    fn merge(&mut self, other: &LeakTotals) {
        self.leaks += other.leaks;
        self.bytes += other.bytes;
    }

    fn format_totals<W: fmt::Write>(&self, f: &mut W) -> Result<(), fmt::Error> {
        write!(
            f,
            "{} leaks, {}B",
            self.leaks.to_formatted_string(&Locale::en),
            self.bytes.to_formatted_string(&Locale::en)
        )
    }
}

impl Display for LeakTotals {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        self.format_totals(f)
    }
}

// Either listing shape. Aggregated entries are tried first; raw entries
// lack `count`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListingEntry {
    Group(StackGroup),
    Leak(RawLeak),
}

#[derive(Debug, Default)]
pub struct LeakProfile {
    callstacks: Trie<CallStack, LeakTotals>,
    frames: Vec<String>,
    frame_ids: HashMap<String, usize>,
}

impl Display for LeakProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        self.fmt_with_threshold(0.0, f)
    }
}

impl LeakProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw or aggregated listing.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let entries: Vec<ListingEntry> = serde_json::from_str(text)?;
        let mut profile = LeakProfile::new();
        for entry in entries {
            match entry {
                ListingEntry::Group(g) => profile.add_stack(&g.backtrace, g.count, g.total_size),
                ListingEntry::Leak(l) => profile.add_stack(&l.backtrace, 1, l.size),
            }
        }
        Ok(profile)
    }

    fn intern(&mut self, frame: &str) -> usize {
        match self.frame_ids.entry(frame.to_string()) {
            Entry::Occupied(oe) => *oe.get(),
            Entry::Vacant(ve) => {
                self.frames.push(frame.to_string());
                *ve.insert(self.frames.len() - 1)
            }
        }
    }

    /// Account `leaks` blocks totalling `bytes` to `backtrace`.
    pub fn add_stack<S: AsRef<str>>(&mut self, backtrace: &[S], leaks: u64, bytes: u64) {
        let mut callstack: CallStack = backtrace.iter().map(|f| self.intern(f.as_ref())).collect();
        if callstack.is_empty() {
            callstack.push(self.intern(NO_BACKTRACE));
        }
        let totals = LeakTotals { leaks, bytes };
        match self.callstacks.get_mut(&callstack) {
            Some(old) => old.merge(&totals),
            None => {
                self.callstacks.insert(callstack, totals);
            }
        }
    }

    /// Merge two profiles.
    pub fn merge(&mut self, other: &LeakProfile) {
        for (callstack, totals) in other.callstacks.iter() {
            let frames: Vec<&str> = callstack
                .iter()
                .map(|id| other.frames[*id].as_str())
                .collect();
            self.add_stack(&frames, totals.leaks, totals.bytes);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.callstacks.is_empty()
    }

    /// Number of distinct call stacks.
    pub fn len(&self) -> usize {
        self.callstacks.len()
    }

    pub fn total(&self) -> LeakTotals {
        let mut total = LeakTotals::default();
        for (_, totals) in self.callstacks.iter() {
            total.merge(totals);
        }
        total
    }

    fn frame_label(&self, id: usize) -> &str {
        self.frames.get(id).map_or("?", String::as_str)
    }

    fn summarize(&self) -> Trie<CallStack, LeakTotals> {
        let mut all_stacks = Trie::new();
        for (callstack, totals) in self.callstacks.iter() {
            all_stacks.insert(callstack.clone(), *totals);
        }
        // Every proper prefix becomes a node of its own.
        for (callstack, _) in self.callstacks.iter() {
            for len in 1..callstack.len() {
                let prefix = Vec::from(&callstack[..len]);
                if all_stacks.get(&prefix).is_none() {
                    all_stacks.insert(prefix, LeakTotals::default());
                }
            }
        }
        let mut summary = Trie::new();
        Self::aggregate_stats(&mut summary, &all_stacks);
        summary
    }

    // Scan the trie, store aggregate totals in each node.
    fn aggregate_stats<'a, T: Clone + TrieCommon<'a, CallStack, LeakTotals>>(
        trie: &mut Trie<CallStack, LeakTotals>,
        node: T,
    ) -> LeakTotals {
        let mut totals = node.clone().value().copied().unwrap_or_default();
        for child in node.clone().children() {
            let child_totals = Self::aggregate_stats(trie, &child);
            totals.merge(&child_totals);
        }
        if let Some(key) = node.key() {
            trie.insert(key.clone(), totals);
        }
        totals
    }

    /// Print the call tree, skipping subtrees holding fewer than
    /// `threshold` percent of all leaked bytes.
    pub fn fmt_with_threshold<W: fmt::Write>(
        &self,
        threshold: f64,
        f: &mut W,
    ) -> Result<(), fmt::Error> {
        let total = self.total();
        f.write_str("Total: ")?;
        total.format_totals(f)?;
        if self.is_empty() {
            return Ok(());
        }
        let summary = self.summarize();
        self.format_summary(&summary, total.bytes, threshold, "", f)
    }

    fn format_summary<'a, T: Clone + TrieCommon<'a, CallStack, LeakTotals>, W: fmt::Write>(
        &self,
        stats: T,
        total_bytes: u64,
        threshold: f64,
        prefix: &str,
        f: &mut W,
    ) -> Result<(), fmt::Error> {
        if let (Some(key), Some(totals)) = (stats.clone().key(), stats.clone().value()) {
            f.write_str("\n")?;
            f.write_str(prefix)?;
            f.write_str("->")?;
            totals.format_totals(f)?;
            f.write_str(": ")?;
            if let Some(frame) = key.last() {
                f.write_str(self.frame_label(*frame))?;
            }
        }

        let mut children_sorted: Vec<_> = trie_children_with_keys(stats).collect();
        let nchildren = children_sorted.len();
        children_sorted.sort_by(|c1, c2| bytes_of(c2).cmp(&bytes_of(c1)));

        let mut below_threshold = LeakTotals::default();
        for (idx, child) in children_sorted.iter().enumerate() {
            let bytes = bytes_of(child);
            if total_bytes > 0 && 100.0 * (bytes as f64) / (total_bytes as f64) < threshold {
                if let Some(totals) = child.value() {
                    below_threshold.merge(totals);
                }
                continue;
            }
            let child_prefix = if idx == nchildren - 1 {
                format!("{}  ", prefix)
            } else {
                format!("{} |", prefix)
            };
            self.format_summary(child, total_bytes, threshold, &child_prefix, f)?;
        }

        if below_threshold.leaks > 0 {
            write!(
                f,
                "\n{}  ->{} in places below lh_print threshold ({}%)",
                prefix, below_threshold, threshold
            )?;
        }

        Ok(())
    }
}

fn bytes_of<K: TrieKey>(node: &SubTrie<'_, K, LeakTotals>) -> u64 {
    node.value().map_or(0, |t| t.bytes)
}

// Iterate through the nearest descendants that have keys.
struct ChildrenWithKey<'a, K, V> {
    stack: Vec<Children<'a, K, V>>,
}

impl<'a, K, V> ChildrenWithKey<'a, K, V> {
    fn new<T>(trie: T) -> Self
    where
        T: TrieCommon<'a, K, V>,
        K: TrieKey,
    {
        ChildrenWithKey {
            stack: vec![trie.children()],
        }
    }
}

impl<'a, K, V> Iterator for ChildrenWithKey<'a, K, V>
where
    K: TrieKey,
{
    type Item = SubTrie<'a, K, V>;

    fn next(&mut self) -> Option<SubTrie<'a, K, V>> {
        loop {
            let child = match self.stack.last_mut()?.next() {
                Some(child) => child,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            if child.key().is_some() {
                return Some(child);
            }
            self.stack.push(child.children());
        }
    }
}

fn trie_children_with_keys<'a, K, V, T>(trie: T) -> ChildrenWithKey<'a, K, V>
where
    T: Clone + TrieCommon<'a, K, V>,
    K: TrieKey,
{
    ChildrenWithKey::new(trie)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"[
        {"ptr":"0x1000","size":64,"backtrace":["alloc_buffer+8","parse+12","main+4"]},
        {"ptr":"0x2000","size":64,"backtrace":["alloc_buffer+8","parse+12","main+4"]},
        {"ptr":"0x3000","size":32,"backtrace":["alloc_buffer+8","load+2","main+4"]},
        {"ptr":"0x4000","size":8,"backtrace":[]}
    ]"#;

    const AGGREGATED: &str = r#"[
        {"count":3,"totalSize":300,"backtrace":["make_node+1","main+4"]}
    ]"#;

    #[test]
    fn raw_listing_totals() {
        let profile = LeakProfile::from_json(RAW).unwrap();
        assert_eq!(profile.len(), 3);
        assert_eq!(
            profile.total(),
            LeakTotals {
                leaks: 4,
                bytes: 168
            }
        );
    }

    #[test]
    fn merged_listings() {
        let mut profile = LeakProfile::from_json(RAW).unwrap();
        profile.merge(&LeakProfile::from_json(AGGREGATED).unwrap());
        profile.merge(&LeakProfile::from_json(AGGREGATED).unwrap());
        assert_eq!(profile.len(), 4);
        assert_eq!(profile.total().leaks, 10);
        assert_eq!(profile.total().bytes, 768);
    }

    #[test]
    fn tree_groups_by_prefix() {
        let profile = LeakProfile::from_json(RAW).unwrap();
        let text = profile.to_string();
        assert!(text.starts_with("Total: 4 leaks, 168B"));
        assert!(text.contains("->3 leaks, 160B: alloc_buffer+8"));
        assert!(text.contains("->2 leaks, 128B: parse+12"));
        assert!(text.contains("->1 leaks, 32B: load+2"));
        assert!(text.contains(NO_BACKTRACE));
        // Larger subtree first.
        assert!(text.find("parse+12").unwrap() < text.find("load+2").unwrap());
    }

    #[test]
    fn threshold_hides_small_subtrees() {
        let profile = LeakProfile::from_json(RAW).unwrap();
        let mut text = String::new();
        profile.fmt_with_threshold(10.0, &mut text).unwrap();
        assert!(!text.contains(NO_BACKTRACE));
        assert!(text.contains("->1 leaks, 8B in places below lh_print threshold (10%)"));
    }

    #[test]
    fn large_numbers_use_separators() {
        let mut profile = LeakProfile::new();
        profile.add_stack(&["f"], 1200, 1_234_567);
        assert!(profile.to_string().contains("1,200 leaks, 1,234,567B"));
    }

    #[test]
    fn rejects_other_documents() {
        assert!(LeakProfile::from_json(r#"{"totalAllocCount":1}"#).is_err());
        assert!(LeakProfile::from_json(r#"[{"fd":3}]"#).is_err());
    }
}
