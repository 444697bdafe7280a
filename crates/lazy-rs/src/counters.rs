//! Dispatch accounting.
//!
//! Every dispatched node increments exactly one counter keyed by the path it took and its
//! operation identity. Callers use snapshots to verify routing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::ops::registry::OpKind;

/// Execution path a node took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPath {
    Compiled,
    Fallback,
}

impl DispatchPath {
    pub fn name(self) -> &'static str {
        match self {
            DispatchPath::Compiled => "compiled",
            DispatchPath::Fallback => "fallback",
        }
    }
}

impl fmt::Display for DispatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Formats the snapshot key for `(path, op)`, e.g. `"fallback::clamp"`.
pub fn counter_key(path: DispatchPath, op: OpKind) -> String {
    format!("{}::{}", path.name(), op.name())
}

/// Shared counter table. Pass it around as `Arc<CounterRegistry>`.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counts: Mutex<HashMap<(DispatchPath, OpKind), u64>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, path: DispatchPath, op: OpKind) {
        let mut counts = self.counts.lock().expect("counter registry poisoned");
        *counts.entry((path, op)).or_insert(0) += 1;
    }

    pub fn get(&self, path: DispatchPath, op: OpKind) -> u64 {
        let counts = self.counts.lock().expect("counter registry poisoned");
        counts.get(&(path, op)).copied().unwrap_or(0)
    }

    /// Point-in-time copy of every non-zero counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        let counts = self.counts.lock().expect("counter registry poisoned");
        let entries = counts
            .iter()
            .map(|(&(path, op), &count)| (counter_key(path, op), count))
            .collect();
        CounterSnapshot { entries }
    }

    /// Clears every counter.
    pub fn reset(&self) {
        let mut counts = self.counts.lock().expect("counter registry poisoned");
        counts.clear();
    }
}

/// Immutable view of the counters, keyed by `"<path>::<op>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CounterSnapshot {
    entries: BTreeMap<String, u64>,
}

impl CounterSnapshot {
    /// Count for `key`; absent keys read as zero.
    pub fn get(&self, key: &str) -> u64 {
        self.entries.get(key).copied().unwrap_or(0)
    }

    pub fn count(&self, path: DispatchPath, op: OpKind) -> u64 {
        self.get(&counter_key(path, op))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(key, &count)| (key.as_str(), count))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters that grew since `earlier`, with their increase.
    pub fn delta_since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        let entries = self
            .entries
            .iter()
            .filter_map(|(key, &count)| {
                let delta = count.saturating_sub(earlier.get(key));
                (delta > 0).then(|| (key.clone(), delta))
            })
            .collect();
        CounterSnapshot { entries }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
