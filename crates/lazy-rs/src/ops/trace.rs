//! Process-wide dispatch tracing hooks.
//!
//! Install a [`TraceSink`] to observe every dispatched unit. Sinks see events from every arena
//! in the process, so filter on [`DispatchContext::graph_id`] when that matters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::counters::DispatchPath;
use crate::ops::registry::OpKind;

static SINK: RwLock<Option<Arc<dyn TraceSink>>> = RwLock::new(None);
static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Describes one dispatched unit: a compiled region or a single fallback node.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub trace_id: u64,
    pub graph_id: u64,
    pub backend: String,
    pub path: DispatchPath,
    pub ops: Vec<OpKind>,
    /// Region signature, `None` for fallback nodes.
    pub signature: Option<u64>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStatus {
    /// Work was handed to the device queue.
    Enqueued,
    /// Compilation failed and the region was re-dispatched node by node.
    Demoted { reason: String },
    Failure { message: String },
}

/// Host-side timing of one unit. Device execution may still be in flight.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub duration: Duration,
    pub status: DispatchStatus,
}

/// Receives dispatch events.
///
/// Callbacks run on the synchronizing thread while the arena's graph lock is held. A sink must
/// not read, record, or synchronize handles of the arena being traced; that deadlocks. The
/// arena's counters, [`DispatchStats`](crate::DispatchStats), and cache size stay readable.
pub trait TraceSink: Send + Sync {
    fn before_dispatch(&self, context: &DispatchContext) {
        let _ = context;
    }

    fn after_dispatch(&self, context: &DispatchContext, outcome: &DispatchOutcome);
}

/// Restores the previously installed sink when dropped.
#[must_use = "the sink is uninstalled when the guard drops"]
pub struct TraceGuard {
    previous: Option<Arc<dyn TraceSink>>,
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        let mut sink = SINK.write().unwrap_or_else(|poison| poison.into_inner());
        *sink = self.previous.take();
    }
}

pub fn install_sink(sink: Arc<dyn TraceSink>) -> TraceGuard {
    let mut slot = SINK.write().unwrap_or_else(|poison| poison.into_inner());
    TraceGuard {
        previous: slot.replace(sink),
    }
}

pub fn current_sink() -> Option<Arc<dyn TraceSink>> {
    SINK.read()
        .unwrap_or_else(|poison| poison.into_inner())
        .clone()
}

pub fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}
