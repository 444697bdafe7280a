mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use lazy_rs::ops::trace::{self, DispatchContext, DispatchOutcome, DispatchStatus, TraceSink};
use lazy_rs::{DispatchPath, GraphArena, OpKind, RuntimeConfig};
use lazy_rs_backend_ref_cpu::{CpuBackend, CpuBackendOptions};

use common::{arena, cpu_arena, tensor};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(DispatchContext, DispatchStatus)>>,
}

impl RecordingSink {
    fn for_graph(&self, graph_id: u64) -> Vec<(DispatchContext, DispatchStatus)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(context, _)| context.graph_id == graph_id)
            .cloned()
            .collect()
    }
}

impl TraceSink for RecordingSink {
    fn after_dispatch(&self, context: &DispatchContext, outcome: &DispatchOutcome) {
        self.events
            .lock()
            .unwrap()
            .push((context.clone(), outcome.status.clone()));
    }
}

// The sink is process-wide, so every scenario shares one installation.
#[test]
fn sink_observes_every_dispatched_unit() -> Result<()> {
    let sink = Arc::new(RecordingSink::default());
    let _guard = trace::install_sink(sink.clone());

    // Fallback units follow creation order.
    let graph = arena(
        CpuBackend::new(),
        RuntimeConfig::default().compile_enabled(false),
    )?;
    let x = graph.tensor(&tensor(&[2], vec![-1.0, 2.0]))?;
    let _negated = x.neg()?;
    let _absolute = x.abs()?;
    graph.synchronize()?;
    let events = sink.for_graph(graph.id());
    let ops: Vec<Vec<OpKind>> = events.iter().map(|(ctx, _)| ctx.ops.clone()).collect();
    assert_eq!(ops, vec![vec![OpKind::Neg], vec![OpKind::Abs]]);
    for (context, status) in &events {
        assert_eq!(context.path, DispatchPath::Fallback);
        assert_eq!(context.signature, None);
        assert_eq!(context.backend, "cpu");
        assert_eq!(*status, DispatchStatus::Enqueued);
    }
    assert!(events[0].0.trace_id < events[1].0.trace_id);

    // A rejected region reports the demotion, then its members as fallback units.
    let limited = arena(
        CpuBackend::new().with_options(CpuBackendOptions {
            max_compiled_rank: 1,
        }),
        RuntimeConfig::default(),
    )?;
    let m = limited.tensor(&tensor(&[2, 2], vec![0.0; 4]))?;
    let _grown = m.exp()?;
    limited.synchronize()?;
    let events = sink.for_graph(limited.id());
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0.path, DispatchPath::Compiled);
    assert!(events[0].0.signature.is_some());
    assert!(matches!(events[0].1, DispatchStatus::Demoted { .. }));
    assert_eq!(events[1].0.path, DispatchPath::Fallback);
    assert_eq!(events[1].0.ops, vec![OpKind::Exp]);

    // Replaying an identical region hits the cache under the same signature.
    let cached = cpu_arena()?;
    for _ in 0..2 {
        let v = cached.tensor(&tensor(&[3], vec![1.0, 2.0, 3.0]))?;
        let _ = v.mul(&v)?.to_host()?;
    }
    let events = sink.for_graph(cached.id());
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0.signature, events[1].0.signature);
    assert!(events[0].0.signature.is_some());
    assert!(!events[0].0.cache_hit);
    assert!(events[1].0.cache_hit);
    assert!(events
        .iter()
        .all(|(_, status)| *status == DispatchStatus::Enqueued));

    // A sink may consult the traced arena's bookkeeping from inside a callback.
    let observed = cpu_arena()?;
    let inspector = Arc::new(InspectingSink {
        graph: Arc::clone(&observed),
        seen: Mutex::new(Vec::new()),
    });
    {
        let _inner = trace::install_sink(inspector.clone());
        let v = observed.tensor(&tensor(&[2], vec![0.0, 1.0]))?;
        let _ = v.exp()?.clamp(None, Some(2.0))?.to_host()?;
    }
    // The region is tallied in the stats only after its event is reported.
    assert_eq!(*inspector.seen.lock().unwrap(), vec![(1, 0, 1), (2, 1, 1)]);
    Ok(())
}

/// Reads counters, stats, and cache size of the arena it traces.
struct InspectingSink {
    graph: Arc<GraphArena<CpuBackend>>,
    seen: Mutex<Vec<(usize, u64, usize)>>,
}

impl TraceSink for InspectingSink {
    fn after_dispatch(&self, context: &DispatchContext, _outcome: &DispatchOutcome) {
        if context.graph_id != self.graph.id() {
            return;
        }
        let dispatched = self.graph.counters().snapshot().iter().count();
        let regions = self.graph.dispatch_stats().regions_dispatched;
        self.seen
            .lock()
            .unwrap()
            .push((dispatched, regions, self.graph.cached_regions()));
    }
}
