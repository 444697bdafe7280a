//! Synchronization planning over the pending graph.

use std::collections::{BTreeSet, HashMap};

use crate::backend::spec::PortableBackend;
use crate::config::RuntimeConfig;
use crate::dispatch::engine::ScheduledNode;
use crate::dispatch::region::{self, DispatchUnit, PartitionNode, Route};
use crate::error::Result;
use crate::ops::registry::{Classification, OpRegistry};

use super::state::{GraphInner, NodeId, ValueState};

/// Ordered work for one `synchronize` call.
pub(crate) struct Schedule {
    pub(crate) nodes: Vec<ScheduledNode>,
    pub(crate) units: Vec<DispatchUnit>,
}

/// Removes pending nodes whose outputs no live handle can reach. Returns how many were dropped.
pub(crate) fn discard_unreachable<B: PortableBackend + 'static>(inner: &mut GraphInner<B>) -> usize {
    let mut reachable: BTreeSet<NodeId> = BTreeSet::new();
    let mut stack: Vec<NodeId> = inner
        .nodes
        .iter()
        .filter(|(_, node)| {
            node.outputs.iter().any(|value| {
                inner
                    .values
                    .get(value)
                    .is_some_and(|record| record.has_live_handle())
            })
        })
        .map(|(&id, _)| id)
        .collect();
    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(node) = inner.nodes.get(&id) {
            stack.extend(
                node.inputs
                    .iter()
                    .filter_map(|&value| inner.pending_producer(value)),
            );
        }
    }

    // Walk newest first so consumers are detached before their producers.
    let dead: Vec<NodeId> = inner
        .nodes
        .keys()
        .rev()
        .filter(|id| !reachable.contains(id))
        .copied()
        .collect();
    for &id in &dead {
        inner.discard(id);
    }
    dead.len()
}

/// Pending nodes in topological order with creation-sequence tie-break.
///
/// Values can only be consumed after they are created, so ascending creation order already
/// satisfies every dependency.
pub(crate) fn topological_order<B: PortableBackend + 'static>(
    inner: &GraphInner<B>,
) -> Vec<ScheduledNode> {
    let mut nodes: Vec<ScheduledNode> = inner
        .nodes
        .iter()
        .map(|(&id, record)| ScheduledNode {
            id,
            record: record.clone(),
        })
        .collect();
    nodes.sort_by_key(|node| node.record.seq);
    nodes
}

/// Classifies, partitions, and orders the pending graph.
pub(crate) fn plan<B: PortableBackend + 'static>(
    inner: &GraphInner<B>,
    registry: &OpRegistry,
    config: &RuntimeConfig,
) -> Result<Schedule> {
    let nodes = topological_order(inner);
    let position: HashMap<NodeId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id, idx))
        .collect();

    let mut partition_nodes = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let route = match registry.classify(node.record.instruction.op)? {
            Classification::Compiled if config.compile_enabled => Route::Compiled,
            Classification::Compiled | Classification::Fallback => Route::Fallback,
            Classification::Unsupported => Route::Unsupported,
        };
        let mut producers: Vec<usize> = node
            .record
            .inputs
            .iter()
            .filter_map(|&value| inner.pending_producer(value))
            .filter_map(|producer| position.get(&producer).copied())
            .collect();
        producers.dedup();
        partition_nodes.push(PartitionNode {
            seq: node.record.seq,
            route,
            producers,
        });
    }

    let units = region::partition(&partition_nodes, config.max_region_nodes);
    Ok(Schedule { nodes, units })
}

/// Releases realized values that no handle and no pending node refer to.
pub(crate) fn collect_garbage<B: PortableBackend + 'static>(inner: &mut GraphInner<B>) -> usize {
    let before = inner.values.len();
    inner.values.retain(|_, record| match record.state {
        ValueState::Pending => true,
        ValueState::Ready(_) => record.has_live_handle() || !record.consumers.is_empty(),
    });
    before - inner.values.len()
}
