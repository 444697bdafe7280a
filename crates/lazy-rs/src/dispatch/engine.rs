//! Lowering of dispatch units onto the device queue.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, trace, warn};
use lru::LruCache;
use serde::Serialize;

use crate::backend::spec::{
    BackendResult, CompiledRegion, Instruction, PortableBackend, RegionDescription, RegionNode,
    RegionOperand, ValueId,
};
use crate::counters::{CounterRegistry, DispatchPath};
use crate::error::{Result, RuntimeError};
use crate::ops::graph::state::{GraphInner, NodeId, NodeRecord, ValueSlot};
use crate::ops::graph::timing;
use crate::ops::registry::OpKind;
use crate::ops::trace::{self, DispatchContext, DispatchOutcome, DispatchStatus, TraceSink};
use crate::runtime::{panic_message, DeviceFuture, DeviceQueue, Job, Promise};
use crate::tensor::Shape;

use super::region::DispatchUnit;

/// Aggregate dispatch statistics of one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Compiled regions handed to the device queue.
    pub regions_dispatched: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Regions whose compilation failed and that ran node by node instead.
    pub demotions: u64,
}

/// Pending node selected for dispatch, detached from the graph lock's borrow.
#[derive(Debug, Clone)]
pub(crate) struct ScheduledNode {
    pub(crate) id: NodeId,
    pub(crate) record: NodeRecord,
}

enum CacheEntry<H> {
    Compiled(Arc<dyn CompiledRegion<H>>),
    Rejected(String),
}

impl<H> Clone for CacheEntry<H> {
    fn clone(&self) -> Self {
        match self {
            CacheEntry::Compiled(region) => CacheEntry::Compiled(Arc::clone(region)),
            CacheEntry::Rejected(reason) => CacheEntry::Rejected(reason.clone()),
        }
    }
}

/// Routes units to the compiled or fallback path and accounts for every node it runs.
pub(crate) struct DispatchEngine<B: PortableBackend + 'static> {
    backend: Arc<B>,
    counters: Arc<CounterRegistry>,
    queue: Arc<dyn DeviceQueue>,
    cache: Mutex<LruCache<u64, CacheEntry<B::TensorHandle>>>,
    stats: Mutex<DispatchStats>,
    graph_id: u64,
}

impl<B: PortableBackend + 'static> DispatchEngine<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        counters: Arc<CounterRegistry>,
        queue: Arc<dyn DeviceQueue>,
        cache_capacity: usize,
        graph_id: u64,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        DispatchEngine {
            backend,
            counters,
            queue,
            cache: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(DispatchStats::default()),
            graph_id,
        }
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        *self.stats.lock().expect("dispatch stats poisoned")
    }

    pub(crate) fn cached_regions(&self) -> usize {
        self.cache.lock().expect("region cache poisoned").len()
    }

    /// Dispatches one unit. On success every member node is retired from the pending graph;
    /// on failure the unit's nodes stay pending.
    pub(crate) fn dispatch(
        &self,
        inner: &mut GraphInner<B>,
        nodes: &[ScheduledNode],
        unit: &DispatchUnit,
        outstanding: &mut Vec<DeviceFuture>,
    ) -> Result<()> {
        match unit {
            DispatchUnit::Unsupported(idx) => {
                let op = nodes[*idx].record.instruction.op;
                warn!("graph {}: `{op}` has no lowering on any path", self.graph_id);
                Err(RuntimeError::UnsupportedOperation { op })
            }
            DispatchUnit::Fallback(idx) => self.dispatch_fallback(inner, &nodes[*idx], outstanding),
            DispatchUnit::Region(members) => {
                let members: Vec<&ScheduledNode> = members.iter().map(|&idx| &nodes[idx]).collect();
                self.dispatch_region(inner, &members, outstanding)
            }
        }
    }

    fn dispatch_fallback(
        &self,
        inner: &mut GraphInner<B>,
        node: &ScheduledNode,
        outstanding: &mut Vec<DeviceFuture>,
    ) -> Result<()> {
        let instruction = node.record.instruction.clone();
        let op = instruction.op;
        let inputs = node
            .record
            .inputs
            .iter()
            .map(|&value| inner.ready_slot(value))
            .collect::<Result<Vec<_>>>()?;
        let outputs: Vec<ValueSlot<B::TensorHandle>> =
            node.record.outputs.iter().map(|_| Promise::new()).collect();

        let sink = trace::current_sink();
        let context = self.context(DispatchPath::Fallback, vec![op], None, false);
        if let Some(sink) = &sink {
            sink.before_dispatch(&context);
        }
        let start = Instant::now();

        let job: Job = {
            let backend = Arc::clone(&self.backend);
            let counters = Arc::clone(&self.counters);
            let outputs = outputs.clone();
            Box::new(move || -> Result<()> {
                let handles = match await_inputs(&inputs) {
                    Ok(handles) => handles,
                    Err(err) => return fail(&outputs, upstream_failure(op, &err)),
                };
                let produced = guard_kernel(op, input_shapes(&instruction), || {
                    backend.execute_instruction(&instruction, &handles)
                })
                .and_then(|produced| {
                    expect_outputs(op, input_shapes(&instruction), produced, outputs.len())
                });
                match produced {
                    Ok(produced) => {
                        counters.increment(DispatchPath::Fallback, op);
                        publish(&outputs, produced);
                        Ok(())
                    }
                    Err(err) => fail(&outputs, err),
                }
            })
        };

        trace!("graph {}: fallback `{op}`", self.graph_id);
        let future = self.queue.enqueue(job);
        self.settle(future, outstanding, sink.as_deref(), &context, start)?;
        inner.retire(node.id, outputs);
        Ok(())
    }

    fn dispatch_region(
        &self,
        inner: &mut GraphInner<B>,
        members: &[&ScheduledNode],
        outstanding: &mut Vec<DeviceFuture>,
    ) -> Result<()> {
        let (description, external) = describe_region(members);
        let ops = description.ops();
        let sink = trace::current_sink();

        let (entry, signature, cache_hit) = match description.signature() {
            Ok(signature) => {
                let (entry, cache_hit) = self.lookup_or_compile(signature, &description);
                (entry, Some(signature), cache_hit)
            }
            Err(err) => (CacheEntry::Rejected(err.to_string()), None, false),
        };
        let context = self.context(DispatchPath::Compiled, ops.clone(), signature, cache_hit);
        if let Some(sink) = &sink {
            sink.before_dispatch(&context);
        }
        let start = Instant::now();

        let region = match entry {
            CacheEntry::Compiled(region) => region,
            CacheEntry::Rejected(reason) => {
                let failure = RuntimeError::CompilationFailure { reason };
                warn!(
                    "graph {}: {failure}; demoting {} node(s) to fallback",
                    self.graph_id,
                    members.len()
                );
                self.stats.lock().expect("dispatch stats poisoned").demotions += 1;
                if let Some(sink) = &sink {
                    sink.after_dispatch(
                        &context,
                        &DispatchOutcome {
                            duration: start.elapsed(),
                            status: DispatchStatus::Demoted {
                                reason: failure.to_string(),
                            },
                        },
                    );
                }
                for node in members {
                    self.dispatch_fallback(inner, node, outstanding)?;
                }
                return Ok(());
            }
        };

        let inputs = external
            .iter()
            .map(|&value| inner.ready_slot(value))
            .collect::<Result<Vec<_>>>()?;
        let per_node: Vec<Vec<ValueSlot<B::TensorHandle>>> = members
            .iter()
            .map(|node| node.record.outputs.iter().map(|_| Promise::new()).collect())
            .collect();
        let flat: Vec<ValueSlot<B::TensorHandle>> = per_node.iter().flatten().cloned().collect();
        let shapes: Vec<Shape> = description
            .inputs
            .iter()
            .map(|spec| spec.shape.clone())
            .collect();

        let job: Job = {
            let counters = Arc::clone(&self.counters);
            let ops = ops.clone();
            Box::new(move || -> Result<()> {
                let lead = ops[0];
                let handles = match await_inputs(&inputs) {
                    Ok(handles) => handles,
                    Err(err) => return fail(&flat, upstream_failure(lead, &err)),
                };
                let produced = guard_kernel(lead, shapes.clone(), || region.run(&handles))
                    .and_then(|produced| expect_outputs(lead, shapes.clone(), produced, flat.len()));
                match produced {
                    Ok(produced) => {
                        for op in &ops {
                            counters.increment(DispatchPath::Compiled, *op);
                        }
                        publish(&flat, produced);
                        Ok(())
                    }
                    Err(err) => fail(&flat, err),
                }
            })
        };

        debug!(
            "graph {}: compiled region {:016x} with {} node(s), cache_hit={cache_hit}",
            self.graph_id,
            signature.unwrap_or_default(),
            members.len()
        );
        let future = self.queue.enqueue(job);
        self.settle(future, outstanding, sink.as_deref(), &context, start)?;
        for (node, slots) in members.iter().zip(per_node) {
            inner.retire(node.id, slots);
        }
        self.stats.lock().expect("dispatch stats poisoned").regions_dispatched += 1;
        Ok(())
    }

    fn lookup_or_compile(
        &self,
        signature: u64,
        description: &RegionDescription,
    ) -> (CacheEntry<B::TensorHandle>, bool) {
        if let Some(entry) = self
            .cache
            .lock()
            .expect("region cache poisoned")
            .get(&signature)
            .cloned()
        {
            self.stats.lock().expect("dispatch stats poisoned").cache_hits += 1;
            return (entry, true);
        }
        self.stats.lock().expect("dispatch stats poisoned").cache_misses += 1;

        let start = Instant::now();
        let entry = match self.backend.compile_region(description) {
            Ok(region) => CacheEntry::Compiled(region),
            Err(err) => CacheEntry::Rejected(err.to_string()),
        };
        timing::record_compile(start.elapsed());
        self.cache
            .lock()
            .expect("region cache poisoned")
            .put(signature, entry.clone());
        (entry, false)
    }

    /// Completes bookkeeping for an enqueued job. Synchronous queues surface kernel failures here.
    fn settle(
        &self,
        future: DeviceFuture,
        outstanding: &mut Vec<DeviceFuture>,
        sink: Option<&dyn TraceSink>,
        context: &DispatchContext,
        start: Instant,
    ) -> Result<()> {
        let failure = if self.queue.is_synchronous() {
            future.try_result().and_then(|status| status.err())
        } else {
            None
        };
        let status = match &failure {
            Some(err) => DispatchStatus::Failure {
                message: err.to_string(),
            },
            None => DispatchStatus::Enqueued,
        };
        if let Some(sink) = sink {
            sink.after_dispatch(
                context,
                &DispatchOutcome {
                    duration: start.elapsed(),
                    status,
                },
            );
        }
        match failure {
            Some(err) => Err(err),
            None => {
                outstanding.push(future);
                Ok(())
            }
        }
    }

    fn context(
        &self,
        path: DispatchPath,
        ops: Vec<OpKind>,
        signature: Option<u64>,
        cache_hit: bool,
    ) -> DispatchContext {
        DispatchContext {
            trace_id: trace::next_trace_id(),
            graph_id: self.graph_id,
            backend: self.backend.backend_name().to_string(),
            path,
            ops,
            signature,
            cache_hit,
        }
    }
}

/// Builds the region description for `members` (in dependency order) and lists the external
/// values feeding it, in first-use order.
pub(crate) fn describe_region(members: &[&ScheduledNode]) -> (RegionDescription, Vec<ValueId>) {
    let mut produced: HashMap<ValueId, RegionOperand> = HashMap::new();
    let mut external: Vec<ValueId> = Vec::new();
    let mut description = RegionDescription {
        inputs: Vec::new(),
        nodes: Vec::with_capacity(members.len()),
    };

    for (position, node) in members.iter().enumerate() {
        let instruction = &node.record.instruction;
        let operands = node
            .record
            .inputs
            .iter()
            .zip(&instruction.inputs)
            .map(|(value, spec)| {
                if let Some(operand) = produced.get(value) {
                    return *operand;
                }
                let index = match external.iter().position(|existing| existing == value) {
                    Some(index) => index,
                    None => {
                        external.push(*value);
                        description.inputs.push(spec.clone());
                        external.len() - 1
                    }
                };
                RegionOperand::Input(index)
            })
            .collect();
        for (output, value) in node.record.outputs.iter().enumerate() {
            produced.insert(
                *value,
                RegionOperand::Node {
                    node: position,
                    output,
                },
            );
        }
        description.nodes.push(RegionNode {
            instruction: instruction.clone(),
            operands,
        });
    }
    (description, external)
}

fn await_inputs<H: Clone>(slots: &[ValueSlot<H>]) -> Result<Vec<H>> {
    slots.iter().map(|slot| slot.wait()).collect()
}

fn publish<H: Clone>(slots: &[ValueSlot<H>], produced: Vec<H>) {
    for (slot, handle) in slots.iter().zip(produced) {
        slot.fulfill(Ok(handle));
    }
}

fn fail<H: Clone>(slots: &[ValueSlot<H>], err: RuntimeError) -> Result<()> {
    for slot in slots {
        slot.fulfill(Err(err.clone()));
    }
    Err(err)
}

fn input_shapes(instruction: &Instruction) -> Vec<Shape> {
    instruction
        .inputs
        .iter()
        .map(|spec| spec.shape.clone())
        .collect()
}

fn kernel_failure(op: OpKind, shapes: Vec<Shape>, message: String) -> RuntimeError {
    RuntimeError::KernelExecutionFailure {
        op,
        shapes,
        message,
    }
}

/// Runs a backend routine, turning both its errors and its panics into kernel failures so the
/// job can still settle its output slots.
fn guard_kernel<H, F>(op: OpKind, shapes: Vec<Shape>, kernel: F) -> Result<Vec<H>>
where
    F: FnOnce() -> BackendResult<Vec<H>>,
{
    match panic::catch_unwind(AssertUnwindSafe(kernel)) {
        Ok(produced) => produced.map_err(|err| kernel_failure(op, shapes, err.to_string())),
        Err(payload) => Err(kernel_failure(
            op,
            shapes,
            format!("kernel panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

fn upstream_failure(op: OpKind, err: &RuntimeError) -> RuntimeError {
    RuntimeError::UpstreamFailure {
        op,
        upstream: err.to_string(),
    }
}

fn expect_outputs<H>(
    op: OpKind,
    shapes: Vec<Shape>,
    produced: Vec<H>,
    expected: usize,
) -> Result<Vec<H>> {
    if produced.len() == expected {
        Ok(produced)
    } else {
        Err(kernel_failure(
            op,
            shapes,
            format!("backend returned {} outputs, expected {expected}", produced.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::TensorSpec;
    use crate::ops::attrs::Attributes;

    fn scheduled(id: u32, op: OpKind, inputs: &[u32], outputs: &[u32]) -> ScheduledNode {
        let spec = TensorSpec::f32([2, 2]);
        ScheduledNode {
            id: NodeId(id),
            record: NodeRecord {
                seq: u64::from(id),
                instruction: Instruction {
                    op,
                    attrs: Attributes::new(),
                    inputs: inputs.iter().map(|_| spec.clone()).collect(),
                    outputs: outputs.iter().map(|_| spec.clone()).collect(),
                },
                inputs: inputs.iter().map(|&v| ValueId(v)).collect(),
                outputs: outputs.iter().map(|&v| ValueId(v)).collect(),
            },
        }
    }

    #[test]
    fn region_operands_reference_inputs_and_earlier_nodes() {
        // v2 = v0 + v1; v3 = v2 * v0
        let a = scheduled(0, OpKind::Add, &[0, 1], &[2]);
        let b = scheduled(1, OpKind::Mul, &[2, 0], &[3]);
        let (description, external) = describe_region(&[&a, &b]);
        assert_eq!(external, vec![ValueId(0), ValueId(1)]);
        assert_eq!(description.inputs.len(), 2);
        assert_eq!(
            description.nodes[1].operands,
            vec![
                RegionOperand::Node { node: 0, output: 0 },
                RegionOperand::Input(0)
            ]
        );
        assert_eq!(description.output_count(), 2);
    }

    #[test]
    fn signature_ignores_value_identities() {
        let a = scheduled(0, OpKind::Add, &[0, 1], &[2]);
        let b = scheduled(7, OpKind::Add, &[10, 11], &[12]);
        let (first, _) = describe_region(&[&a]);
        let (second, _) = describe_region(&[&b]);
        assert_eq!(first.signature().unwrap(), second.signature().unwrap());
    }
}
