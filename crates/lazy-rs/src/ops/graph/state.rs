//! Internal graph bookkeeping structures shared by the arena, builder, and scheduler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

use crate::backend::spec::{Instruction, PortableBackend, TensorSpec, ValueId};
use crate::error::{Result, RuntimeError};
use crate::runtime::Promise;
use crate::tensor::ValueToken;

/// Write-once cell holding a realized device handle, or the failure that prevented it.
pub(crate) type ValueSlot<H> = Promise<Result<H>>;

/// Identifier of a recorded node. Allocation order equals creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub(crate) u32);

/// Mutable graph storage protected by the arena mutex.
pub(crate) struct GraphInner<B: PortableBackend + 'static> {
    next_value: u32,
    next_node: u32,
    next_seq: u64,
    /// Pending nodes only; dispatched nodes are retired.
    pub(crate) nodes: BTreeMap<NodeId, NodeRecord>,
    pub(crate) values: HashMap<ValueId, ValueRecord<B>>,
}

impl<B: PortableBackend + 'static> GraphInner<B> {
    pub(crate) fn new() -> Self {
        GraphInner {
            next_value: 0,
            next_node: 0,
            next_seq: 0,
            nodes: BTreeMap::new(),
            values: HashMap::new(),
        }
    }

    pub(crate) fn allocate_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    pub(crate) fn allocate_node(&mut self) -> (NodeId, u64) {
        let id = NodeId(self.next_node);
        let seq = self.next_seq;
        self.next_node += 1;
        self.next_seq += 1;
        (id, seq)
    }

    /// Slot of a realized value.
    pub(crate) fn ready_slot(&self, value: ValueId) -> Result<ValueSlot<B::TensorHandle>> {
        match self.values.get(&value).map(|record| &record.state) {
            Some(ValueState::Ready(slot)) => Ok(slot.clone()),
            _ => Err(RuntimeError::InvalidHandle { value }),
        }
    }

    /// Pending producer of `value`, if any.
    pub(crate) fn pending_producer(&self, value: ValueId) -> Option<NodeId> {
        let record = self.values.get(&value)?;
        match record.state {
            ValueState::Pending => record.producer,
            ValueState::Ready(_) => None,
        }
    }

    /// Marks a dispatched node's outputs as realized and removes it from the pending set.
    pub(crate) fn retire(&mut self, node: NodeId, slots: Vec<ValueSlot<B::TensorHandle>>) {
        let Some(record) = self.nodes.remove(&node) else {
            return;
        };
        for (value, slot) in record.outputs.iter().zip(slots) {
            if let Some(output) = self.values.get_mut(value) {
                output.state = ValueState::Ready(slot);
            }
        }
        self.detach_consumer(node, &record.inputs);
    }

    /// Drops a pending node together with its outputs without dispatching it.
    pub(crate) fn discard(&mut self, node: NodeId) {
        let Some(record) = self.nodes.remove(&node) else {
            return;
        };
        for value in &record.outputs {
            self.values.remove(value);
        }
        self.detach_consumer(node, &record.inputs);
    }

    fn detach_consumer(&mut self, node: NodeId, inputs: &[ValueId]) {
        for value in inputs {
            if let Some(input) = self.values.get_mut(value) {
                input.consumers.retain(|consumer| *consumer != node);
            }
        }
    }
}

/// Pending node metadata.
#[derive(Debug, Clone)]
pub(crate) struct NodeRecord {
    pub(crate) seq: u64,
    pub(crate) instruction: Instruction,
    pub(crate) inputs: Vec<ValueId>,
    pub(crate) outputs: Vec<ValueId>,
}

/// Value metadata. Values outlive their producing node once realized.
pub(crate) struct ValueRecord<B: PortableBackend + 'static> {
    pub(crate) spec: TensorSpec,
    pub(crate) producer: Option<NodeId>,
    /// Pending nodes reading this value.
    pub(crate) consumers: Vec<NodeId>,
    pub(crate) state: ValueState<B>,
    /// Liveness of user-facing handles.
    pub(crate) live: Weak<ValueToken>,
}

impl<B: PortableBackend + 'static> ValueRecord<B> {
    pub(crate) fn has_live_handle(&self) -> bool {
        self.live.strong_count() > 0
    }
}

pub(crate) enum ValueState<B: PortableBackend + 'static> {
    /// Producer has not been dispatched yet.
    Pending,
    /// Producer was dispatched; the slot fills once device work completes.
    Ready(ValueSlot<B::TensorHandle>),
}
