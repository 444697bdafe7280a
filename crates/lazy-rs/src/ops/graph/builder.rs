//! Mutable builder used to stage operations inside a [`GraphArena`](super::arena::GraphArena).

use std::sync::Arc;

use log::trace;

use crate::backend::spec::{Instruction, PortableBackend, TensorSpec, ValueId};
use crate::error::{Result, RuntimeError};
use crate::ops::attrs::Attributes;
use crate::ops::registry::OpKind;
use crate::ops::shape_rules;
use crate::runtime::Promise;
use crate::tensor::{LazyTensor, Tensor, ValueToken};

use super::arena::GraphArena;
use super::state::{GraphInner, NodeRecord, ValueRecord, ValueState};

/// Context passed to graph capture closures for importing tensors and recording nodes.
///
/// The arena stays locked for the builder's lifetime, so a capture closure must not call back
/// into the arena through a handle (e.g. [`LazyTensor::to_host`]).
pub struct GraphBuilder<'a, B: PortableBackend + 'static> {
    pub(super) arena: Arc<GraphArena<B>>,
    pub(super) inner: &'a mut GraphInner<B>,
}

impl<'a, B: PortableBackend + 'static> GraphBuilder<'a, B> {
    /// Transfers a host tensor to the device and returns a realized handle.
    pub fn import(&mut self, tensor: &Tensor) -> Result<LazyTensor<B>> {
        let handle = self
            .arena
            .backend()
            .materialize(tensor)
            .map_err(|err| RuntimeError::Transfer {
                message: err.to_string(),
            })?;
        let value = self.inner.allocate_value();
        let spec = tensor.spec().clone();
        let token = Arc::new(ValueToken);
        self.inner.values.insert(
            value,
            ValueRecord {
                spec: spec.clone(),
                producer: None,
                consumers: Vec::new(),
                state: ValueState::Ready(Promise::fulfilled(Ok(handle))),
                live: Arc::downgrade(&token),
            },
        );
        Ok(LazyTensor::new(Arc::clone(&self.arena), value, spec, token))
    }

    /// Records `op` over `inputs` and returns its pending outputs.
    ///
    /// Validation happens before any mutation: on error the graph is unchanged.
    pub fn record(
        &mut self,
        op: OpKind,
        inputs: &[&LazyTensor<B>],
        attrs: Attributes,
    ) -> Result<Vec<LazyTensor<B>>> {
        if !self.arena.registry().is_registered(op) {
            return Err(RuntimeError::UnknownOperation {
                name: op.name().to_string(),
            });
        }
        if !op.arity().contains(&inputs.len()) {
            return Err(RuntimeError::ArityMismatch {
                op,
                expected: op.arity_label(),
                found: inputs.len(),
            });
        }
        for input in inputs {
            let owned = Arc::ptr_eq(input.graph(), &self.arena);
            if !owned || !self.inner.values.contains_key(&input.value()) {
                return Err(RuntimeError::InvalidHandle {
                    value: input.value(),
                });
            }
        }
        let input_specs: Vec<TensorSpec> = inputs.iter().map(|input| input.spec().clone()).collect();
        let output_specs = shape_rules::infer(op, &input_specs, &attrs)?;

        let (node, seq) = self.inner.allocate_node();
        let input_ids: Vec<ValueId> = inputs.iter().map(|input| input.value()).collect();
        let mut output_ids = Vec::with_capacity(output_specs.len());
        let mut handles = Vec::with_capacity(output_specs.len());
        for spec in &output_specs {
            let value = self.inner.allocate_value();
            let token = Arc::new(ValueToken);
            self.inner.values.insert(
                value,
                ValueRecord {
                    spec: spec.clone(),
                    producer: Some(node),
                    consumers: Vec::new(),
                    state: ValueState::Pending,
                    live: Arc::downgrade(&token),
                },
            );
            output_ids.push(value);
            handles.push(LazyTensor::new(
                Arc::clone(&self.arena),
                value,
                spec.clone(),
                token,
            ));
        }
        for value in &input_ids {
            if let Some(record) = self.inner.values.get_mut(value) {
                if !record.consumers.contains(&node) {
                    record.consumers.push(node);
                }
            }
        }
        trace!(
            "graph {}: recorded `{op}` as node {seq} ({} -> {})",
            self.arena.id(),
            input_ids.len(),
            output_ids.len()
        );
        self.inner.nodes.insert(
            node,
            NodeRecord {
                seq,
                instruction: Instruction {
                    op,
                    attrs,
                    inputs: input_specs,
                    outputs: output_specs,
                },
                inputs: input_ids,
                outputs: output_ids,
            },
        );
        Ok(handles)
    }

    /// Resolves `name` (or one of its aliases) through the registry, then records it.
    pub fn record_named(
        &mut self,
        name: &str,
        inputs: &[&LazyTensor<B>],
        attrs: Attributes,
    ) -> Result<Vec<LazyTensor<B>>> {
        let op = self.arena.registry().resolve(name)?;
        self.record(op, inputs, attrs)
    }

    /// Number of nodes still waiting for dispatch.
    pub fn pending_len(&self) -> usize {
        self.inner.nodes.len()
    }
}
