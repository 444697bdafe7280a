//! User-facing handles to values recorded in a graph arena.

use std::fmt;
use std::sync::Arc;

use crate::backend::spec::{PortableBackend, TensorSpec, ValueId};
use crate::error::Result;
use crate::ops::graph::GraphArena;

use super::{DType, Shape, Tensor};

/// Liveness marker shared by every clone of a handle. The arena holds only a weak reference,
/// so a value becomes collectable once the last clone drops.
#[derive(Debug)]
pub(crate) struct ValueToken;

/// Handle to a value that may be pending or realized.
///
/// Shape and dtype are known at creation. The handle's [`ValueId`] never changes, even after
/// the producing node has been dispatched.
pub struct LazyTensor<B: PortableBackend + 'static> {
    graph: Arc<GraphArena<B>>,
    value: ValueId,
    spec: TensorSpec,
    token: Arc<ValueToken>,
}

impl<B: PortableBackend + 'static> Clone for LazyTensor<B> {
    fn clone(&self) -> Self {
        LazyTensor {
            graph: Arc::clone(&self.graph),
            value: self.value,
            spec: self.spec.clone(),
            token: Arc::clone(&self.token),
        }
    }
}

impl<B: PortableBackend + 'static> LazyTensor<B> {
    pub(crate) fn new(
        graph: Arc<GraphArena<B>>,
        value: ValueId,
        spec: TensorSpec,
        token: Arc<ValueToken>,
    ) -> Self {
        LazyTensor {
            graph,
            value,
            spec,
            token,
        }
    }

    pub fn value(&self) -> ValueId {
        self.value
    }

    pub fn graph(&self) -> &Arc<GraphArena<B>> {
        &self.graph
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    /// Whether the producing node still waits for a synchronization.
    pub fn is_pending(&self) -> bool {
        self.graph.is_pending(self.value)
    }

    /// Synchronizes the graph, waits for this value, and copies it to the host.
    pub fn to_host(&self) -> Result<Tensor> {
        self.graph.read(self.value)
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for LazyTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyTensor")
            .field("graph", &self.graph.id())
            .field("value", &self.value)
            .field("spec", &self.spec)
            .finish()
    }
}
