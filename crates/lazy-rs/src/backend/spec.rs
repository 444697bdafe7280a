use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::hashing::hash_serializable;
use crate::ops::attrs::Attributes;
use crate::ops::registry::OpKind;
use crate::tensor::{DType, Shape, Tensor};

/// Identifier of a value (tensor) recorded in a graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn f32(dims: impl AsRef<[usize]>) -> Self {
        Self::new(DType::F32, Shape::new(dims))
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// One operation invocation handed to a backend.
///
/// Input and output specs are resolved by the runtime's shape rules before the backend sees the
/// instruction, so kernels never need to re-derive them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub op: OpKind,
    pub attrs: Attributes,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// Where a region node reads one of its operands from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegionOperand {
    /// Index into [`RegionDescription::inputs`].
    Input(usize),
    /// Output `output` of region node `node`.
    Node { node: usize, output: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionNode {
    pub instruction: Instruction,
    pub operands: Vec<RegionOperand>,
}

/// Connected subgraph of compiled-capable nodes, in dependency order.
///
/// The description carries only structure and shape/dtype signatures, never data, so its hash
/// doubles as the compile cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionDescription {
    pub inputs: Vec<TensorSpec>,
    pub nodes: Vec<RegionNode>,
}

impl RegionDescription {
    /// Number of tensors a compiled region returns: every node output, node-major.
    pub fn output_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| node.instruction.outputs.len())
            .sum()
    }

    pub fn ops(&self) -> Vec<OpKind> {
        self.nodes.iter().map(|node| node.instruction.op).collect()
    }

    /// Structural hash used as the compile cache key.
    pub fn signature(&self) -> Result<u64, serde_json::Error> {
        hash_serializable(self)
    }
}

/// Executable produced by [`PortableBackend::compile_region`].
pub trait CompiledRegion<H>: Send + Sync {
    /// Runs the region. Returns every node output in node-major order
    /// (see [`RegionDescription::output_count`]).
    fn run(&self, inputs: &[H]) -> BackendResult<Vec<H>>;
}

/// Backend error surfaced to the dispatch engine.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The compiler rejected a region for a structural reason (rank, dtype, unknown op).
    SpecViolation { reason: String },
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn spec_violation(reason: impl Into<String>) -> Self {
        BackendError::SpecViolation {
            reason: reason.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::SpecViolation { reason } => write!(f, "region rejected: {reason}"),
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Device contract used by the runtime.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Transfers a host tensor to the device.
    fn materialize(&self, tensor: &Tensor) -> BackendResult<Self::TensorHandle>;

    /// Reads a device tensor back to the host.
    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor>;

    /// Executes a single instruction given already materialised operand handles.
    /// This is the numeric kernel collaborator behind the fallback path.
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;

    /// Lowers a region of compiled-capable nodes into a single executable.
    ///
    /// Backends without a compiler keep the default, which rejects every region and thereby
    /// demotes it to per-node fallback.
    fn compile_region(
        &self,
        region: &RegionDescription,
    ) -> BackendResult<Arc<dyn CompiledRegion<Self::TensorHandle>>> {
        let _ = region;
        Err(BackendError::spec_violation(format!(
            "backend {} has no region compiler",
            self.backend_name()
        )))
    }
}
