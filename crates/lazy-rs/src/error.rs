//! Error kinds surfaced by recording, dispatch, and synchronization.

use thiserror::Error;

use crate::backend::spec::ValueId;
use crate::ops::registry::OpKind;
use crate::tensor::Shape;

/// Errors produced by the lazy runtime.
///
/// The type is `Clone` because failures raised on the device queue are stored in value slots
/// and handed to every consumer that later waits on them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("unknown operation `{name}`")]
    UnknownOperation { name: String },
    #[error("operation `{op}` is not supported by this runtime")]
    UnsupportedOperation { op: OpKind },
    #[error("region compilation failed: {reason}")]
    CompilationFailure { reason: String },
    #[error("kernel `{op}` failed for input shapes [{}]: {message}", format_shapes(.shapes))]
    KernelExecutionFailure {
        op: OpKind,
        shapes: Vec<Shape>,
        message: String,
    },
    #[error("`{op}` was skipped because an upstream kernel failed: {upstream}")]
    UpstreamFailure { op: OpKind, upstream: String },
    #[error("tensor handle {value:?} is not valid in this graph")]
    InvalidHandle { value: ValueId },
    #[error("`{op}` expects {expected} inputs, got {found}")]
    ArityMismatch {
        op: OpKind,
        expected: String,
        found: usize,
    },
    #[error("shape inference failed for `{op}`: {reason}")]
    ShapeInference { op: OpKind, reason: String },
    #[error("invalid tensor: {reason}")]
    InvalidTensor { reason: String },
    #[error("host/device transfer failed: {message}")]
    Transfer { message: String },
    #[error("device queue failure: {message}")]
    DeviceQueue { message: String },
    #[error("invalid operation manifest: {reason}")]
    Manifest { reason: String },
    #[error("invalid runtime configuration: {reason}")]
    Config { reason: String },
}

impl RuntimeError {
    pub(crate) fn shape(op: OpKind, reason: impl Into<String>) -> Self {
        RuntimeError::ShapeInference {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_tensor(reason: impl Into<String>) -> Self {
        RuntimeError::InvalidTensor {
            reason: reason.into(),
        }
    }

    pub(crate) fn manifest(reason: impl Into<String>) -> Self {
        RuntimeError::Manifest {
            reason: reason.into(),
        }
    }

    /// Whether the error aborted a synchronization (as opposed to a recording-time failure).
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnsupportedOperation { .. }
                | RuntimeError::KernelExecutionFailure { .. }
                | RuntimeError::UpstreamFailure { .. }
        )
    }
}

fn format_shapes(shapes: &[Shape]) -> String {
    shapes
        .iter()
        .map(|shape| shape.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience alias for runtime results.
pub type Result<T> = std::result::Result<T, RuntimeError>;
