//! Host-backed tensor used to move data into and out of backends.

use std::sync::Arc;

use crate::backend::spec::TensorSpec;
use crate::error::{Result, RuntimeError};

use super::{dtype::DType, shape::Shape};

/// Dense element storage. Buffers are reference counted so cloning a tensor is cheap.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si32(Arc<[i32]>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::Si32(_) => DType::Si32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::Si32(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host tensor pairing a [`TensorSpec`] with its dense row-major buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    spec: TensorSpec,
    data: TensorData,
}

impl Tensor {
    /// Constructs an `F32` tensor, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        Self::from_data(shape, TensorData::F32(Arc::from(data)))
    }

    /// Constructs an `Si32` tensor, validating the length against the shape.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> Result<Self> {
        Self::from_data(shape, TensorData::Si32(Arc::from(data)))
    }

    pub fn from_data(shape: Shape, data: TensorData) -> Result<Self> {
        if data.len() != shape.element_count() {
            return Err(RuntimeError::invalid_tensor(format!(
                "data length {} does not match shape {}",
                data.len(),
                shape
            )));
        }
        Ok(Tensor {
            spec: TensorSpec::new(data.dtype(), shape),
            data,
        })
    }

    pub fn scalar(value: f32) -> Self {
        Tensor {
            spec: TensorSpec::new(DType::F32, Shape::scalar()),
            data: TensorData::F32(Arc::from(vec![value])),
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        let len = shape.element_count();
        Tensor {
            spec: TensorSpec::new(DType::F32, shape),
            data: TensorData::F32(Arc::from(vec![0.0; len])),
        }
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

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrows the buffer as `f32`, failing for other dtypes.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            other => Err(RuntimeError::invalid_tensor(format!(
                "expected f32 data, found {}",
                other.dtype()
            ))),
        }
    }

    /// Borrows the buffer as `i32`, failing for other dtypes.
    pub fn as_i32(&self) -> Result<&[i32]> {
        match &self.data {
            TensorData::Si32(values) => Ok(values),
            other => Err(RuntimeError::invalid_tensor(format!(
                "expected si32 data, found {}",
                other.dtype()
            ))),
        }
    }

    /// Returns `true` when both tensors share a spec and every element differs by at most `tol`.
    pub fn allclose(&self, other: &Tensor, tol: f32) -> bool {
        if self.spec != other.spec {
            return false;
        }
        match (&self.data, &other.data) {
            (TensorData::F32(a), TensorData::F32(b)) => a
                .iter()
                .zip(b.iter())
                .all(|(x, y)| (x - y).abs() <= tol * (1.0 + y.abs())),
            (TensorData::Si32(a), TensorData::Si32(b)) => a == b,
            _ => false,
        }
    }
}
