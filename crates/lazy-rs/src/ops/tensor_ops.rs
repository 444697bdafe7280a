//! Operation front-ends on [`LazyTensor`]. Each method records one node and returns its pending
//! outputs; nothing executes until the graph synchronizes.

use crate::backend::spec::PortableBackend;
use crate::error::{Result, RuntimeError};
use crate::tensor::LazyTensor;

use super::attrs::Attributes;
use super::registry::OpKind;

impl<B: PortableBackend + 'static> LazyTensor<B> {
    fn record_unary(&self, op: OpKind, attrs: Attributes) -> Result<Self> {
        self.graph().record_one(op, &[self], attrs)
    }

    fn record_binary(&self, op: OpKind, other: &Self) -> Result<Self> {
        self.graph().record_one(op, &[self, other], Attributes::new())
    }

    fn record_triple(&self, op: OpKind, inputs: &[&Self], attrs: Attributes) -> Result<[Self; 3]> {
        let outputs = self.graph().record(op, inputs, attrs)?;
        <[Self; 3]>::try_from(outputs).map_err(|outputs| RuntimeError::ShapeInference {
            op,
            reason: format!("expected three outputs, got {}", outputs.len()),
        })
    }

    pub fn add(&self, other: &Self) -> Result<Self> {
        self.record_binary(OpKind::Add, other)
    }

    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.record_binary(OpKind::Sub, other)
    }

    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.record_binary(OpKind::Mul, other)
    }

    pub fn div(&self, other: &Self) -> Result<Self> {
        self.record_binary(OpKind::Div, other)
    }

    pub fn maximum(&self, other: &Self) -> Result<Self> {
        self.record_binary(OpKind::Maximum, other)
    }

    pub fn minimum(&self, other: &Self) -> Result<Self> {
        self.record_binary(OpKind::Minimum, other)
    }

    pub fn pow(&self, exponent: &Self) -> Result<Self> {
        self.record_binary(OpKind::Pow, exponent)
    }

    pub fn neg(&self) -> Result<Self> {
        self.record_unary(OpKind::Neg, Attributes::new())
    }

    pub fn abs(&self) -> Result<Self> {
        self.record_unary(OpKind::Abs, Attributes::new())
    }

    pub fn exp(&self) -> Result<Self> {
        self.record_unary(OpKind::Exp, Attributes::new())
    }

    pub fn log(&self) -> Result<Self> {
        self.record_unary(OpKind::Log, Attributes::new())
    }

    pub fn tanh(&self) -> Result<Self> {
        self.record_unary(OpKind::Tanh, Attributes::new())
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.record_unary(OpKind::Sigmoid, Attributes::new())
    }

    pub fn relu(&self) -> Result<Self> {
        self.record_unary(OpKind::Relu, Attributes::new())
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.record_unary(OpKind::Sqrt, Attributes::new())
    }

    pub fn rsqrt(&self) -> Result<Self> {
        self.record_unary(OpKind::Rsqrt, Attributes::new())
    }

    pub fn reciprocal(&self) -> Result<Self> {
        self.record_unary(OpKind::Reciprocal, Attributes::new())
    }

    /// Records a device-side copy (the `clone` operation), unlike [`Clone::clone`] which only
    /// duplicates the handle.
    pub fn copy(&self) -> Result<Self> {
        self.record_unary(OpKind::Clone, Attributes::new())
    }

    pub fn clamp(&self, min: Option<f64>, max: Option<f64>) -> Result<Self> {
        let mut attrs = Attributes::new();
        if let Some(min) = min {
            attrs = attrs.with_float("min", min);
        }
        if let Some(max) = max {
            attrs = attrs.with_float("max", max);
        }
        self.record_unary(OpKind::Clamp, attrs)
    }

    pub fn matmul(&self, other: &Self) -> Result<Self> {
        self.record_binary(OpKind::Matmul, other)
    }

    /// Swaps two axes.
    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Self> {
        let attrs = Attributes::new().with_int("dim0", dim0).with_int("dim1", dim1);
        self.record_unary(OpKind::Transpose, attrs)
    }

    pub fn permute(&self, perm: &[i64]) -> Result<Self> {
        self.record_unary(OpKind::Transpose, Attributes::new().with_ints("perm", perm))
    }

    /// Reshapes to `shape`; one extent may be `-1`.
    pub fn reshape(&self, shape: &[i64]) -> Result<Self> {
        self.record_unary(OpKind::Reshape, Attributes::new().with_ints("shape", shape))
    }

    pub fn narrow(&self, dim: i64, start: i64, length: i64) -> Result<Self> {
        let attrs = Attributes::new()
            .with_int("dim", dim)
            .with_int("start", start)
            .with_int("length", length);
        self.record_unary(OpKind::Narrow, attrs)
    }

    pub fn sum(&self, dims: &[i64], keepdim: bool) -> Result<Self> {
        self.record_unary(OpKind::Sum, reduction_attrs(dims, keepdim))
    }

    pub fn mean(&self, dims: &[i64], keepdim: bool) -> Result<Self> {
        self.record_unary(OpKind::Mean, reduction_attrs(dims, keepdim))
    }

    pub fn softmax(&self, dim: i64) -> Result<Self> {
        self.record_unary(OpKind::Softmax, Attributes::new().with_int("dim", dim))
    }

    pub fn index_select(&self, dim: i64, index: &Self) -> Result<Self> {
        self.graph().record_one(
            OpKind::IndexSelect,
            &[self, index],
            Attributes::new().with_int("dim", dim),
        )
    }

    /// 2-D convolution of an NCHW input with an OIHW weight.
    pub fn conv2d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: [i64; 2],
        padding: [i64; 2],
    ) -> Result<Self> {
        let mut inputs = vec![self, weight];
        inputs.extend(bias);
        self.graph()
            .record_one(OpKind::Conv2d, &inputs, conv_attrs(stride, padding))
    }

    /// Gradients of [`conv2d`](Self::conv2d) with respect to input, weight, and bias, with
    /// `self` as the output gradient.
    pub fn convolution_backward(
        &self,
        input: &Self,
        weight: &Self,
        stride: [i64; 2],
        padding: [i64; 2],
    ) -> Result<[Self; 3]> {
        self.record_triple(
            OpKind::ConvolutionBackward,
            &[self, input, weight],
            conv_attrs(stride, padding),
        )
    }

    /// Splits a packed `[B, S, 3E]` projection into per-head query, key, and value tensors after
    /// adding `bias`; the query is scaled by `1 / sqrt(E / num_heads)`.
    pub fn transform_bias_rescale_qkv(&self, bias: &Self, num_heads: i64) -> Result<[Self; 3]> {
        self.record_triple(
            OpKind::TransformBiasRescaleQkv,
            &[self, bias],
            Attributes::new().with_int("num_heads", num_heads),
        )
    }

    pub fn cumsum(&self, dim: i64) -> Result<Self> {
        self.record_unary(OpKind::Cumsum, Attributes::new().with_int("dim", dim))
    }

    pub fn lgamma(&self) -> Result<Self> {
        self.record_unary(OpKind::Lgamma, Attributes::new())
    }
}

fn reduction_attrs(dims: &[i64], keepdim: bool) -> Attributes {
    let attrs = Attributes::new().with_bool("keepdim", keepdim);
    if dims.is_empty() {
        attrs
    } else {
        attrs.with_ints("dims", dims)
    }
}

fn conv_attrs(stride: [i64; 2], padding: [i64; 2]) -> Attributes {
    Attributes::new()
        .with_ints("stride", stride)
        .with_ints("padding", padding)
}
