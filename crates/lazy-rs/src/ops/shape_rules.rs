//! Symbolic shape and dtype inference for every registered operation.
//!
//! Rules run at record time, so every pending handle knows its exact spec before any kernel
//! executes. The attribute helpers are public so backends interpret attributes identically.

use crate::backend::spec::TensorSpec;
use crate::error::{Result, RuntimeError};
use crate::ops::attrs::Attributes;
use crate::ops::registry::OpKind;
use crate::tensor::{DType, Shape};

/// Infers output specs of `op` applied to `inputs`.
///
/// The caller has already checked arity against [`OpKind::arity`].
pub fn infer(op: OpKind, inputs: &[TensorSpec], attrs: &Attributes) -> Result<Vec<TensorSpec>> {
    if op.is_elementwise_binary() {
        require_float(op, inputs)?;
        let shape = broadcast_shapes(&inputs[0].shape, &inputs[1].shape)
            .ok_or_else(|| {
                RuntimeError::shape(
                    op,
                    format!(
                        "shapes {} and {} are not broadcast compatible",
                        inputs[0].shape, inputs[1].shape
                    ),
                )
            })?;
        return Ok(vec![TensorSpec::new(DType::F32, shape)]);
    }
    if op == OpKind::Clone {
        return Ok(vec![inputs[0].clone()]);
    }
    if op.is_elementwise_unary() {
        require_float(op, inputs)?;
        return Ok(vec![inputs[0].clone()]);
    }

    match op {
        OpKind::Clamp => {
            require_float(op, inputs)?;
            if let (Some(min), Some(max)) = (attrs.float("min"), attrs.float("max")) {
                if min > max {
                    return Err(RuntimeError::shape(
                        op,
                        format!("min {min} exceeds max {max}"),
                    ));
                }
            }
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Matmul => matmul(op, inputs),
        OpKind::Transpose => {
            let perm = transpose_permutation(op, &inputs[0].shape, attrs)?;
            let dims: Vec<usize> = perm.iter().map(|&axis| inputs[0].shape.dims()[axis]).collect();
            Ok(vec![TensorSpec::new(inputs[0].dtype, Shape::new(dims))])
        }
        OpKind::Reshape => {
            let shape = reshape_target(op, &inputs[0].shape, attrs)?;
            Ok(vec![TensorSpec::new(inputs[0].dtype, shape)])
        }
        OpKind::Narrow => {
            let (axis, _, length) = narrow_window(op, &inputs[0].shape, attrs)?;
            let mut dims = inputs[0].shape.dims().to_vec();
            dims[axis] = length;
            Ok(vec![TensorSpec::new(inputs[0].dtype, Shape::new(dims))])
        }
        OpKind::Sum | OpKind::Mean => {
            require_float(op, inputs)?;
            let axes = reduce_axes(op, &inputs[0].shape, attrs)?;
            let keepdim = attrs.bool_or("keepdim", false);
            let dims: Vec<usize> = inputs[0]
                .shape
                .dims()
                .iter()
                .enumerate()
                .filter_map(|(axis, &extent)| match (axes.contains(&axis), keepdim) {
                    (false, _) => Some(extent),
                    (true, true) => Some(1),
                    (true, false) => None,
                })
                .collect();
            Ok(vec![TensorSpec::new(DType::F32, Shape::new(dims))])
        }
        OpKind::Softmax | OpKind::Cumsum => {
            require_float(op, inputs)?;
            single_axis(op, &inputs[0].shape, attrs, -1)?;
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Lgamma => {
            require_float(op, inputs)?;
            Ok(vec![inputs[0].clone()])
        }
        OpKind::IndexSelect => index_select(op, inputs, attrs),
        OpKind::Conv2d => conv2d(op, inputs, attrs),
        OpKind::ConvolutionBackward => convolution_backward(op, inputs, attrs),
        OpKind::TransformBiasRescaleQkv => transform_bias_rescale_qkv(op, inputs, attrs),
        _ => Err(RuntimeError::shape(op, "no shape rule registered")),
    }
}

/// NumPy-style broadcasting of two shapes, aligned from the trailing dimension.
pub fn broadcast_shapes(lhs: &Shape, rhs: &Shape) -> Option<Shape> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = vec![0usize; rank];
    for (offset, slot) in dims.iter_mut().rev().enumerate() {
        let l = trailing_dim(lhs, offset);
        let r = trailing_dim(rhs, offset);
        *slot = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(Shape::new(dims))
}

fn trailing_dim(shape: &Shape, offset: usize) -> usize {
    let rank = shape.rank();
    if offset < rank {
        shape.dims()[rank - 1 - offset]
    } else {
        1
    }
}

/// Axis permutation for `transpose`: either the `perm` attribute or a swap of `dim0`/`dim1`
/// (defaulting to the last two axes).
pub fn transpose_permutation(op: OpKind, shape: &Shape, attrs: &Attributes) -> Result<Vec<usize>> {
    let rank = shape.rank();
    if let Some(perm) = attrs.ints("perm") {
        if perm.len() != rank {
            return Err(RuntimeError::shape(
                op,
                format!("permutation of length {} for rank {rank}", perm.len()),
            ));
        }
        let mut seen = vec![false; rank];
        let mut resolved = Vec::with_capacity(rank);
        for &axis in perm {
            let axis = shape
                .normalize_axis(axis)
                .ok_or_else(|| RuntimeError::shape(op, format!("axis {axis} out of range")))?;
            if std::mem::replace(&mut seen[axis], true) {
                return Err(RuntimeError::shape(op, format!("axis {axis} repeated")));
            }
            resolved.push(axis);
        }
        return Ok(resolved);
    }
    if rank < 2 {
        return Err(RuntimeError::shape(
            op,
            format!("cannot swap axes of a rank-{rank} tensor"),
        ));
    }
    let dim0 = single_axis_named(op, shape, attrs, "dim0", -2)?;
    let dim1 = single_axis_named(op, shape, attrs, "dim1", -1)?;
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(dim0, dim1);
    Ok(perm)
}

/// Target shape for `reshape`. One extent may be `-1` and is inferred.
pub fn reshape_target(op: OpKind, shape: &Shape, attrs: &Attributes) -> Result<Shape> {
    let requested = attrs
        .ints("shape")
        .ok_or_else(|| RuntimeError::shape(op, "missing `shape` attribute"))?;
    let mut inferred = None;
    let mut known = 1usize;
    for (idx, &extent) in requested.iter().enumerate() {
        match extent {
            -1 if inferred.is_none() => inferred = Some(idx),
            -1 => return Err(RuntimeError::shape(op, "more than one inferred extent")),
            e if e < 0 => {
                return Err(RuntimeError::shape(op, format!("negative extent {e}")))
            }
            e => known *= e as usize,
        }
    }
    let total = shape.element_count();
    let mut dims: Vec<usize> = requested.iter().map(|&e| e.max(0) as usize).collect();
    if let Some(idx) = inferred {
        if known == 0 || total % known != 0 {
            return Err(RuntimeError::shape(
                op,
                format!("cannot infer extent reshaping {shape} to {requested:?}"),
            ));
        }
        dims[idx] = total / known;
    } else if known != total {
        return Err(RuntimeError::shape(
            op,
            format!("cannot reshape {shape} to {requested:?}"),
        ));
    }
    Ok(Shape::new(dims))
}

/// `(axis, start, length)` for `narrow`.
pub fn narrow_window(
    op: OpKind,
    shape: &Shape,
    attrs: &Attributes,
) -> Result<(usize, usize, usize)> {
    let axis = single_axis(op, shape, attrs, 0)?;
    let extent = shape.dims()[axis];
    let start = attrs.int_or("start", 0);
    let length = attrs
        .int("length")
        .ok_or_else(|| RuntimeError::shape(op, "missing `length` attribute"))?;
    if start < 0 || length < 0 || (start + length) as usize > extent {
        return Err(RuntimeError::shape(
            op,
            format!("window {start}+{length} exceeds extent {extent} of axis {axis}"),
        ));
    }
    Ok((axis, start as usize, length as usize))
}

/// Reduced axes for `sum`/`mean`, sorted. An absent `dims` attribute reduces every axis.
pub fn reduce_axes(op: OpKind, shape: &Shape, attrs: &Attributes) -> Result<Vec<usize>> {
    let Some(requested) = attrs.ints("dims") else {
        return Ok((0..shape.rank()).collect());
    };
    let mut axes = Vec::with_capacity(requested.len());
    for &axis in requested {
        let resolved = shape
            .normalize_axis(axis)
            .ok_or_else(|| RuntimeError::shape(op, format!("axis {axis} out of range")))?;
        if axes.contains(&resolved) {
            return Err(RuntimeError::shape(op, format!("axis {axis} repeated")));
        }
        axes.push(resolved);
    }
    axes.sort_unstable();
    Ok(axes)
}

/// Reads the `dim` attribute, normalized against `shape`.
pub fn single_axis(op: OpKind, shape: &Shape, attrs: &Attributes, default: i64) -> Result<usize> {
    single_axis_named(op, shape, attrs, "dim", default)
}

fn single_axis_named(
    op: OpKind,
    shape: &Shape,
    attrs: &Attributes,
    key: &str,
    default: i64,
) -> Result<usize> {
    let axis = attrs.int_or(key, default);
    shape.normalize_axis(axis).ok_or_else(|| {
        RuntimeError::shape(op, format!("{key}={axis} out of range for shape {shape}"))
    })
}

/// Stride and padding of a 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dGeometry {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Conv2dGeometry {
    pub fn from_attrs(op: OpKind, attrs: &Attributes) -> Result<Self> {
        let stride = pair(op, attrs, "stride", 1)?;
        let padding = pair(op, attrs, "padding", 0)?;
        if stride.contains(&0) {
            return Err(RuntimeError::shape(op, "stride must be positive"));
        }
        Ok(Conv2dGeometry { stride, padding })
    }

    /// Spatial output extent, or `None` when the kernel does not fit.
    pub fn output_extent(&self, axis: usize, input: usize, kernel: usize) -> Option<usize> {
        let padded = input + 2 * self.padding[axis];
        if kernel == 0 || padded < kernel {
            return None;
        }
        Some((padded - kernel) / self.stride[axis] + 1)
    }

    fn output_shape(&self, op: OpKind, input: &Shape, weight: &Shape) -> Result<Shape> {
        let (x, w) = (input.dims(), weight.dims());
        if x.len() != 4 || w.len() != 4 {
            return Err(RuntimeError::shape(
                op,
                format!("expected NCHW input and OIHW weight, got {input} and {weight}"),
            ));
        }
        if x[1] != w[1] {
            return Err(RuntimeError::shape(
                op,
                format!("input channels {} do not match weight channels {}", x[1], w[1]),
            ));
        }
        let out_h = self.output_extent(0, x[2], w[2]);
        let out_w = self.output_extent(1, x[3], w[3]);
        match (out_h, out_w) {
            (Some(h), Some(w_out)) => Ok(Shape::new([x[0], w[0], h, w_out])),
            _ => Err(RuntimeError::shape(
                op,
                format!("kernel {weight} does not fit input {input}"),
            )),
        }
    }
}

fn pair(op: OpKind, attrs: &Attributes, key: &str, default: usize) -> Result<[usize; 2]> {
    match attrs.ints(key) {
        None => Ok([default, default]),
        Some(&[a, b]) if a >= 0 && b >= 0 => Ok([a as usize, b as usize]),
        Some(other) => Err(RuntimeError::shape(
            op,
            format!("`{key}` must hold two non-negative values, got {other:?}"),
        )),
    }
}

fn conv2d(op: OpKind, inputs: &[TensorSpec], attrs: &Attributes) -> Result<Vec<TensorSpec>> {
    require_float(op, inputs)?;
    let geometry = Conv2dGeometry::from_attrs(op, attrs)?;
    let out = geometry.output_shape(op, &inputs[0].shape, &inputs[1].shape)?;
    if let Some(bias) = inputs.get(2) {
        if bias.shape.dims() != [inputs[1].shape.dims()[0]] {
            return Err(RuntimeError::shape(
                op,
                format!("bias {} does not match output channels", bias.shape),
            ));
        }
    }
    Ok(vec![TensorSpec::new(DType::F32, out)])
}

/// Inputs are `(grad_output, input, weight)`; outputs are `(grad_input, grad_weight, grad_bias)`.
fn convolution_backward(
    op: OpKind,
    inputs: &[TensorSpec],
    attrs: &Attributes,
) -> Result<Vec<TensorSpec>> {
    require_float(op, inputs)?;
    let geometry = Conv2dGeometry::from_attrs(op, attrs)?;
    let (grad_out, input, weight) = (&inputs[0], &inputs[1], &inputs[2]);
    let expected = geometry.output_shape(op, &input.shape, &weight.shape)?;
    if expected != grad_out.shape {
        return Err(RuntimeError::shape(
            op,
            format!(
                "grad_output {} does not match forward output {expected}",
                grad_out.shape
            ),
        ));
    }
    Ok(vec![
        input.clone(),
        weight.clone(),
        TensorSpec::new(DType::F32, Shape::new([weight.shape.dims()[0]])),
    ])
}

fn index_select(op: OpKind, inputs: &[TensorSpec], attrs: &Attributes) -> Result<Vec<TensorSpec>> {
    let (source, index) = (&inputs[0], &inputs[1]);
    if !index.dtype.is_integer() || index.shape.rank() != 1 {
        return Err(RuntimeError::shape(
            op,
            format!("index must be a rank-1 si32 tensor, got {index}"),
        ));
    }
    let axis = single_axis(op, &source.shape, attrs, 0)?;
    let mut dims = source.shape.dims().to_vec();
    dims[axis] = index.shape.dims()[0];
    Ok(vec![TensorSpec::new(source.dtype, Shape::new(dims))])
}

/// Inputs are `(qkv [B, S, 3E], bias [3E])`; every output is `[B, heads, S, E / heads]`.
fn transform_bias_rescale_qkv(
    op: OpKind,
    inputs: &[TensorSpec],
    attrs: &Attributes,
) -> Result<Vec<TensorSpec>> {
    require_float(op, inputs)?;
    let (qkv, bias) = (&inputs[0].shape, &inputs[1].shape);
    let heads = attrs
        .int("num_heads")
        .filter(|&heads| heads > 0)
        .ok_or_else(|| RuntimeError::shape(op, "missing positive `num_heads` attribute"))?
        as usize;
    let [batch, seq, width] = *qkv.dims() else {
        return Err(RuntimeError::shape(op, format!("expected [B, S, 3E], got {qkv}")));
    };
    if width % 3 != 0 || bias.dims() != [width] {
        return Err(RuntimeError::shape(
            op,
            format!("incompatible qkv {qkv} and bias {bias}"),
        ));
    }
    let embed = width / 3;
    if embed % heads != 0 {
        return Err(RuntimeError::shape(
            op,
            format!("embedding {embed} is not divisible by {heads} heads"),
        ));
    }
    let out = TensorSpec::new(DType::F32, Shape::new([batch, heads, seq, embed / heads]));
    Ok(vec![out.clone(), out.clone(), out])
}

fn matmul(op: OpKind, inputs: &[TensorSpec]) -> Result<Vec<TensorSpec>> {
    require_float(op, inputs)?;
    let (a, b) = (inputs[0].shape.dims(), inputs[1].shape.dims());
    let rank = a.len();
    if rank < 2 || b.len() != rank {
        return Err(RuntimeError::shape(
            op,
            format!(
                "operands must share a rank of at least 2, got {} and {}",
                inputs[0].shape, inputs[1].shape
            ),
        ));
    }
    if a[..rank - 2] != b[..rank - 2] || a[rank - 1] != b[rank - 2] {
        return Err(RuntimeError::shape(
            op,
            format!(
                "incompatible operands {} and {}",
                inputs[0].shape, inputs[1].shape
            ),
        ));
    }
    let mut dims = a[..rank - 1].to_vec();
    dims.push(b[rank - 1]);
    Ok(vec![TensorSpec::new(DType::F32, Shape::new(dims))])
}

fn require_float(op: OpKind, inputs: &[TensorSpec]) -> Result<()> {
    match inputs.iter().find(|spec| !spec.dtype.is_float()) {
        Some(spec) => Err(RuntimeError::shape(
            op,
            format!("expected floating-point operands, got {spec}"),
        )),
        None => Ok(()),
    }
}
