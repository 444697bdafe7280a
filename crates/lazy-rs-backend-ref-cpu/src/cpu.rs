use std::sync::Arc;

use lazy_rs::backend::spec::{
    BackendError, BackendResult, CompiledRegion, Instruction, PortableBackend, RegionDescription,
    TensorSpec,
};
use lazy_rs::ops::shape_rules::{self, Conv2dGeometry};
use lazy_rs::{Attributes, OpKind, RuntimeError, Tensor, TensorData};

use crate::compiler;

/// Device tensor of the reference backend: a spec plus a shared host buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

impl CpuTensor {
    pub fn f32(spec: TensorSpec, values: Vec<f32>) -> Self {
        CpuTensor {
            spec,
            data: TensorData::F32(Arc::from(values)),
        }
    }

    pub fn as_f32(&self) -> BackendResult<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            other => Err(BackendError::execution(format!(
                "expected f32 operand, found {}",
                other.dtype()
            ))),
        }
    }

    pub fn as_i32(&self) -> BackendResult<&[i32]> {
        match &self.data {
            TensorData::Si32(values) => Ok(values),
            other => Err(BackendError::execution(format!(
                "expected si32 operand, found {}",
                other.dtype()
            ))),
        }
    }
}

/// Hook that may take over individual kernels, e.g. to route an operation to a hand-tuned
/// implementation or to inject failures.
///
/// Returning `None` falls through to the built-in kernel.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        instruction: &Instruction,
        inputs: &[CpuTensor],
    ) -> Option<BackendResult<Vec<CpuTensor>>>;
}

#[derive(Debug, Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _instruction: &Instruction,
        _inputs: &[CpuTensor],
    ) -> Option<BackendResult<Vec<CpuTensor>>> {
        None
    }
}

/// Limits applied by the region compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBackendOptions {
    /// Highest tensor rank a compiled region may touch. Larger regions are rejected.
    pub max_compiled_rank: usize,
}

impl Default for CpuBackendOptions {
    fn default() -> Self {
        CpuBackendOptions {
            max_compiled_rank: 4,
        }
    }
}

pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
    options: CpuBackendOptions,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self::with_arc(Arc::new(interceptor))
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self {
            interceptor,
            options: CpuBackendOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CpuBackendOptions) -> Self {
        self.options = options;
        self
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }

    pub fn options(&self) -> CpuBackendOptions {
        self.options
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor + 'static> PortableBackend for GenericCpuBackend<I> {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn materialize(&self, tensor: &Tensor) -> BackendResult<Self::TensorHandle> {
        Ok(CpuTensor {
            spec: tensor.spec().clone(),
            data: tensor.data().clone(),
        })
    }

    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor> {
        Tensor::from_data(tensor.spec.shape.clone(), tensor.data.clone()).map_err(rule_error)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        execute_operation(self.interceptor.as_ref(), instruction, inputs)
    }

    fn compile_region(
        &self,
        region: &RegionDescription,
    ) -> BackendResult<Arc<dyn CompiledRegion<Self::TensorHandle>>> {
        let interceptor: Arc<dyn CpuKernelInterceptor> = self.interceptor.clone();
        let compiled = compiler::compile(interceptor, self.options, region)?;
        Ok(Arc::new(compiled))
    }
}

/// Runs the reference kernel for one instruction.
pub fn execute_operation(
    interceptor: &dyn CpuKernelInterceptor,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendResult<Vec<CpuTensor>> {
    let op = instruction.op;
    if inputs.len() != instruction.inputs.len() {
        return Err(BackendError::execution(format!(
            "`{op}` expects {} inputs, got {}",
            instruction.inputs.len(),
            inputs.len()
        )));
    }
    for (input, declared) in inputs.iter().zip(&instruction.inputs) {
        if &input.spec != declared {
            return Err(BackendError::execution(format!(
                "`{op}` operand {} does not match declared {declared}",
                input.spec
            )));
        }
    }

    if let Some(result) = interceptor.try_execute(instruction, inputs) {
        return result;
    }

    let output = instruction
        .outputs
        .first()
        .ok_or_else(|| BackendError::execution(format!("`{op}` declares no outputs")))?;
    let attrs = &instruction.attrs;
    let result = match op {
        OpKind::Clone => vec![CpuTensor {
            spec: output.clone(),
            data: inputs[0].data.clone(),
        }],
        op if op.is_elementwise_binary() => vec![op_elementwise_binary(op, inputs, output)?],
        op if op.is_elementwise_unary() => vec![op_elementwise_unary(op, inputs, output)?],
        OpKind::Clamp => vec![op_clamp(inputs, output, attrs)?],
        OpKind::Matmul => vec![op_matmul(inputs, output)?],
        OpKind::Transpose => vec![op_transpose(inputs, output, attrs)?],
        OpKind::Reshape => vec![op_reshape(inputs, output)?],
        OpKind::Narrow => vec![op_narrow(inputs, output, attrs)?],
        OpKind::Sum | OpKind::Mean => vec![op_reduce(op, inputs, output, attrs)?],
        OpKind::Softmax => vec![op_softmax(inputs, output, attrs)?],
        OpKind::IndexSelect => vec![op_index_select(inputs, output, attrs)?],
        OpKind::Conv2d => vec![op_conv2d(inputs, output, attrs)?],
        OpKind::ConvolutionBackward => {
            op_convolution_backward(inputs, &instruction.outputs, attrs)?
        }
        OpKind::TransformBiasRescaleQkv => {
            op_transform_bias_rescale_qkv(inputs, &instruction.outputs, attrs)?
        }
        other => {
            return Err(BackendError::unimplemented(
                other.name(),
                "no reference cpu kernel",
            ))
        }
    };
    Ok(result)
}

fn rule_error(err: RuntimeError) -> BackendError {
    BackendError::execution(err.to_string())
}

fn op_elementwise_binary(
    op: OpKind,
    inputs: &[CpuTensor],
    output: &TensorSpec,
) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let (a, b) = (lhs.as_f32()?, rhs.as_f32()?);
    let combine: fn(f32, f32) -> f32 = match op {
        OpKind::Add => |x: f32, y: f32| x + y,
        OpKind::Sub => |x: f32, y: f32| x - y,
        OpKind::Mul => |x: f32, y: f32| x * y,
        OpKind::Div => |x: f32, y: f32| x / y,
        OpKind::Maximum => f32::max,
        OpKind::Minimum => f32::min,
        OpKind::Pow => f32::powf,
        other => {
            return Err(BackendError::execution(format!(
                "`{other}` is not an elementwise binary operation"
            )))
        }
    };

    let lhs_dims = lhs.spec.shape.dims();
    let rhs_dims = rhs.spec.shape.dims();
    let mut result = Vec::with_capacity(output.element_count());
    for coords in MultiIndex::new(output.shape.dims()) {
        let x = a[broadcast_offset(&coords, lhs_dims)];
        let y = b[broadcast_offset(&coords, rhs_dims)];
        result.push(combine(x, y));
    }
    Ok(CpuTensor::f32(output.clone(), result))
}

fn op_elementwise_unary(
    op: OpKind,
    inputs: &[CpuTensor],
    output: &TensorSpec,
) -> BackendResult<CpuTensor> {
    let values = inputs[0].as_f32()?;
    let apply: fn(f32) -> f32 = match op {
        OpKind::Neg => |x: f32| -x,
        OpKind::Abs => f32::abs,
        OpKind::Exp => f32::exp,
        OpKind::Log => f32::ln,
        OpKind::Tanh => f32::tanh,
        OpKind::Sigmoid => |x: f32| 1.0 / (1.0 + (-x).exp()),
        OpKind::Relu => |x: f32| x.max(0.0),
        OpKind::Sqrt => f32::sqrt,
        OpKind::Rsqrt => |x: f32| 1.0 / x.sqrt(),
        OpKind::Reciprocal => |x: f32| 1.0 / x,
        other => {
            return Err(BackendError::execution(format!(
                "`{other}` is not an elementwise unary operation"
            )))
        }
    };
    Ok(CpuTensor::f32(
        output.clone(),
        values.iter().map(|&x| apply(x)).collect(),
    ))
}

fn op_clamp(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    attrs: &Attributes,
) -> BackendResult<CpuTensor> {
    let values = inputs[0].as_f32()?;
    let min = attrs.float("min").map_or(f32::NEG_INFINITY, |v| v as f32);
    let max = attrs.float("max").map_or(f32::INFINITY, |v| v as f32);
    // NaN falls through both comparisons and is preserved.
    let result = values
        .iter()
        .map(|&x| {
            if x < min {
                min
            } else if x > max {
                max
            } else {
                x
            }
        })
        .collect();
    Ok(CpuTensor::f32(output.clone(), result))
}

fn op_matmul(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let (a, b) = (lhs.as_f32()?, rhs.as_f32()?);
    let a_dims = lhs.spec.shape.dims();
    let b_dims = rhs.spec.shape.dims();
    let rank = a_dims.len();
    if rank < 2 || b_dims.len() != rank {
        return Err(BackendError::execution("matmul expects operands of equal rank >= 2"));
    }
    let (m, k, n) = (a_dims[rank - 2], a_dims[rank - 1], b_dims[rank - 1]);
    let batch: usize = a_dims[..rank - 2].iter().product();

    let mut result = vec![0.0f32; output.element_count()];
    for bi in 0..batch {
        let (a_base, b_base, out_base) = (bi * m * k, bi * k * n, bi * m * n);
        for i in 0..m {
            for p in 0..k {
                let scale = a[a_base + i * k + p];
                let row = &b[b_base + p * n..b_base + (p + 1) * n];
                let out_row = &mut result[out_base + i * n..out_base + (i + 1) * n];
                for (out, &value) in out_row.iter_mut().zip(row) {
                    *out += scale * value;
                }
            }
        }
    }
    Ok(CpuTensor::f32(output.clone(), result))
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    attrs: &Attributes,
) -> BackendResult<CpuTensor> {
    let input = &inputs[0];
    let perm = shape_rules::transpose_permutation(OpKind::Transpose, &input.spec.shape, attrs)
        .map_err(rule_error)?;
    let strides = input.spec.shape.strides();
    let offsets = MultiIndex::new(output.shape.dims()).map(|coords| {
        coords
            .iter()
            .zip(&perm)
            .map(|(&coord, &axis)| coord * strides[axis])
            .sum()
    });
    Ok(CpuTensor {
        spec: output.clone(),
        data: gather(&input.data, offsets),
    })
}

fn op_reshape(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = &inputs[0];
    if input.data.len() != output.element_count() {
        return Err(BackendError::execution(format!(
            "cannot reshape {} into {}",
            input.spec, output
        )));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.clone(),
    })
}

fn op_narrow(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    attrs: &Attributes,
) -> BackendResult<CpuTensor> {
    let input = &inputs[0];
    let (axis, start, _) = shape_rules::narrow_window(OpKind::Narrow, &input.spec.shape, attrs)
        .map_err(rule_error)?;
    let strides = input.spec.shape.strides();
    let offsets = MultiIndex::new(output.shape.dims()).map(|coords| {
        coords
            .iter()
            .enumerate()
            .map(|(dim, &coord)| {
                let coord = if dim == axis { coord + start } else { coord };
                coord * strides[dim]
            })
            .sum()
    });
    Ok(CpuTensor {
        spec: output.clone(),
        data: gather(&input.data, offsets),
    })
}

fn op_reduce(
    op: OpKind,
    inputs: &[CpuTensor],
    output: &TensorSpec,
    attrs: &Attributes,
) -> BackendResult<CpuTensor> {
    let input = &inputs[0];
    let values = input.as_f32()?;
    let axes = shape_rules::reduce_axes(op, &input.spec.shape, attrs).map_err(rule_error)?;
    let dims = input.spec.shape.dims();
    let kept: Vec<usize> = (0..dims.len()).filter(|axis| !axes.contains(axis)).collect();
    let kept_dims: Vec<usize> = kept.iter().map(|&axis| dims[axis]).collect();
    let kept_strides = compute_strides(&kept_dims);

    let mut result = vec![0.0f32; output.element_count()];
    for (&value, coords) in values.iter().zip(MultiIndex::new(dims)) {
        let slot: usize = kept
            .iter()
            .zip(&kept_strides)
            .map(|(&axis, &stride)| coords[axis] * stride)
            .sum();
        result[slot] += value;
    }
    if op == OpKind::Mean {
        let count: usize = axes.iter().map(|&axis| dims[axis]).product();
        let scale = 1.0 / count as f32;
        result.iter_mut().for_each(|value| *value *= scale);
    }
    Ok(CpuTensor::f32(output.clone(), result))
}

fn op_softmax(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    attrs: &Attributes,
) -> BackendResult<CpuTensor> {
    let input = &inputs[0];
    let values = input.as_f32()?;
    let axis = shape_rules::single_axis(OpKind::Softmax, &input.spec.shape, attrs, -1)
        .map_err(rule_error)?;
    let dims = input.spec.shape.dims();
    let extent = dims[axis];
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();

    let mut result = values.to_vec();
    for o in 0..outer {
        for i in 0..inner {
            let base = o * extent * inner + i;
            let max = (0..extent)
                .map(|e| values[base + e * inner])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0f32;
            for e in 0..extent {
                let exp = (values[base + e * inner] - max).exp();
                result[base + e * inner] = exp;
                total += exp;
            }
            for e in 0..extent {
                result[base + e * inner] /= total;
            }
        }
    }
    Ok(CpuTensor::f32(output.clone(), result))
}

fn op_index_select(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    attrs: &Attributes,
) -> BackendResult<CpuTensor> {
    let (source, index) = (&inputs[0], &inputs[1]);
    let axis = shape_rules::single_axis(OpKind::IndexSelect, &source.spec.shape, attrs, 0)
        .map_err(rule_error)?;
    let extent = source.spec.shape.dims()[axis];
    let picks = index
        .as_i32()?
        .iter()
        .map(|&raw| {
            usize::try_from(raw)
                .ok()
                .filter(|&pick| pick < extent)
                .ok_or_else(|| {
                    BackendError::execution(format!(
                        "index {raw} out of range for extent {extent}"
                    ))
                })
        })
        .collect::<BackendResult<Vec<usize>>>()?;

    let strides = source.spec.shape.strides();
    let offsets = MultiIndex::new(output.shape.dims()).map(|coords| {
        coords
            .iter()
            .enumerate()
            .map(|(dim, &coord)| {
                let coord = if dim == axis { picks[coord] } else { coord };
                coord * strides[dim]
            })
            .sum()
    });
    Ok(CpuTensor {
        spec: output.clone(),
        data: gather(&source.data, offsets),
    })
}

fn op_conv2d(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    attrs: &Attributes,
) -> BackendResult<CpuTensor> {
    let geometry = Conv2dGeometry::from_attrs(OpKind::Conv2d, attrs).map_err(rule_error)?;
    let layout = ConvLayout::new(&inputs[0].spec, &inputs[1].spec, geometry)?;
    if layout.output_len() != output.element_count() {
        return Err(BackendError::execution(format!(
            "conv2d output {output} does not match geometry"
        )));
    }
    let (x, w) = (inputs[0].as_f32()?, inputs[1].as_f32()?);
    let bias = inputs.get(2).map(CpuTensor::as_f32).transpose()?;

    let mut result = vec![0.0f32; output.element_count()];
    layout.for_each_tap(|out_idx, in_idx, w_idx| result[out_idx] += x[in_idx] * w[w_idx]);
    if let Some(bias) = bias {
        for (idx, value) in result.iter_mut().enumerate() {
            *value += bias[layout.channel_of(idx)];
        }
    }
    Ok(CpuTensor::f32(output.clone(), result))
}

/// Inputs `(grad_output, input, weight)`; outputs `(grad_input, grad_weight, grad_bias)`.
fn op_convolution_backward(
    inputs: &[CpuTensor],
    outputs: &[TensorSpec],
    attrs: &Attributes,
) -> BackendResult<Vec<CpuTensor>> {
    let [grad_input_spec, grad_weight_spec, grad_bias_spec] = outputs else {
        return Err(BackendError::execution(
            "convolution_backward declares three outputs",
        ));
    };
    let geometry =
        Conv2dGeometry::from_attrs(OpKind::ConvolutionBackward, attrs).map_err(rule_error)?;
    let layout = ConvLayout::new(&inputs[1].spec, &inputs[2].spec, geometry)?;
    let (g, x, w) = (
        inputs[0].as_f32()?,
        inputs[1].as_f32()?,
        inputs[2].as_f32()?,
    );
    if g.len() != layout.output_len() {
        return Err(BackendError::execution(format!(
            "grad_output {} does not match geometry",
            inputs[0].spec
        )));
    }

    let mut grad_input = vec![0.0f32; x.len()];
    let mut grad_weight = vec![0.0f32; w.len()];
    let mut grad_bias = vec![0.0f32; layout.out_channels];
    layout.for_each_tap(|out_idx, in_idx, w_idx| {
        grad_input[in_idx] += g[out_idx] * w[w_idx];
        grad_weight[w_idx] += g[out_idx] * x[in_idx];
    });
    for (idx, &value) in g.iter().enumerate() {
        grad_bias[layout.channel_of(idx)] += value;
    }
    Ok(vec![
        CpuTensor::f32(grad_input_spec.clone(), grad_input),
        CpuTensor::f32(grad_weight_spec.clone(), grad_weight),
        CpuTensor::f32(grad_bias_spec.clone(), grad_bias),
    ])
}

/// Inputs `(qkv [B, S, 3E], bias [3E])`; outputs q, k, v as `[B, heads, S, E / heads]`, with q
/// scaled by `1 / sqrt(E / heads)`.
fn op_transform_bias_rescale_qkv(
    inputs: &[CpuTensor],
    outputs: &[TensorSpec],
    attrs: &Attributes,
) -> BackendResult<Vec<CpuTensor>> {
    if outputs.len() != 3 {
        return Err(BackendError::execution(
            "transform_bias_rescale_qkv declares three outputs",
        ));
    }
    let (qkv, bias) = (inputs[0].as_f32()?, inputs[1].as_f32()?);
    let heads = attrs
        .int("num_heads")
        .and_then(|heads| usize::try_from(heads).ok())
        .filter(|&heads| heads > 0)
        .ok_or_else(|| BackendError::execution("missing positive `num_heads` attribute"))?;
    let &[batch, seq, width] = inputs[0].spec.shape.dims() else {
        return Err(BackendError::execution(format!(
            "expected [B, S, 3E] projection, got {}",
            inputs[0].spec
        )));
    };
    let embed = width / 3;
    let head_dim = embed / heads;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut parts: [Vec<f32>; 3] = std::array::from_fn(|_| vec![0.0f32; batch * seq * embed]);
    for b in 0..batch {
        for s in 0..seq {
            let row = (b * seq + s) * width;
            for (part, values) in parts.iter_mut().enumerate() {
                for h in 0..heads {
                    for d in 0..head_dim {
                        let col = part * embed + h * head_dim + d;
                        let mut value = qkv[row + col] + bias[col];
                        if part == 0 {
                            value *= scale;
                        }
                        values[((b * heads + h) * seq + s) * head_dim + d] = value;
                    }
                }
            }
        }
    }
    Ok(parts
        .into_iter()
        .zip(outputs)
        .map(|(values, spec)| CpuTensor::f32(spec.clone(), values))
        .collect())
}

/// Index arithmetic shared by the convolution kernels (NCHW input, OIHW weight).
struct ConvLayout {
    batch: usize,
    in_channels: usize,
    out_channels: usize,
    in_extent: [usize; 2],
    kernel: [usize; 2],
    out_extent: [usize; 2],
    geometry: Conv2dGeometry,
}

impl ConvLayout {
    fn new(input: &TensorSpec, weight: &TensorSpec, geometry: Conv2dGeometry) -> BackendResult<Self> {
        let (&[batch, in_channels, in_h, in_w], &[out_channels, weight_channels, k_h, k_w]) =
            (input.shape.dims(), weight.shape.dims())
        else {
            return Err(BackendError::execution(format!(
                "expected NCHW input and OIHW weight, got {input} and {weight}"
            )));
        };
        if weight_channels != in_channels {
            return Err(BackendError::execution(format!(
                "input channels {in_channels} do not match weight channels {weight_channels}"
            )));
        }
        let out_h = geometry.output_extent(0, in_h, k_h);
        let out_w = geometry.output_extent(1, in_w, k_w);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(BackendError::execution(format!(
                "kernel {weight} does not fit input {input}"
            )));
        };
        Ok(ConvLayout {
            batch,
            in_channels,
            out_channels,
            in_extent: [in_h, in_w],
            kernel: [k_h, k_w],
            out_extent: [out_h, out_w],
            geometry,
        })
    }

    fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.out_extent[0] * self.out_extent[1]
    }

    /// Output channel of a flat output index.
    fn channel_of(&self, out_idx: usize) -> usize {
        (out_idx / (self.out_extent[0] * self.out_extent[1])) % self.out_channels
    }

    /// Maps a padded coordinate back into the input, or `None` when it lands in padding.
    fn source(&self, axis: usize, out: usize, tap: usize) -> Option<usize> {
        let padded = out * self.geometry.stride[axis] + tap;
        let src = padded.checked_sub(self.geometry.padding[axis])?;
        (src < self.in_extent[axis]).then_some(src)
    }

    /// Visits every `(output, input, weight)` flat index triple that contributes a product.
    fn for_each_tap(&self, mut visit: impl FnMut(usize, usize, usize)) {
        let [in_h, in_w] = self.in_extent;
        let [k_h, k_w] = self.kernel;
        let [out_h, out_w] = self.out_extent;
        for n in 0..self.batch {
            for o in 0..self.out_channels {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let out_idx = ((n * self.out_channels + o) * out_h + oh) * out_w + ow;
                        for c in 0..self.in_channels {
                            for kh in 0..k_h {
                                let Some(ih) = self.source(0, oh, kh) else {
                                    continue;
                                };
                                for kw in 0..k_w {
                                    let Some(iw) = self.source(1, ow, kw) else {
                                        continue;
                                    };
                                    let in_idx = ((n * self.in_channels + c) * in_h + ih) * in_w + iw;
                                    let w_idx = ((o * self.in_channels + c) * k_h + kh) * k_w + kw;
                                    visit(out_idx, in_idx, w_idx);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn gather(data: &TensorData, offsets: impl Iterator<Item = usize>) -> TensorData {
    match data {
        TensorData::F32(values) => TensorData::F32(offsets.map(|offset| values[offset]).collect()),
        TensorData::Si32(values) => {
            TensorData::Si32(offsets.map(|offset| values[offset]).collect())
        }
    }
}

/// Flat offset into a tensor of `dims` broadcast against the output coordinate `coords`.
fn broadcast_offset(coords: &[usize], dims: &[usize]) -> usize {
    let skip = coords.len() - dims.len();
    let mut offset = 0usize;
    let mut stride = 1usize;
    for axis in (0..dims.len()).rev() {
        let coord = if dims[axis] == 1 {
            0
        } else {
            coords[skip + axis]
        };
        offset += coord * stride;
        stride *= dims[axis];
    }
    offset
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

/// Row-major odometer over every coordinate of a shape.
struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    remaining: usize,
    started: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            remaining: shape.iter().product(),
            started: false,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            for i in (0..self.current.len()).rev() {
                self.current[i] += 1;
                if self.current[i] < self.shape[i] {
                    break;
                }
                self.current[i] = 0;
            }
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.current.clone())
    }
}
