//! Region compiler of the reference backend.
//!
//! "Compilation" validates the region once against the backend limits and freezes its operand
//! wiring; running it interprets the nodes with the reference kernels.

use std::sync::Arc;

use log::debug;

use lazy_rs::backend::spec::{
    BackendError, BackendResult, CompiledRegion, RegionDescription, RegionOperand, TensorSpec,
};
use lazy_rs::OpKind;

use crate::cpu::{execute_operation, CpuBackendOptions, CpuKernelInterceptor, CpuTensor};

pub struct CpuCompiledRegion {
    region: RegionDescription,
    interceptor: Arc<dyn CpuKernelInterceptor>,
}

impl CpuCompiledRegion {
    pub fn description(&self) -> &RegionDescription {
        &self.region
    }
}

pub(crate) fn compile(
    interceptor: Arc<dyn CpuKernelInterceptor>,
    options: CpuBackendOptions,
    region: &RegionDescription,
) -> BackendResult<CpuCompiledRegion> {
    if region.nodes.is_empty() {
        return Err(BackendError::spec_violation("empty region"));
    }
    for spec in &region.inputs {
        check_rank(spec, options)?;
    }
    for (position, node) in region.nodes.iter().enumerate() {
        let instruction = &node.instruction;
        if !has_lowering(instruction.op) {
            return Err(BackendError::spec_violation(format!(
                "no compiled lowering for `{}`",
                instruction.op
            )));
        }
        if node.operands.len() != instruction.inputs.len() {
            return Err(BackendError::spec_violation(format!(
                "node {position} wires {} operands for {} inputs",
                node.operands.len(),
                instruction.inputs.len()
            )));
        }
        for (operand, declared) in node.operands.iter().zip(&instruction.inputs) {
            let source = match *operand {
                RegionOperand::Input(index) => region.inputs.get(index),
                RegionOperand::Node { node, output } if node < position => region.nodes[node]
                    .instruction
                    .outputs
                    .get(output),
                RegionOperand::Node { node, .. } => {
                    return Err(BackendError::spec_violation(format!(
                        "node {position} reads node {node}, which does not precede it"
                    )))
                }
            };
            if source != Some(declared) {
                return Err(BackendError::spec_violation(format!(
                    "node {position} operand {operand:?} does not produce {declared}"
                )));
            }
        }
        for spec in &instruction.outputs {
            check_rank(spec, options)?;
        }
    }
    debug!(
        "cpu: compiled region of {} node(s) over {} input(s)",
        region.nodes.len(),
        region.inputs.len()
    );
    Ok(CpuCompiledRegion {
        region: region.clone(),
        interceptor,
    })
}

fn check_rank(spec: &TensorSpec, options: CpuBackendOptions) -> BackendResult<()> {
    if spec.shape.rank() > options.max_compiled_rank {
        return Err(BackendError::spec_violation(format!(
            "{spec} exceeds the maximum compiled rank {}",
            options.max_compiled_rank
        )));
    }
    Ok(())
}

fn has_lowering(op: OpKind) -> bool {
    !matches!(op, OpKind::Cumsum | OpKind::Lgamma)
}

impl CompiledRegion<CpuTensor> for CpuCompiledRegion {
    fn run(&self, inputs: &[CpuTensor]) -> BackendResult<Vec<CpuTensor>> {
        if inputs.len() != self.region.inputs.len() {
            return Err(BackendError::execution(format!(
                "region expects {} inputs, got {}",
                self.region.inputs.len(),
                inputs.len()
            )));
        }
        let mut produced: Vec<Vec<CpuTensor>> = Vec::with_capacity(self.region.nodes.len());
        for node in &self.region.nodes {
            let operands = node
                .operands
                .iter()
                .map(|operand| match *operand {
                    RegionOperand::Input(index) => inputs.get(index),
                    RegionOperand::Node { node, output } => {
                        produced.get(node).and_then(|outputs| outputs.get(output))
                    }
                })
                .map(|tensor| {
                    tensor
                        .cloned()
                        .ok_or_else(|| BackendError::execution("dangling region operand"))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            let outputs = execute_operation(self.interceptor.as_ref(), &node.instruction, &operands)?;
            if outputs.len() != node.instruction.outputs.len() {
                return Err(BackendError::execution(format!(
                    "`{}` produced {} outputs, expected {}",
                    node.instruction.op,
                    outputs.len(),
                    node.instruction.outputs.len()
                )));
            }
            produced.push(outputs);
        }
        Ok(produced.into_iter().flatten().collect())
    }
}
