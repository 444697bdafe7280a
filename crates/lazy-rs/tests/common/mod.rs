#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use lazy_rs::backend::spec::{
    BackendResult, CompiledRegion, Instruction, PortableBackend, RegionDescription,
};
use lazy_rs::ops::registry::OperationManifest;
use lazy_rs::{Classification, GraphArena, OpRegistry, RuntimeConfig, Shape, Tensor};
use lazy_rs_backend_ref_cpu::{CpuBackend, CpuTensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Arena with an explicit configuration so `LAZYRS_*` variables cannot leak into tests.
pub fn arena<B: PortableBackend + 'static>(
    backend: B,
    config: RuntimeConfig,
) -> Result<Arc<GraphArena<B>>> {
    init_logging();
    Ok(GraphArena::builder(Arc::new(backend))
        .config(config)
        .build()?)
}

pub fn cpu_arena() -> Result<Arc<GraphArena<CpuBackend>>> {
    arena(CpuBackend::new(), RuntimeConfig::default())
}

/// Arena over the default manifest with the given operations moved to another class.
pub fn reclassified_arena(
    moves: &[(&str, Classification)],
) -> Result<Arc<GraphArena<CpuBackend>>> {
    init_logging();
    Ok(GraphArena::builder(Arc::new(CpuBackend::new()))
        .registry(reclassified(moves)?)
        .config(RuntimeConfig::default())
        .build()?)
}

pub fn reclassified(moves: &[(&str, Classification)]) -> Result<Arc<OpRegistry>> {
    let mut manifest = OperationManifest::default_manifest()?;
    for &(name, class) in moves {
        for list in [
            &mut manifest.compiled,
            &mut manifest.fallback,
            &mut manifest.unsupported,
        ] {
            list.retain(|existing| existing != name);
        }
        let target = match class {
            Classification::Compiled => &mut manifest.compiled,
            Classification::Fallback => &mut manifest.fallback,
            Classification::Unsupported => &mut manifest.unsupported,
        };
        target.push(name.to_string());
    }
    Ok(Arc::new(OpRegistry::from_manifest(&manifest)?))
}

pub fn tensor(dims: &[usize], values: Vec<f32>) -> Tensor {
    Tensor::from_vec(Shape::new(dims), values).expect("sample tensor")
}

pub fn sample(rng: &mut StdRng, dims: &[usize]) -> Tensor {
    let len: usize = dims.iter().product();
    tensor(dims, (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect())
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Reference CPU backend that counts compiler invocations and fallback kernel calls.
pub struct CountingBackend {
    inner: CpuBackend,
    compiles: AtomicUsize,
    kernels: AtomicUsize,
}

impl CountingBackend {
    pub fn new(inner: CpuBackend) -> Self {
        CountingBackend {
            inner,
            compiles: AtomicUsize::new(0),
            kernels: AtomicUsize::new(0),
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn kernels(&self) -> usize {
        self.kernels.load(Ordering::SeqCst)
    }
}

impl PortableBackend for CountingBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-counting"
    }

    fn materialize(&self, tensor: &Tensor) -> BackendResult<Self::TensorHandle> {
        self.inner.materialize(tensor)
    }

    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor> {
        self.inner.to_host(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.kernels.fetch_add(1, Ordering::SeqCst);
        self.inner.execute_instruction(instruction, inputs)
    }

    fn compile_region(
        &self,
        region: &RegionDescription,
    ) -> BackendResult<Arc<dyn CompiledRegion<Self::TensorHandle>>> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.inner.compile_region(region)
    }
}
