mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use lazy_rs::backend::spec::{BackendResult, Instruction};
use lazy_rs::runtime::Job;
use lazy_rs::{
    Classification, DeviceFuture, DeviceQueue, DispatchPath, GraphArena, OpKind, RuntimeConfig,
    RuntimeError, WorkerQueue,
};
use lazy_rs_backend_ref_cpu::{CpuBackend, CpuKernelInterceptor, CpuTensor, GenericCpuBackend};

use common::{init_logging, reclassified, tensor};

/// Holds every job until the test releases the queue.
#[derive(Default)]
struct HeldQueue {
    jobs: Mutex<Vec<(Job, DeviceFuture)>>,
}

impl HeldQueue {
    fn held(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn release(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
        for (job, future) in jobs {
            future.complete(job());
        }
    }
}

impl DeviceQueue for HeldQueue {
    fn enqueue(&self, job: Job) -> DeviceFuture {
        let future = DeviceFuture::new();
        self.jobs.lock().unwrap().push((job, future.clone()));
        future
    }
}

fn queued_arena(queue: Arc<dyn DeviceQueue>) -> Result<Arc<GraphArena<CpuBackend>>> {
    init_logging();
    Ok(GraphArena::builder(Arc::new(CpuBackend::new()))
        .queue(queue)
        .config(RuntimeConfig::default())
        .build()?)
}

#[test]
fn counters_move_when_the_device_runs_the_work() -> Result<()> {
    let queue = Arc::new(HeldQueue::default());
    let graph = queued_arena(queue.clone())?;
    let x = graph.tensor(&tensor(&[2], vec![-1.0, 3.0]))?;
    let y = x.clamp(Some(0.0), None)?.exp()?;

    graph.synchronize()?;
    assert_eq!(graph.pending_len(), 0);
    assert!(!y.is_pending());
    assert_eq!(queue.held(), 2);
    assert!(graph.counters().snapshot().is_empty());

    queue.release();
    graph.block_until_complete()?;
    let snapshot = graph.counters().snapshot();
    assert_eq!(snapshot.get("fallback::clamp"), 1);
    assert_eq!(snapshot.get("compiled::exp"), 1);
    let values = y.to_host()?;
    assert_eq!(values.as_f32()?, &[1.0, 3.0f32.exp()]);
    Ok(())
}

#[test]
fn worker_queue_runs_units_in_order() -> Result<()> {
    let graph = queued_arena(Arc::new(WorkerQueue::new()?))?;
    let a = graph.tensor(&tensor(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]))?;
    let product = a.matmul(&a)?;
    let capped = product.clamp(None, Some(12.0))?;
    let out = capped.neg()?;

    graph.synchronize()?;
    graph.block_until_complete()?;
    assert_eq!(out.to_host()?.as_f32()?, &[-7.0, -10.0, -12.0, -12.0]);
    let snapshot = graph.counters().snapshot();
    assert_eq!(snapshot.get("compiled::matmul"), 1);
    assert_eq!(snapshot.get("fallback::clamp"), 1);
    assert_eq!(snapshot.get("compiled::neg"), 1);
    Ok(())
}

#[test]
fn asynchronous_kernel_failure_surfaces_when_blocking() -> Result<()> {
    init_logging();
    let graph = GraphArena::builder(Arc::new(CpuBackend::new()))
        .registry(reclassified(&[("cumsum", Classification::Fallback)])?)
        .queue(Arc::new(WorkerQueue::new()?))
        .config(RuntimeConfig::default())
        .build()?;
    let x = graph.tensor(&tensor(&[3], vec![1.0, 2.0, 3.0]))?;
    let running = x.cumsum(0)?;
    let downstream = running.exp()?;

    graph.synchronize()?;
    let err = graph.block_until_complete().unwrap_err();
    assert!(
        matches!(
            err,
            RuntimeError::KernelExecutionFailure {
                op: OpKind::Cumsum,
                ..
            }
        ),
        "{err:?}"
    );
    assert!(matches!(
        downstream.to_host().unwrap_err(),
        RuntimeError::UpstreamFailure { op: OpKind::Exp, .. }
    ));
    assert_eq!(
        graph.counters().get(DispatchPath::Fallback, OpKind::Cumsum),
        0
    );
    assert_eq!(graph.counters().get(DispatchPath::Compiled, OpKind::Exp), 0);
    Ok(())
}

struct PanicOnClamp;

impl CpuKernelInterceptor for PanicOnClamp {
    fn try_execute(
        &self,
        instruction: &Instruction,
        _inputs: &[CpuTensor],
    ) -> Option<BackendResult<Vec<CpuTensor>>> {
        if instruction.op == OpKind::Clamp {
            panic!("clamp kernel crashed");
        }
        None
    }
}

#[test]
fn panicking_kernel_fails_its_consumers_instead_of_hanging() -> Result<()> {
    init_logging();
    let graph = GraphArena::builder(Arc::new(GenericCpuBackend::with_interceptor(PanicOnClamp)))
        .queue(Arc::new(WorkerQueue::new()?))
        .config(RuntimeConfig::default())
        .build()?;
    let x = graph.tensor(&tensor(&[2], vec![-1.0, 1.0]))?;
    let downstream = x.clamp(Some(0.0), None)?.exp()?;

    graph.synchronize()?;
    match graph.block_until_complete().unwrap_err() {
        RuntimeError::KernelExecutionFailure { op, message, .. } => {
            assert_eq!(op, OpKind::Clamp);
            assert!(message.contains("clamp kernel crashed"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(
        downstream.to_host().unwrap_err(),
        RuntimeError::UpstreamFailure { op: OpKind::Exp, .. }
    ));
    assert!(graph.counters().snapshot().is_empty());

    // The worker survives and keeps serving later work.
    let recovered = x.neg()?;
    assert_eq!(recovered.to_host()?.as_f32()?, &[1.0, -1.0]);
    Ok(())
}

#[test]
fn blocking_does_not_drain_pending_nodes() -> Result<()> {
    let graph = queued_arena(Arc::new(WorkerQueue::new()?))?;
    let x = graph.tensor(&tensor(&[2], vec![1.0, 4.0]))?;
    let root = x.sqrt()?;
    let capped = root.clamp(None, Some(1.5))?;
    let pending = graph.pending_len();

    graph.block_until_complete()?;
    assert_eq!(graph.pending_len(), pending);
    assert!(root.is_pending() && capped.is_pending());
    assert!(graph.counters().snapshot().is_empty());

    graph.synchronize()?;
    graph.block_until_complete()?;
    assert_eq!(graph.pending_len(), 0);
    assert_eq!(capped.to_host()?.as_f32()?, &[1.0, 1.5]);
    Ok(())
}
