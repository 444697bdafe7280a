mod common;

use anyhow::Result;
use lazy_rs::{DispatchPath, OpKind, RuntimeConfig, Tensor};
use lazy_rs_backend_ref_cpu::{CpuBackend, CpuBackendOptions};

use common::{arena, cpu_arena, tensor, CountingBackend};

fn rank_limited(max_compiled_rank: usize) -> CpuBackend {
    CpuBackend::new().with_options(CpuBackendOptions { max_compiled_rank })
}

#[test]
fn rejected_region_demotes_every_node_to_fallback() -> Result<()> {
    let graph = arena(rank_limited(1), RuntimeConfig::default())?;
    let a = graph.tensor(&tensor(&[2, 2], vec![1.0, -2.0, 3.0, -4.0]))?;
    let b = graph.tensor(&tensor(&[2, 2], vec![1.0, 1.0, 1.0, 1.0]))?;
    let out = a.add(&b)?.relu()?.neg()?;
    assert_eq!(out.to_host()?.as_f32()?, &[-2.0, -0.0, -4.0, -0.0]);

    let snapshot = graph.counters().snapshot();
    for op in [OpKind::Add, OpKind::Relu, OpKind::Neg] {
        assert_eq!(snapshot.count(DispatchPath::Fallback, op), 1, "{op}");
        assert_eq!(snapshot.count(DispatchPath::Compiled, op), 0, "{op}");
    }
    let stats = graph.dispatch_stats();
    assert_eq!(stats.demotions, 1);
    assert_eq!(stats.regions_dispatched, 0);
    Ok(())
}

#[test]
fn demotion_never_partially_compiles_a_region() -> Result<()> {
    // The region mixes rank-1 and rank-2 tensors; only the rank-2 node breaks the limit.
    let graph = arena(rank_limited(1), RuntimeConfig::default())?;
    let v = graph.tensor(&tensor(&[2], vec![1.0, 2.0]))?;
    let grown = v.exp()?.reshape(&[1, 2])?;
    graph.synchronize()?;

    let snapshot = graph.counters().snapshot();
    assert_eq!(snapshot.get("fallback::exp"), 1);
    assert_eq!(snapshot.get("fallback::reshape"), 1);
    assert!(snapshot.names().all(|name| name.starts_with("fallback::")));
    assert_eq!(grown.shape().dims(), &[1, 2]);
    Ok(())
}

#[test]
fn fallback_node_splits_compiled_chain() -> Result<()> {
    let graph = cpu_arena()?;
    let x = graph.tensor(&tensor(&[3], vec![-1.0, 0.0, 1.0]))?;
    let chain = x.exp()?.mul(&x)?.neg()?;
    graph.synchronize()?;
    assert_eq!(graph.dispatch_stats().regions_dispatched, 1);

    let split = x.exp()?.clamp(Some(0.5), None)?.neg()?;
    graph.synchronize()?;
    assert_eq!(graph.dispatch_stats().regions_dispatched, 3);
    assert_eq!(graph.counters().get(DispatchPath::Fallback, OpKind::Clamp), 1);
    assert_eq!(graph.counters().get(DispatchPath::Compiled, OpKind::Neg), 2);

    assert!(!chain.is_pending() && !split.is_pending());
    Ok(())
}

#[test]
fn regions_never_wrap_around_a_fallback_node() -> Result<()> {
    // sum -> clamp -> product, with product also reading sum directly: merging product into
    // sum's region would make the region both feed and consume the clamp.
    let graph = cpu_arena()?;
    let a = graph.tensor(&tensor(&[2], vec![1.0, 4.0]))?;
    let b = graph.tensor(&tensor(&[2], vec![1.0, 1.0]))?;
    let sum = a.add(&b)?;
    let capped = sum.clamp(None, Some(3.0))?;
    let product = sum.mul(&capped)?;

    assert_eq!(product.to_host()?.as_f32()?, &[4.0, 15.0]);
    assert_eq!(graph.dispatch_stats().regions_dispatched, 2);
    Ok(())
}

#[test]
fn region_size_is_capped() -> Result<()> {
    let graph = arena(
        CpuBackend::new(),
        RuntimeConfig::default().max_region_nodes(2),
    )?;
    let x = graph.tensor(&Tensor::scalar(0.5))?;
    let y = x.exp()?.log()?.exp()?.log()?.exp()?;
    let value = y.to_host()?.as_f32()?[0];
    assert!((value - 0.5f32.exp()).abs() < 1e-5);

    assert_eq!(graph.dispatch_stats().regions_dispatched, 3);
    let snapshot = graph.counters().snapshot();
    assert_eq!(snapshot.get("compiled::exp"), 3);
    assert_eq!(snapshot.get("compiled::log"), 2);
    Ok(())
}

#[test]
fn identical_regions_compile_once() -> Result<()> {
    let graph = arena(CountingBackend::new(CpuBackend::new()), RuntimeConfig::default())?;
    let mut results = Vec::new();
    for seed in [1.0f32, 2.0] {
        let x = graph.tensor(&tensor(&[2], vec![seed, -seed]))?;
        results.push(x.mul(&x)?.sqrt()?.to_host()?);
    }
    assert_eq!(results[0].as_f32()?, &[1.0, 1.0]);
    assert_eq!(results[1].as_f32()?, &[2.0, 2.0]);

    let stats = graph.dispatch_stats();
    assert_eq!(graph.backend().compiles(), 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.regions_dispatched, 2);
    assert_eq!(graph.cached_regions(), 1);
    Ok(())
}

#[test]
fn rejections_are_cached_too() -> Result<()> {
    let backend = CountingBackend::new(rank_limited(0));
    let graph = arena(backend, RuntimeConfig::default())?;
    for _ in 0..2 {
        let x = graph.tensor(&tensor(&[2], vec![1.0, 4.0]))?;
        assert_eq!(x.sqrt()?.to_host()?.as_f32()?, &[1.0, 2.0]);
    }
    let stats = graph.dispatch_stats();
    assert_eq!(graph.backend().compiles(), 1);
    assert_eq!(graph.backend().kernels(), 2);
    assert_eq!(stats.demotions, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(graph.counters().get(DispatchPath::Fallback, OpKind::Sqrt), 2);
    Ok(())
}

#[test]
fn differently_shaped_regions_compile_separately() -> Result<()> {
    let graph = arena(CountingBackend::new(CpuBackend::new()), RuntimeConfig::default())?;
    for dims in [[2usize, 2], [4, 1]] {
        let x = graph.tensor(&Tensor::zeros(lazy_rs::Shape::new(dims)))?;
        x.exp()?.to_host()?;
    }
    assert_eq!(graph.backend().compiles(), 2);
    assert_eq!(graph.cached_regions(), 2);
    Ok(())
}

#[test]
fn independent_producers_share_their_consumer_region() -> Result<()> {
    let graph = cpu_arena()?;
    let x = graph.tensor(&tensor(&[2], vec![0.0, 1.0]))?;
    let y = graph.tensor(&tensor(&[2], vec![2.0, 3.0]))?;
    let sum = x.exp()?.add(&y.neg()?)?;
    graph.synchronize()?;

    assert_eq!(graph.dispatch_stats().regions_dispatched, 1);
    let snapshot = graph.counters().snapshot();
    for name in ["compiled::exp", "compiled::neg", "compiled::add"] {
        assert_eq!(snapshot.get(name), 1, "{name}");
    }
    let values = sum.to_host()?;
    assert_eq!(values.as_f32()?, &[-1.0, 1.0f32.exp() - 3.0]);
    Ok(())
}

#[test]
fn fused_producers_are_demoted_together() -> Result<()> {
    // Only the rank-2 branch breaks the limit, yet the rank-1 branch falls back with it.
    let graph = arena(rank_limited(1), RuntimeConfig::default())?;
    let m = graph.tensor(&tensor(&[2, 2], vec![0.0; 4]))?;
    let v = graph.tensor(&tensor(&[2], vec![1.0, 2.0]))?;
    let out = m.exp()?.add(&v.neg()?)?;
    assert_eq!(out.to_host()?.as_f32()?, &[0.0, -1.0, 0.0, -1.0]);

    let snapshot = graph.counters().snapshot();
    for op in [OpKind::Exp, OpKind::Neg, OpKind::Add] {
        assert_eq!(snapshot.count(DispatchPath::Fallback, op), 1, "{op}");
    }
    let stats = graph.dispatch_stats();
    assert_eq!(stats.demotions, 1);
    assert_eq!(stats.regions_dispatched, 0);
    Ok(())
}
