use std::sync::{
    atomic::{AtomicU64, Ordering as AtomicOrdering},
    Arc, Mutex,
};

use log::{debug, warn};

use crate::backend::spec::{PortableBackend, TensorSpec, ValueId};
use crate::config::RuntimeConfig;
use crate::counters::CounterRegistry;
use crate::dispatch::engine::DispatchEngine;
use crate::dispatch::DispatchStats;
use crate::error::{Result, RuntimeError};
use crate::ops::attrs::Attributes;
use crate::ops::registry::{OpKind, OpRegistry};
use crate::runtime::{DeviceFuture, DeviceQueue, InlineQueue};
use crate::tensor::{LazyTensor, Tensor};

use super::builder::GraphBuilder;
use super::scheduler;
use super::state::{GraphInner, ValueState};

static ARENA_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Central storage for one lazy tensor graph on top of a single backend instance.
///
/// Recording appends pending nodes; [`synchronize`](Self::synchronize) drains them through the
/// dispatch engine onto the device queue. Handles returned by the arena keep it alive.
pub struct GraphArena<B: PortableBackend + 'static> {
    backend: Arc<B>,
    registry: Arc<OpRegistry>,
    counters: Arc<CounterRegistry>,
    engine: DispatchEngine<B>,
    config: RuntimeConfig,
    inner: Mutex<GraphInner<B>>,
    outstanding: Mutex<Vec<DeviceFuture>>,
    id: u64,
}

/// Configures the collaborators of a [`GraphArena`].
pub struct ArenaBuilder<B: PortableBackend + 'static> {
    backend: Arc<B>,
    registry: Option<Arc<OpRegistry>>,
    counters: Option<Arc<CounterRegistry>>,
    queue: Option<Arc<dyn DeviceQueue>>,
    config: Option<RuntimeConfig>,
}

impl<B: PortableBackend + 'static> ArenaBuilder<B> {
    pub fn registry(mut self, registry: Arc<OpRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Shares a counter registry, e.g. across several arenas.
    pub fn counters(mut self, counters: Arc<CounterRegistry>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn DeviceQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Uses `config` verbatim. Without it the arena reads `LAZYRS_*` overrides.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Arc<GraphArena<B>>> {
        let config = match &self.config {
            Some(config) => {
                config.validate()?;
                config.clone()
            }
            None => RuntimeConfig::from_env()?,
        };
        Ok(self.assemble(config))
    }

    fn assemble(self, config: RuntimeConfig) -> Arc<GraphArena<B>> {
        let id = ARENA_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(CounterRegistry::new()));
        let queue = self.queue.unwrap_or_else(|| Arc::new(InlineQueue));
        let engine = DispatchEngine::new(
            Arc::clone(&self.backend),
            Arc::clone(&counters),
            queue,
            config.region_cache_capacity,
            id,
        );
        debug!(
            "graph {id}: created on backend {} ({config:?})",
            self.backend.backend_name()
        );
        Arc::new(GraphArena {
            backend: self.backend,
            registry: self.registry.unwrap_or_else(OpRegistry::default_registry),
            counters,
            engine,
            config,
            inner: Mutex::new(GraphInner::new()),
            outstanding: Mutex::new(Vec::new()),
            id,
        })
    }
}

impl<B: PortableBackend + 'static> GraphArena<B> {
    /// Creates an arena with the default registry, a private counter registry, and an inline
    /// queue. Invalid `LAZYRS_*` overrides are reported and ignored.
    pub fn new(backend: Arc<B>) -> Arc<Self> {
        let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
            warn!("{err}; using default runtime configuration");
            RuntimeConfig::default()
        });
        Self::builder(backend).assemble(config)
    }

    pub fn builder(backend: Arc<B>) -> ArenaBuilder<B> {
        ArenaBuilder {
            backend,
            registry: None,
            counters: None,
            queue: None,
            config: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the underlying backend handle.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.engine.stats()
    }

    /// Number of compiled (or rejected) region signatures currently cached.
    pub fn cached_regions(&self) -> usize {
        self.engine.cached_regions()
    }

    /// Captures a sequence of graph edits, exposing a [`GraphBuilder`] to the caller.
    /// In eager mode the graph is synchronized once the closure returns successfully.
    pub fn capture<R, F>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(&mut GraphBuilder<B>) -> Result<R>,
    {
        let result = {
            let mut inner = self.inner.lock().expect("graph arena poisoned");
            let mut builder = GraphBuilder {
                arena: Arc::clone(self),
                inner: &mut *inner,
            };
            f(&mut builder)?
        };
        if self.config.eager {
            self.synchronize()?;
        }
        Ok(result)
    }

    /// Imports a host tensor as a realized handle.
    pub fn tensor(self: &Arc<Self>, tensor: &Tensor) -> Result<LazyTensor<B>> {
        self.capture(|builder| builder.import(tensor))
    }

    /// Records one operation and returns its output handles.
    pub fn record(
        self: &Arc<Self>,
        op: OpKind,
        inputs: &[&LazyTensor<B>],
        attrs: Attributes,
    ) -> Result<Vec<LazyTensor<B>>> {
        self.capture(|builder| builder.record(op, inputs, attrs))
    }

    /// Records an operation given by name or alias.
    pub fn record_named(
        self: &Arc<Self>,
        name: &str,
        inputs: &[&LazyTensor<B>],
        attrs: Attributes,
    ) -> Result<Vec<LazyTensor<B>>> {
        self.capture(|builder| builder.record_named(name, inputs, attrs))
    }

    /// Records a single-output operation.
    pub fn record_one(
        self: &Arc<Self>,
        op: OpKind,
        inputs: &[&LazyTensor<B>],
        attrs: Attributes,
    ) -> Result<LazyTensor<B>> {
        if op.output_count() != 1 {
            return Err(RuntimeError::ShapeInference {
                op,
                reason: format!("produces {} outputs, expected one", op.output_count()),
            });
        }
        let mut outputs = self.record(op, inputs, attrs)?;
        Ok(outputs.remove(0))
    }

    /// Dispatches every pending node reachable from a live handle.
    ///
    /// Units run in topological order with creation order as the tie-break. On failure, units
    /// dispatched before the failing one stay realized and the rest stay pending. Returns once
    /// the work is queued; see [`block_until_complete`](Self::block_until_complete).
    pub fn synchronize(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("graph arena poisoned");
        let discarded = scheduler::discard_unreachable(&mut inner);
        if discarded > 0 {
            debug!("graph {}: discarded {discarded} unreachable node(s)", self.id);
        }
        if inner.nodes.is_empty() {
            scheduler::collect_garbage(&mut inner);
            return Ok(());
        }

        let schedule = scheduler::plan(&inner, &self.registry, &self.config)?;
        debug!(
            "graph {}: synchronizing {} node(s) in {} unit(s)",
            self.id,
            schedule.nodes.len(),
            schedule.units.len()
        );
        let mut queued = Vec::new();
        let mut outcome = Ok(());
        for unit in &schedule.units {
            if let Err(err) = self
                .engine
                .dispatch(&mut inner, &schedule.nodes, unit, &mut queued)
            {
                outcome = Err(err);
                break;
            }
        }
        self.outstanding
            .lock()
            .expect("device futures poisoned")
            .extend(queued);
        let released = scheduler::collect_garbage(&mut inner);
        if released > 0 {
            debug!("graph {}: released {released} value(s)", self.id);
        }
        outcome
    }

    /// Waits for all device work queued by earlier synchronizations and reports the first
    /// asynchronous failure. Pending nodes are left untouched.
    pub fn block_until_complete(&self) -> Result<()> {
        let futures = std::mem::take(&mut *self.outstanding.lock().expect("device futures poisoned"));
        let mut first_error = None;
        for future in futures {
            if let Err(err) = future.wait() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of recorded nodes not yet dispatched.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("graph arena poisoned").nodes.len()
    }

    /// Number of values (pending or realized) the arena still tracks.
    pub fn value_count(&self) -> usize {
        self.inner.lock().expect("graph arena poisoned").values.len()
    }

    pub fn tensor_spec_for(&self, value: ValueId) -> Option<TensorSpec> {
        let inner = self.inner.lock().expect("graph arena poisoned");
        inner.values.get(&value).map(|record| record.spec.clone())
    }

    pub fn is_pending(&self, value: ValueId) -> bool {
        let inner = self.inner.lock().expect("graph arena poisoned");
        matches!(
            inner.values.get(&value).map(|record| &record.state),
            Some(ValueState::Pending)
        )
    }

    /// Synchronizes, waits for `value`, and copies it to the host.
    pub fn read(&self, value: ValueId) -> Result<Tensor> {
        self.synchronize()?;
        let slot = self
            .inner
            .lock()
            .expect("graph arena poisoned")
            .ready_slot(value)?;
        let handle = slot.wait()?;
        self.backend
            .to_host(&handle)
            .map_err(|err| RuntimeError::Transfer {
                message: err.to_string(),
            })
    }
}
