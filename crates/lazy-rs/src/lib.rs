//! Deferred-execution tensor runtime.
//!
//! Operations recorded against a [`GraphArena`](ops::graph::GraphArena) stay pending until
//! [`synchronize`](ops::graph::GraphArena::synchronize) drains the graph. Connected runs of
//! compiled-capable operations are lowered into compiled regions, everything else executes one
//! kernel at a time on the fallback path, and every dispatch is accounted for in a
//! [`CounterRegistry`].

pub mod backend;
pub mod config;
pub mod counters;
pub mod dispatch;
mod env;
pub mod error;
pub mod ops;
pub mod runtime;
pub mod tensor;

pub use backend::spec::PortableBackend;
pub use config::RuntimeConfig;
pub use counters::{CounterRegistry, CounterSnapshot, DispatchPath};
pub use dispatch::DispatchStats;
pub use error::{Result, RuntimeError};
pub use ops::attrs::{AttrValue, Attributes};
pub use ops::graph::{ArenaBuilder, GraphArena, GraphBuilder};
pub use ops::registry::{Classification, OpKind, OpRegistry};
pub use runtime::{DeviceFuture, DeviceQueue, InlineQueue, WorkerQueue};
pub use tensor::{DType, LazyTensor, Shape, Tensor, TensorData, TensorSpec};
