//! Dispatch policy: partitioning pending nodes into compiled regions and fallback singletons,
//! then lowering each unit onto the device queue.
pub(crate) mod engine;
pub(crate) mod region;

pub use engine::DispatchStats;
