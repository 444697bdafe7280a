//! Lazy graph infrastructure.
//!
//! The graph layer records tensor operations in arena-backed graphs. Builders import tensors and
//! record nodes; the arena's scheduler drains pending nodes through the dispatch engine when a
//! synchronization point is reached or host data is requested.
mod arena;
mod builder;
pub(crate) mod scheduler;
pub(crate) mod state;
pub mod timing;

pub use arena::{ArenaBuilder, GraphArena};
pub use builder::GraphBuilder;
