//! Operation identities, attributes, shape rules, and the lazy graph machinery that records
//! them.
pub mod attrs;
pub mod graph;
pub mod registry;
pub mod shape_rules;
mod tensor_ops;
pub mod trace;
