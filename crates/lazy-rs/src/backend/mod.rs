//! Backend contract consumed by the dispatch engine.
//!
//! A backend supplies two collaborators: per-instruction kernels used by the fallback path and a
//! region compiler used by the compiled path. Both operate on opaque backend tensor handles.

pub mod hashing;
pub mod spec;
