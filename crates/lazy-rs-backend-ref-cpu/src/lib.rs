//! Reference CPU backend for `lazy-rs`.
//!
//! Kernels are straightforward loops over dense row-major buffers. They favour readability over
//! speed and serve as the numeric ground truth for tests. The region compiler validates a region
//! against the backend's limits and lowers it into an interpreter over the same kernels.

mod compiler;
pub mod cpu;

pub use compiler::CpuCompiledRegion;
pub use cpu::{
    execute_operation, CpuBackend, CpuBackendOptions, CpuKernelInterceptor, CpuTensor,
    GenericCpuBackend, NoopInterceptor,
};
