//! Tensor metadata, host-side buffers, and the lazy handles returned by graph recording.
//!
//! Shapes and dtypes are always known eagerly, even for handles whose data has not been
//! computed yet. Host tensors are the exchange format with backends when data moves in or out.

pub mod dtype;
mod host_tensor;
mod lazy_tensor;
pub mod shape;

pub use crate::backend::spec::TensorSpec;
pub use dtype::DType;
pub use host_tensor::{Tensor, TensorData};
pub use lazy_tensor::LazyTensor;
pub(crate) use lazy_tensor::ValueToken;
pub use shape::Shape;
