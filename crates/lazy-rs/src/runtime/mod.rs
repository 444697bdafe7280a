//! Asynchronous execution targets.
//!
//! `synchronize` hands every dispatched unit to a [`DeviceQueue`] and returns once the work is
//! queued. Results travel through write-once value slots that later jobs and host reads wait on.
mod queue;

pub use queue::{DeviceFuture, DeviceQueue, InlineQueue, Job, WorkerQueue};
pub(crate) use queue::{panic_message, Promise};
