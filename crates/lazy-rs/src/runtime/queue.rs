//! Device queues and the promises used to hand results across them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Result, RuntimeError};

/// Unit of device work. The job itself publishes its outputs; the returned status completes
/// the job's [`DeviceFuture`].
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Write-once cell that readers block on.
pub(crate) struct Promise<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Promise<T> {
    pub(crate) fn new() -> Self {
        Promise {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub(crate) fn fulfilled(value: T) -> Self {
        Promise {
            inner: Arc::new((Mutex::new(Some(value)), Condvar::new())),
        }
    }

    /// Stores `value` unless the promise already holds one. Returns whether it was stored.
    pub(crate) fn fulfill(&self, value: T) -> bool {
        let (slot, ready) = &*self.inner;
        let mut guard = slot.lock().expect("promise poisoned");
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        ready.notify_all();
        true
    }

    pub(crate) fn wait(&self) -> T {
        let (slot, ready) = &*self.inner;
        let mut guard = slot.lock().expect("promise poisoned");
        loop {
            if let Some(value) = guard.as_ref() {
                return value.clone();
            }
            guard = ready.wait(guard).expect("promise poisoned");
        }
    }

    pub(crate) fn peek(&self) -> Option<T> {
        let (slot, _) = &*self.inner;
        slot.lock().expect("promise poisoned").clone()
    }
}

/// Completion handle for one enqueued job.
#[derive(Clone)]
pub struct DeviceFuture {
    status: Promise<Result<()>>,
}

impl DeviceFuture {
    /// A future that completes when [`complete`](Self::complete) is called.
    pub fn new() -> Self {
        DeviceFuture {
            status: Promise::new(),
        }
    }

    pub fn ready(result: Result<()>) -> Self {
        DeviceFuture {
            status: Promise::fulfilled(result),
        }
    }

    /// Records the job's outcome. Later calls are ignored.
    pub fn complete(&self, result: Result<()>) {
        self.status.fulfill(result);
    }

    /// Blocks until the job finishes and returns its status.
    pub fn wait(&self) -> Result<()> {
        self.status.wait()
    }

    pub fn is_complete(&self) -> bool {
        self.status.peek().is_some()
    }

    /// Status of a completed job, `None` while it is still queued or running.
    pub fn try_result(&self) -> Option<Result<()>> {
        self.status.peek()
    }
}

impl Default for DeviceFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFuture")
            .field("status", &self.status.peek())
            .finish()
    }
}

/// FIFO execution target for dispatched units.
///
/// Implementations must run jobs in enqueue order; the scheduler relies on it so a producer's
/// counter increment precedes its consumers'.
pub trait DeviceQueue: Send + Sync {
    fn enqueue(&self, job: Job) -> DeviceFuture;

    /// Whether jobs have finished by the time `enqueue` returns. Synchronous queues let the
    /// scheduler report kernel failures from `synchronize` itself.
    fn is_synchronous(&self) -> bool {
        false
    }
}

/// Runs every job on the calling thread before `enqueue` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl DeviceQueue for InlineQueue {
    fn enqueue(&self, job: Job) -> DeviceFuture {
        DeviceFuture::ready(run_guarded(job))
    }

    fn is_synchronous(&self) -> bool {
        true
    }
}

/// Single background thread draining jobs in FIFO order.
pub struct WorkerQueue {
    sender: Mutex<Option<Sender<(Job, DeviceFuture)>>>,
    worker: Option<JoinHandle<()>>,
}

impl WorkerQueue {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<(Job, DeviceFuture)>();
        let worker = thread::Builder::new()
            .name("lazy-rs-device".into())
            .spawn(move || {
                for (job, future) in receiver {
                    future.complete(run_guarded(job));
                }
                log::trace!("device worker drained");
            })
            .map_err(|err| RuntimeError::DeviceQueue {
                message: format!("failed to spawn device worker: {err}"),
            })?;
        Ok(WorkerQueue {
            sender: Mutex::new(Some(sender)),
            worker: Some(worker),
        })
    }
}

impl DeviceQueue for WorkerQueue {
    fn enqueue(&self, job: Job) -> DeviceFuture {
        let future = DeviceFuture::new();
        let sender = self.sender.lock().expect("device queue poisoned");
        let sent = match sender.as_ref() {
            Some(sender) => sender.send((job, future.clone())).is_ok(),
            None => false,
        };
        if !sent {
            future.complete(Err(RuntimeError::DeviceQueue {
                message: "device worker has shut down".into(),
            }));
        }
        future
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("device worker panicked during shutdown");
            }
        }
    }
}

fn run_guarded(job: Job) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        Err(RuntimeError::DeviceQueue {
            message: format!("device job panicked: {}", panic_message(payload.as_ref())),
        })
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn inline_queue_runs_before_returning() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let future = InlineQueue.enqueue(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert!(future.is_complete());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_queue_preserves_order() {
        let queue = WorkerQueue::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let futures: Vec<_> = (0..16)
            .map(|idx| {
                let log = Arc::clone(&log);
                queue.enqueue(Box::new(move || {
                    log.lock().unwrap().push(idx);
                    Ok(())
                }))
            })
            .collect();
        for future in &futures {
            future.wait().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_reports_failure() {
        let future = InlineQueue.enqueue(Box::new(|| -> Result<()> { panic!("boom") }));
        let err = future.wait().unwrap_err();
        assert!(matches!(err, RuntimeError::DeviceQueue { .. }));
    }

    #[test]
    fn promise_keeps_first_value() {
        let promise = Promise::new();
        assert!(promise.fulfill(1));
        assert!(!promise.fulfill(2));
        assert_eq!(promise.wait(), 1);
    }
}
