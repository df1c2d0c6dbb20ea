//! Per-interface serialized control work
//!
//! Every control operation touching an interface's queues runs on that
//! interface's work queue: one named thread draining a FIFO channel. A call
//! issued from the worker thread itself runs inline, so queued work may
//! issue further control calls without deadlocking on itself.

use crate::error::{DatapathError, Result};
use crossbeam_channel::Sender;
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded FIFO executor for control work
pub struct WorkQueue {
    name: String,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl WorkQueue {
    /// Spawn the worker thread
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .map_err(|e| DatapathError::Exhausted(format!("failed to spawn {name}: {e}")))?;
        let worker_id = handle.thread().id();

        tracing::debug!(work_queue = %name, "work queue started");

        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(handle),
            worker_id,
        })
    }

    /// Worker thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is running on the worker thread
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Queue `job` without waiting for it
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DatapathError::DeviceRemoved(self.name.clone()))?;
        sender
            .send(Box::new(job))
            .map_err(|_| DatapathError::DeviceRemoved(self.name.clone()))
    }

    /// Run `job` on the worker thread and wait for its result
    pub fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker_thread() {
            return Ok(job());
        }

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        self.submit(move || {
            let _ = result_tx.send(job());
        })?;
        result_rx.recv().map_err(|_| DatapathError::Cancelled)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            // The last reference may be released by a job on the worker itself.
            if !self.is_worker_thread() {
                let _ = handle.join();
            }
        }
        tracing::debug!(work_queue = %self.name, "work queue stopped");
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_run_returns_value() {
        let wq = WorkQueue::new("sluice-test-wq").unwrap();
        assert_eq!(wq.run(|| 6 * 7).unwrap(), 42);
        assert!(!wq.is_worker_thread());
    }

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let wq = WorkQueue::new("sluice-test-fifo").unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = Arc::clone(&order);
            wq.submit(move || order.lock().push(i)).unwrap();
        }
        wq.run(|| ()).unwrap();
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_nested_run_executes_inline() {
        let wq = Arc::new(WorkQueue::new("sluice-test-nested").unwrap());
        let counter = Arc::new(AtomicU32::new(0));

        let inner_wq = Arc::clone(&wq);
        let inner_counter = Arc::clone(&counter);
        let nested = wq
            .run(move || {
                let on_worker = inner_wq.is_worker_thread();
                inner_wq
                    .run(move || inner_counter.fetch_add(1, Ordering::SeqCst))
                    .map(|_| on_worker)
            })
            .unwrap()
            .unwrap();

        assert!(nested);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
