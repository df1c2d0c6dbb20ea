//! Control-path barrier into a queue's datapath
//!
//! Control code never touches datapath state directly while the queue is
//! active. It queues a callback here, asks the interface for an RX flush, and
//! blocks until the datapath drains the queue from inside `flush_receive`.

use crossbeam_channel::{Receiver, Sender};
use crossbeam_queue::SegQueue;

/// Callback run against the datapath state at the next flush
pub(crate) type SyncCallback<D> = Box<dyn FnOnce(&mut D) + Send>;

struct SyncEntry<D> {
    callback: SyncCallback<D>,
    done: Sender<()>,
}

/// Pending control callbacks for one queue
pub(crate) struct QueueSync<D> {
    pending: SegQueue<SyncEntry<D>>,
}

impl<D> QueueSync<D> {
    pub(crate) fn new() -> Self {
        Self {
            pending: SegQueue::new(),
        }
    }

    /// Queue `callback`. The returned receiver fires once it has run.
    pub(crate) fn enqueue(&self, callback: SyncCallback<D>) -> Receiver<()> {
        let (done, complete) = crossbeam_channel::bounded(1);
        self.pending.push(SyncEntry { callback, done });
        complete
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Run every queued callback in FIFO order. Returns how many ran.
    pub(crate) fn run_pending(&self, datapath: &mut D) -> usize {
        let mut ran = 0;
        while let Some(entry) = self.pending.pop() {
            (entry.callback)(datapath);
            // Waiter may have given up; nothing to report then.
            let _ = entry.done.send(());
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_callbacks_run_in_order() {
        let sync = QueueSync::<Vec<u32>>::new();
        let first = sync.enqueue(Box::new(|v| v.push(1)));
        let second = sync.enqueue(Box::new(|v| v.push(2)));
        assert!(sync.has_pending());

        let mut state = Vec::new();
        assert_eq!(sync.run_pending(&mut state), 2);
        assert_eq!(state, vec![1, 2]);
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
        assert!(!sync.has_pending());
    }

    #[test]
    fn test_waiter_unblocks_on_flush() {
        let sync = Arc::new(QueueSync::<u32>::new());
        let done = sync.enqueue(Box::new(|v| *v += 5));

        let flusher = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let mut state = 0;
                sync.run_pending(&mut state);
                state
            })
        };

        done.recv().unwrap();
        assert_eq!(flusher.join().unwrap(), 5);
    }
}
