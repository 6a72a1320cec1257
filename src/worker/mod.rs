//! Bounded single-consumer worker queue.
//!
//! A [`BoundedWorker`] owns one handler thread fed from a fixed-capacity
//! channel. The producer side never blocks: [`BoundedWorker::try_send`]
//! fails when the queue is full, and the caller decides whether to shed the
//! item, clear the backlog, or both. Items reach the handler in enqueue
//! order.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

/// A fixed-capacity FIFO bound to a single consumer thread.
pub struct BoundedWorker<T: Send + 'static> {
    tx: Option<Sender<T>>,
    // Producer-side receiver clone, used only to drain pending items.
    drain: Receiver<T>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> BoundedWorker<T> {
    /// Spawn the handler thread. `handler` runs once per item, in enqueue
    /// order, until the worker is closed.
    pub fn spawn<F>(name: &str, capacity: usize, mut handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = bounded(capacity);
        let drain = rx.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for item in rx.iter() {
                    handler(item);
                }
            })
            .expect("failed to spawn worker thread");

        Self {
            tx: Some(tx),
            drain,
            thread: Some(thread),
        }
    }

    /// Enqueue without blocking. Returns false when the queue is full or the
    /// worker is closed.
    pub fn try_send(&self, item: T) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(item).is_ok(),
            None => false,
        }
    }

    /// Drop every item still waiting in the queue. Returns the number
    /// removed. The item currently inside the handler is unaffected.
    pub fn clear(&self) -> usize {
        self.drain.try_iter().count()
    }

    /// Number of items waiting in the queue.
    pub fn len(&self) -> usize {
        self.drain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new items, let the handler drain the backlog, and join
    /// the thread.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<T: Send + 'static> Drop for BoundedWorker<T> {
    fn drop(&mut self) {
        self.close();
    }
}
