//! Per-thread FIFO work queues.
//!
//! `enqueue` appends a task to the queue for a key and returns a receiver
//! for its result. Each key has at most one drain worker at a time; the
//! per-key record is deleted when its queue empties. For a single key,
//! tasks execute in submission order and never overlap.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Keyed FIFO queue with one drain worker per live key.
#[derive(Default, Clone)]
pub struct ThreadQueues {
    inner: Arc<Mutex<HashMap<String, VecDeque<Job>>>>,
}

impl std::fmt::Debug for ThreadQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadQueues").finish_non_exhaustive()
    }
}

impl ThreadQueues {
    /// Create an empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Append `task` to the queue for `key`.
    ///
    /// Returns a receiver resolving to the task's output once it has run.
    /// The receiver errors only if the runtime is shutting down before the
    /// task executes.
    pub fn enqueue<F, T>(&self, key: &str, task: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(task.await);
        });

        let spawn_worker = {
            let Ok(mut queues) = self.inner.lock() else {
                return rx;
            };
            match queues.get_mut(key) {
                Some(queue) => {
                    queue.push_back(job);
                    false
                }
                None => {
                    let mut queue = VecDeque::new();
                    queue.push_back(job);
                    queues.insert(key.to_owned(), queue);
                    true
                }
            }
        };

        if spawn_worker {
            let key = key.to_owned();
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain(key, inner));
        }

        rx
    }

    /// Number of live keys (waiting or executing).
    #[must_use]
    pub fn live_keys(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Drain the queue for `key` until it empties, then delete the record.
async fn drain(key: String, inner: Arc<Mutex<HashMap<String, VecDeque<Job>>>>) {
    loop {
        let job = {
            let Ok(mut queues) = inner.lock() else {
                return;
            };
            match queues.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(job) => job,
                None => {
                    queues.remove(&key);
                    debug!(key, "thread queue drained");
                    return;
                }
            }
        };
        job.await;
    }
}
