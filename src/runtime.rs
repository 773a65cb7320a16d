//! Callback execution runtime.
//!
//! Finished-callbacks never run under the dispatcher lock. They are collected
//! during a dispatch pass and executed afterwards, either inline on the
//! publishing thread or on a small bounded worker pool so that slow user code
//! does not stall publishers.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{EventError, EventResult, ExecutionError};

/// Where a callback runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackPolicy {
    /// On the thread that produced the match, after the dispatch pass.
    Inline,
    /// On the dispatcher's callback pool; falls back to inline when the pool
    /// is saturated or unavailable.
    #[default]
    Concurrent,
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of named worker threads draining a job queue.
pub(crate) struct CallbackPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl CallbackPool {
    pub(crate) fn start(workers: usize, queue_capacity: usize) -> EventResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut pool = Self {
            tx: Some(tx),
            workers: Vec::with_capacity(workers),
            queue_capacity,
        };
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let name = format!("eventcore-callback-{idx}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|e| {
                    EventError::Execution(ExecutionError::SpawnFailed {
                        name,
                        message: e.to_string(),
                    })
                })?;
            pool.workers.push(handle);
        }
        tracing::debug!(workers, queue_capacity, "callback pool started");
        Ok(pool)
    }

    /// Queues `job`, handing it back when the queue is full or closed.
    pub(crate) fn try_submit(&self, job: Job) -> Result<(), (Job, EventError)> {
        let Some(tx) = &self.tx else {
            return Err((job, EventError::Execution(ExecutionError::DispatcherGone)));
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err((
                job,
                EventError::Execution(ExecutionError::QueueFull {
                    capacity: self.queue_capacity,
                }),
            )),
            Err(TrySendError::Disconnected(job)) => {
                Err((job, EventError::Execution(ExecutionError::DispatcherGone)))
            }
        }
    }

    fn shutdown(&mut self) {
        // Workers drain queued jobs then exit once the channel closes.
        drop(self.tx.take());
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last handle to the dispatcher may be released by a callback.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = CallbackPool::start(2, 16).unwrap();
        let (tx, rx) = bounded::<usize>(4);
        for i in 0..4 {
            let tx = tx.clone();
            pool.try_submit(Box::new(move || {
                let _ = tx.send(i);
            }))
            .map_err(|(_, e)| e)
            .unwrap();
        }
        let mut got: Vec<usize> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_full_queue_hands_job_back() {
        let pool = CallbackPool::start(1, 1).unwrap();
        let (block_tx, block_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        // Occupy the single worker.
        pool.try_submit(Box::new(move || {
            let _ = started_tx.send(());
            let _ = block_rx.recv();
        }))
        .map_err(|(_, e)| e)
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // Fill the queue.
        pool.try_submit(Box::new(|| {})).map_err(|(_, e)| e).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let (job, err) = pool
            .try_submit(Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Execution(ExecutionError::QueueFull { capacity: 1 })
        ));

        job();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let _ = block_tx.send(());
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = CallbackPool::start(1, 8).unwrap();
            for _ in 0..5 {
                let c = Arc::clone(&counter);
                pool.try_submit(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
                .map_err(|(_, e)| e)
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
