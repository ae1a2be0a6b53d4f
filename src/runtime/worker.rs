//! Bounded background worker pool for snapshot checks and log trimming.
//!
//! Low-priority, best-effort work: when the queue is full the oldest
//! pending task is discarded to make room. A dropped snapshot check is
//! retried at the next periodic boundary, so the drop is never
//! correctness-affecting.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Sender<Job>,
    // Kept so submit() can discard the oldest pending job when full.
    rx: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers sharing a queue of `queue_depth` slots.
    pub fn new(threads: usize, queue_depth: usize) -> WorkerPool {
        let (tx, rx) = bounded::<Job>(queue_depth.max(1));
        let workers = (0..threads.max(1))
            .map(|index| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("replog-worker-{}", index))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool { tx, rx, workers }
    }

    /// Enqueues `job`, discarding the oldest pending task if the queue is
    /// full.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let mut job: Job = Box::new(job);
        loop {
            match self.tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.rx.try_recv().is_ok() {
                        debug!("worker queue full, discarded oldest task");
                    }
                    job = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain what is queued and exit.
        drop(std::mem::replace(&mut self.tx, bounded::<Job>(1).0));
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new(2, 16);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = done.clone();
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // joins workers after the queue drains
        assert_eq!(10, done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_saturation_discards_oldest() {
        let pool = WorkerPool::new(1, 2);
        let ran = Arc::new(AtomicUsize::new(0));

        // Block the single worker so submissions pile up in the queue.
        // The start gate guarantees the blocker is running (not sitting in
        // the queue where drop-oldest could discard it).
        let started = Arc::new(std::sync::Barrier::new(2));
        let release = Arc::new(std::sync::Barrier::new(2));
        {
            let started = started.clone();
            let release = release.clone();
            pool.submit(move || {
                started.wait();
                release.wait();
            });
        }
        started.wait();

        for _ in 0..8 {
            let ran = ran.clone();
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        release.wait();
        drop(pool);

        // Queue held at most 2 of the 8; the rest were discarded.
        let completed = ran.load(Ordering::SeqCst);
        assert!(completed <= 2, "expected drop-oldest, ran {}", completed);
    }
}
