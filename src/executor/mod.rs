//! Bounded OCR executor.
//!
//! A fixed-size worker pool that accepts opaque boxed jobs and runs
//! them one at a time per worker. The pool itself knows nothing about
//! OCR, hashes or caches — it only guarantees that at most
//! `EXECUTOR_MAX_WORKERS` jobs run concurrently and that submissions
//! queue (unboundedly) rather than being rejected. The model singleton
//! lives in [`model`]; the job semantics that tie hash, coalescer and
//! cache together live in [`crate::upload`].

pub mod model;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

type BoxedJob = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Fixed-size worker pool. Cloning shares the same queue and workers.
#[derive(Clone)]
pub struct Executor {
    tx: mpsc::UnboundedSender<BoxedJob>,
}

impl Executor {
    /// Spawn `workers` background tasks pulling from one shared queue.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<BoxedJob>();
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    match next {
                        Some(job) => job().await,
                        None => break,
                    }
                }
            });
        }

        Self { tx }
    }

    /// Queue `job` and await its result. The future completes once a
    /// worker picks the job up and runs it to completion.
    pub async fn submit<F, Fut, T>(&self, job: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let boxed: BoxedJob = Box::new(move || {
            Box::pin(async move {
                let result = job().await;
                let _ = result_tx.send(result);
            })
        });

        // An unbounded channel only fails to send if every worker task
        // has panicked and dropped its receiver; there is no recovery
        // from that short of restarting the process.
        self.tx.send(boxed).expect("executor worker pool is gone");

        result_rx.await.expect("executor dropped job result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn submit_runs_job_and_returns_result() {
        let executor = Executor::new(2);
        let result = executor.submit(|| async { 1 + 1 }).await;
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn single_worker_serializes_jobs() {
        let executor = Executor::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let executor = executor.clone();
            let counter = counter.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .submit(move || async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
