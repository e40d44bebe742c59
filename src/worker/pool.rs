//! Bounded worker pools.
//!
//! # Responsibilities
//! - Queue jobs with backpressure (bounded channel)
//! - Run N persistent workers that execute jobs and submit responses
//! - Run key operations on the blocking thread pool, off the async workers
//! - Contain every execution failure, including panics, inside the job
//! - Stop cleanly: no new dequeues, in-flight jobs finish, workers are joined

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::ops::Executor;
use crate::protocol::ErrorCode;
use crate::worker::{Job, Response};

/// Error type for pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool '{0}' is shut down")]
    Closed(String),
}

/// A named queue of jobs serviced by a fixed set of workers.
pub struct WorkerPool {
    name: String,
    sender: mpsc::Sender<Job>,
    stop: watch::Sender<bool>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks servicing a queue of `queue_size` jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        workers: usize,
        queue_size: usize,
        executor: Arc<Executor>,
    ) -> Arc<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let (stop, _) = watch::channel(false);
        let queue = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|index| {
                let worker = Worker {
                    pool: name.clone(),
                    index,
                    queue: Arc::clone(&queue),
                    stop: stop.subscribe(),
                    executor: Arc::clone(&executor),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::debug!(pool = %name, workers, queue_size, "Worker pool started");

        Arc::new(Self {
            name,
            sender,
            stop,
            workers: StdMutex::new(handles),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job, waiting for room when the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), PoolError> {
        if *self.stop.borrow() {
            return Err(PoolError::Closed(self.name.clone()));
        }
        self.sender
            .send(job)
            .await
            .map_err(|_| PoolError::Closed(self.name.clone()))
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop dequeuing, let in-flight jobs finish and wait for every worker.
    ///
    /// Jobs still queued are dropped.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(pool = %self.name, error = %e, "Worker task failed");
            }
        }
        tracing::debug!(pool = %self.name, "Worker pool stopped");
    }
}

struct Worker {
    pool: String,
    index: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    stop: watch::Receiver<bool>,
    executor: Arc<Executor>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(job) = self.next_job().await {
            let response = self.execute(&job).await;
            let id = response.id;
            if !job.source.submit_result(response).await {
                tracing::debug!(
                    pool = %self.pool,
                    worker = self.index,
                    connection = %job.source.name(),
                    id,
                    "Connection gone, discarding response"
                );
            }
        }
        tracing::trace!(pool = %self.pool, worker = self.index, "Worker exiting");
    }

    /// Wait for the next job. `None` once the pool is stopping.
    async fn next_job(&mut self) -> Option<Job> {
        let mut queue = tokio::select! {
            biased;
            _ = self.stop.wait_for(|stopped| *stopped) => return None,
            guard = self.queue.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.stop.wait_for(|stopped| *stopped) => None,
            job = queue.recv() => job,
        }
    }

    /// Signing is CPU bound and synchronous, so it must not hold a runtime
    /// thread that connection readers and the control pool depend on.
    async fn execute(&self, job: &Job) -> Response {
        let executor = Arc::clone(&self.executor);
        let operation = job.packet.operation.clone();
        let outcome = match tokio::task::spawn_blocking(move || executor.execute(&operation)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    pool = %self.pool,
                    worker = self.index,
                    id = job.id(),
                    opcode = %job.opcode(),
                    error = %e,
                    "Operation panicked"
                );
                Err(ErrorCode::Internal)
            }
        };

        if let Err(code) = &outcome {
            tracing::debug!(
                pool = %self.pool,
                connection = %job.source.name(),
                id = job.id(),
                opcode = %job.opcode(),
                error = %code,
                "Operation failed"
            );
        }

        Response::for_job(job, outcome)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use futures_util::future::BoxFuture;

    use crate::ops::{KeyOperator, MemoryKeystore};
    use crate::protocol::{Op, Operation, Packet, Ski};
    use crate::worker::JobSource;

    /// Collects submitted responses in memory.
    #[derive(Default)]
    pub(crate) struct RecordingSource {
        pub responses: StdMutex<Vec<Response>>,
        pub dead: AtomicBool,
        pub notify: tokio::sync::Notify,
    }

    impl RecordingSource {
        pub(crate) fn responses(&self) -> Vec<Response> {
            self.responses.lock().unwrap().clone()
        }

        pub(crate) async fn wait_for(&self, count: usize) -> Vec<Response> {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let notified = self.notify.notified();
                    let current = self.responses();
                    if current.len() >= count {
                        return current;
                    }
                    notified.await;
                }
            })
            .await
            .expect("responses did not arrive")
        }
    }

    impl JobSource for RecordingSource {
        fn name(&self) -> &str {
            "recording"
        }

        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }

        fn submit_result(&self, response: Response) -> BoxFuture<'_, bool> {
            Box::pin(async move {
                if !self.is_alive() {
                    return false;
                }
                self.responses.lock().unwrap().push(response);
                self.notify.notify_waiters();
                true
            })
        }

        fn destroy(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move { !self.dead.swap(true, Ordering::SeqCst) })
        }
    }

    struct Panicker;

    impl KeyOperator for Panicker {
        fn sign(&self, _op: Op, _digest: &[u8]) -> Result<Vec<u8>, ErrorCode> {
            panic!("signer exploded");
        }
    }

    /// Holds its thread for `delay` before answering.
    struct Sluggish {
        delay: Duration,
    }

    impl KeyOperator for Sluggish {
        fn sign(&self, _op: Op, digest: &[u8]) -> Result<Vec<u8>, ErrorCode> {
            std::thread::sleep(self.delay);
            Ok(digest.to_vec())
        }
    }

    const SLOW_KEY: Ski = Ski([0x51; 20]);

    fn executor() -> Arc<Executor> {
        let keystore = MemoryKeystore::new();
        keystore.insert(Ski([0xEE; 20]), Arc::new(Panicker));
        keystore.insert(
            SLOW_KEY,
            Arc::new(Sluggish {
                delay: Duration::from_millis(400),
            }),
        );
        Arc::new(Executor::new(Arc::new(keystore)))
    }

    fn job(source: &Arc<RecordingSource>, id: u32, operation: Operation) -> Job {
        Job {
            packet: Packet::new(id, operation).unwrap(),
            received_at: Instant::now(),
            source: source.clone(),
        }
    }

    #[tokio::test]
    async fn failing_job_does_not_stop_worker() {
        let pool = WorkerPool::new("test", 1, 8, executor());
        let source = Arc::new(RecordingSource::default());

        let unknown_key = Operation::new(Op::RsaSignSha256, vec![1]).with_key(Ski([1; 20]), None);
        pool.submit(job(&source, 1, unknown_key)).await.unwrap();
        pool.submit(job(&source, 2, Operation::new(Op::Ping, b"ok".to_vec()))).await.unwrap();

        let responses = source.wait_for(2).await;
        assert_eq!(responses[0].id, 1);
        assert_eq!(responses[0].outcome, Err(ErrorCode::KeyNotFound));
        assert_eq!(responses[1].id, 2);
        assert_eq!(responses[1].outcome, Ok(b"ok".to_vec()));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_operation_becomes_internal_error() {
        let pool = WorkerPool::new("test", 1, 8, executor());
        let source = Arc::new(RecordingSource::default());

        let boom = Operation::new(Op::EcdsaSignSha256, vec![1]).with_key(Ski([0xEE; 20]), None);
        pool.submit(job(&source, 10, boom)).await.unwrap();
        pool.submit(job(&source, 11, Operation::new(Op::Ping, vec![]))).await.unwrap();

        let responses = source.wait_for(2).await;
        assert_eq!(responses[0].outcome, Err(ErrorCode::Internal));
        assert_eq!(responses[0].opcode, Op::EcdsaSignSha256);
        assert_eq!(responses[1].id, 11);

        pool.shutdown().await;
    }

    // The test runtime has a single thread, so a signer running on it would
    // hold the ping back until every slow sign finished.
    #[tokio::test]
    async fn slow_signs_do_not_starve_other_pools() {
        let executor = executor();
        let rsa = WorkerPool::new("rsa", 2, 8, Arc::clone(&executor));
        let control = WorkerPool::new("control", 1, 8, executor);
        let source = Arc::new(RecordingSource::default());

        for id in 1..=2 {
            let slow = Operation::new(Op::RsaSignSha256, vec![id as u8]).with_key(SLOW_KEY, None);
            rsa.submit(job(&source, id, slow)).await.unwrap();
        }
        tokio::task::yield_now().await;
        control.submit(job(&source, 99, Operation::new(Op::Ping, vec![]))).await.unwrap();

        let responses = source.wait_for(3).await;
        assert_eq!(responses[0].id, 99);
        assert_eq!(responses[1].outcome, Ok(vec![responses[1].id as u8]));

        rsa.shutdown().await;
        control.shutdown().await;
    }

    #[tokio::test]
    async fn dead_source_results_are_discarded() {
        let pool = WorkerPool::new("test", 1, 8, executor());
        let dead = Arc::new(RecordingSource::default());
        dead.destroy().await;
        let live = Arc::new(RecordingSource::default());

        pool.submit(job(&dead, 1, Operation::new(Op::Ping, vec![]))).await.unwrap();
        pool.submit(job(&live, 2, Operation::new(Op::Ping, vec![]))).await.unwrap();

        let responses = live.wait_for(1).await;
        assert_eq!(responses[0].id, 2);
        assert!(dead.responses().is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new("test", 2, 8, executor());
        pool.shutdown().await;
        assert!(pool.is_shut_down());

        let source = Arc::new(RecordingSource::default());
        let result = pool.submit(job(&source, 1, Operation::new(Op::Ping, vec![]))).await;
        assert!(matches!(result, Err(PoolError::Closed(name)) if name == "test"));
    }
}
