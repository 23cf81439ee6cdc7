//! In-process worker pool
//!
//! One unbounded channel per queue; the workers of a queue share its
//! receiver. A failed delivery is re-sent after its backoff from a detached
//! task so the worker moves on to the next job meanwhile.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use larder_common::{Error, Result};

use super::{Dispatcher, EnqueueOptions, Job, JobHandler};

struct Queue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    /// Jobs accepted and not yet finally resolved
    in_flight: AtomicU64,
    has_workers: AtomicBool,
}

/// Pool counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub succeeded: u64,
    pub failed: u64,
    pub redelivered: u64,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    redelivered: AtomicU64,
}

struct Inner {
    queues: HashMap<String, Arc<Queue>>,
    shutdown: CancellationToken,
    idle: Notify,
    counters: Counters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Tokio worker pool implementing [`Dispatcher`]
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Create the named queues; workers are attached with [`WorkerPool::spawn_workers`]
    pub fn new(queues: &[&str], shutdown: CancellationToken) -> Self {
        let queues = queues
            .iter()
            .map(|name| {
                let (tx, rx) = mpsc::unbounded_channel();
                let queue = Queue {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    in_flight: AtomicU64::new(0),
                    has_workers: AtomicBool::new(false),
                };
                (name.to_string(), Arc::new(queue))
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                queues,
                shutdown,
                idle: Notify::new(),
                counters: Counters::default(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    fn queue(&self, name: &str) -> Result<&Arc<Queue>> {
        self.inner
            .queues
            .get(name)
            .ok_or_else(|| Error::Dispatch(format!("Unknown queue: {}", name)))
    }

    fn take_rx(&self, name: &str) -> Result<mpsc::UnboundedReceiver<Job>> {
        self.queue(name)?
            .rx
            .lock()
            .map_err(|_| Error::Internal("queue receiver lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::Dispatch(format!("Queue {} already has a consumer", name)))
    }

    /// Start `count` workers consuming the handler's queue
    pub fn spawn_workers(&self, handler: Arc<dyn JobHandler>, count: usize) -> Result<()> {
        let name = handler.queue().to_string();
        let rx = Arc::new(AsyncMutex::new(self.take_rx(&name)?));
        let queue = Arc::clone(self.queue(&name)?);
        queue.has_workers.store(true, Ordering::SeqCst);

        let mut workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| Error::Internal("worker list lock poisoned".to_string()))?;

        for worker_id in 0..count.max(1) {
            let inner = Arc::clone(&self.inner);
            let queue = Arc::clone(&queue);
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, inner, queue, rx, handler).await;
            }));
        }

        info!(queue = %name, workers = count.max(1), "Workers started");
        Ok(())
    }

    /// Hand a queue's jobs to an external consumer instead of local workers
    pub fn take_receiver(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Job>> {
        self.take_rx(queue)
    }

    /// Jobs accepted on `queue` and not yet resolved
    pub fn queue_depth(&self, queue: &str) -> Option<u64> {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.in_flight.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
        }
    }

    /// Wait until every queue with local workers has no unresolved jobs
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let busy = self
                .inner
                .queues
                .values()
                .filter(|q| q.has_workers.load(Ordering::SeqCst))
                .any(|q| q.in_flight.load(Ordering::SeqCst) > 0);
            if !busy {
                return;
            }
            notified.await;
        }
    }

    /// Cancel workers and pending redeliveries, then wait for workers to exit
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.inner.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<Inner>,
    queue: Arc<Queue>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>,
    handler: Arc<dyn JobHandler>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            }
        };

        debug!(
            worker_id,
            queue = %job.queue,
            job_id = %job.id,
            attempt = job.attempt,
            "Processing job"
        );

        match handler.handle(&job).await {
            Ok(()) => {
                inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                resolve(&inner, &queue);
            }
            Err(e) if e.is_logic_error() || job.is_last_attempt() => {
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempt = job.attempt,
                    attempts = job.options.attempts,
                    transient = e.is_transient(),
                    error = %e,
                    "Job failed permanently"
                );
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                resolve(&inner, &queue);
            }
            Err(e) if !e.is_transient() => {
                let delay = job.options.backoff.delay_for(job.attempt);
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed with unexpected error, scheduling redelivery"
                );
                inner.counters.redelivered.fetch_add(1, Ordering::Relaxed);
                redeliver(Arc::clone(&inner), Arc::clone(&queue), job, delay);
            }
            Err(e) => {
                let delay = job.options.backoff.delay_for(job.attempt);
                warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, scheduling redelivery"
                );
                inner.counters.redelivered.fetch_add(1, Ordering::Relaxed);
                redeliver(Arc::clone(&inner), Arc::clone(&queue), job, delay);
            }
        }
    }

    debug!(worker_id, "Worker exiting");
}

fn resolve(inner: &Inner, queue: &Queue) {
    queue.in_flight.fetch_sub(1, Ordering::SeqCst);
    inner.idle.notify_waiters();
}

fn redeliver(inner: Arc<Inner>, queue: Arc<Queue>, mut job: Job, delay: std::time::Duration) {
    job.attempt += 1;
    tokio::spawn(async move {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                debug!(job_id = %job.id, "Redelivery cancelled by shutdown");
                resolve(&inner, &queue);
            }
            _ = tokio::time::sleep(delay) => {
                if queue.tx.send(job).is_err() {
                    warn!("Queue closed before redelivery");
                    resolve(&inner, &queue);
                }
            }
        }
    });
}

#[async_trait]
impl Dispatcher for WorkerPool {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let target = self.queue(queue)?;
        let job = Job::new(queue, payload, options);
        let id = job.id;

        target.in_flight.fetch_add(1, Ordering::SeqCst);
        if target.tx.send(job).is_err() {
            resolve(&self.inner, target);
            return Err(Error::Dispatch(format!("Queue {} is closed", queue)));
        }

        debug!(queue, job_id = %id, "Job enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Backoff;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct FlakyHandler {
        failures_before_success: u32,
        calls: AtomicU32,
        logic_error: bool,
    }

    impl FlakyHandler {
        fn new(failures_before_success: u32) -> Self {
            Self {
                failures_before_success,
                calls: AtomicU32::new(0),
                logic_error: false,
            }
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn queue(&self) -> &str {
            "work"
        }

        async fn handle(&self, _job: &Job) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.logic_error {
                return Err(Error::InvalidInput("bad job".to_string()));
            }
            if call <= self.failures_before_success {
                return Err(Error::Dispatch("transient".to_string()));
            }
            Ok(())
        }
    }

    fn options(attempts: u32) -> EnqueueOptions {
        EnqueueOptions::new(attempts, Backoff::Fixed { delay_ms: 1 })
    }

    async fn run_one(handler: Arc<FlakyHandler>, attempts: u32) -> WorkerPool {
        let pool = WorkerPool::new(&["work"], CancellationToken::new());
        pool.spawn_workers(handler, 2).unwrap();
        pool.enqueue("work", serde_json::json!({}), options(attempts))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.wait_idle())
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_job_redelivered_until_success() {
        let handler = Arc::new(FlakyHandler::new(2));
        let pool = run_one(handler.clone(), 3).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let stats = pool.stats();
        assert_eq!((stats.succeeded, stats.failed, stats.redelivered), (1, 0, 2));
    }

    #[tokio::test]
    async fn test_attempt_budget_is_respected() {
        let handler = Arc::new(FlakyHandler::new(10));
        let pool = run_one(handler.clone(), 2).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_logic_errors_are_not_redelivered() {
        let handler = Arc::new(FlakyHandler {
            logic_error: true,
            ..FlakyHandler::new(0)
        });
        let pool = run_one(handler.clone(), 5).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().redelivered, 0);
    }

    struct InternalOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for InternalOnce {
        fn queue(&self) -> &str {
            "work"
        }

        async fn handle(&self, _job: &Job) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Internal("unexpected".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_still_redelivered() {
        assert!(!Error::Internal(String::new()).is_transient());
        let handler = Arc::new(InternalOnce {
            calls: AtomicU32::new(0),
        });
        let pool = WorkerPool::new(&["work"], CancellationToken::new());
        pool.spawn_workers(handler.clone(), 1).unwrap();
        pool.enqueue("work", serde_json::json!({}), options(2))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.wait_idle())
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let stats = pool.stats();
        assert_eq!((stats.succeeded, stats.redelivered), (1, 1));
    }

    #[tokio::test]
    async fn test_unknown_queue_is_a_dispatch_error() {
        let pool = WorkerPool::new(&["work"], CancellationToken::new());
        let err = pool
            .enqueue("nowhere", serde_json::json!({}), options(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
    }

    #[tokio::test]
    async fn test_external_consumer_receives_jobs() {
        let pool = WorkerPool::new(&["downstream"], CancellationToken::new());
        let mut rx = pool.take_receiver("downstream").unwrap();
        assert!(pool.take_receiver("downstream").is_err());

        pool.enqueue("downstream", serde_json::json!({ "n": 1 }), options(1))
            .await
            .unwrap();

        let job = rx.recv().await.unwrap();
        assert_eq!(job.payload["n"], 1);
        assert_eq!(pool.queue_depth("downstream"), Some(1));
        pool.wait_idle().await;
    }

    #[tokio::test]
    async fn test_shutdown_resolves_pending_redelivery() {
        let pool = WorkerPool::new(&["work"], CancellationToken::new());
        pool.spawn_workers(Arc::new(FlakyHandler::new(1)), 1).unwrap();
        pool.enqueue(
            "work",
            serde_json::json!({}),
            EnqueueOptions::new(3, Backoff::Fixed { delay_ms: 60_000 }),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.stats().redelivered == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pool.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), pool.wait_idle())
            .await
            .unwrap();
        assert_eq!(pool.queue_depth("work"), Some(0));
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let pool = WorkerPool::new(&["work"], CancellationToken::new());
        pool.spawn_workers(Arc::new(FlakyHandler::new(0)), 3).unwrap();

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
    }
}
