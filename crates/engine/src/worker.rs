//! Queue consumers: polling workers with bounded concurrency
//!
//! Each worker drains one queue, runs jobs through its handler, retries
//! failures with the queue's backoff policy and dead-letters jobs that
//! exhaust their attempt budget.

use crate::error::Result;
use crate::queue::{Job, JobQueue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Processes one claimed job to completion
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &Job) -> Result<serde_json::Value>;
}

/// Polling consumer for a single queue
pub struct QueueWorker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl QueueWorker {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            handler,
            concurrency: 5,
            poll_interval: Duration::from_millis(100),
            shutdown_tx: None,
        }
    }

    /// Set how many jobs may run at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the queue poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the consumption loop
    pub fn start(&mut self) -> JoinHandle<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let queue = self.queue.clone();
        let handler = self.handler.clone();
        let concurrency = self.concurrency;
        let poll_interval = self.poll_interval;

        info!(queue = queue.name(), concurrency, "starting queue worker");

        tokio::spawn(async move {
            run_loop(queue, handler, concurrency, poll_interval, shutdown_rx).await;
        })
    }

    /// Signal the consumption loop to stop after in-flight jobs finish
    pub fn shutdown(&self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
    }
}

async fn run_loop(
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut poll_timer = interval(poll_interval);

    loop {
        tokio::select! {
            _ = poll_timer.tick() => {
                loop {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let Some(job) = queue.take() else {
                        drop(permit);
                        break;
                    };

                    let queue = queue.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        process_job(queue, handler, job).await;
                    });
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(queue = queue.name(), "queue worker shutting down");
                    break;
                }
            }
        }
    }

    // Wait for in-flight jobs to release their permits
    let _ = semaphore.acquire_many(concurrency as u32).await;
    info!(queue = queue.name(), "queue worker stopped");
}

async fn process_job(queue: JobQueue, handler: Arc<dyn JobHandler>, mut job: Job) {
    job.attempts_made += 1;
    debug!(queue = queue.name(), job_id = %job.id, attempt = job.attempts_made, "processing job");

    match handler.process(&job).await {
        Ok(_) => {
            debug!(queue = queue.name(), job_id = %job.id, "job completed");
        }
        Err(e) => {
            if job.attempts_made >= queue.options().attempts {
                error!(queue = queue.name(), job_id = %job.id, error = %e, "job exhausted retries");
                queue.dead_letter(job, e.to_string());
            } else {
                let delay = queue.backoff_for(job.attempts_made);
                warn!(
                    queue = queue.name(),
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "job failed, scheduling retry"
                );
                tokio::time::sleep(delay).await;
                queue.requeue(job);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::queue::JobOptions;
    use parking_lot::Mutex;

    struct FlakyHandler {
        failures_before_success: Mutex<u32>,
        processed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn process(&self, job: &Job) -> Result<serde_json::Value> {
            let mut remaining = self.failures_before_success.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Storage("transient".to_string()));
            }
            self.processed.lock().push(job.id.clone());
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let _ = tracing_subscriber::fmt::try_init();
        let queue = JobQueue::with_options(
            "test-queue",
            JobOptions {
                attempts: 3,
                backoff: Duration::from_millis(5),
            },
        );
        let handler = Arc::new(FlakyHandler {
            failures_before_success: Mutex::new(2),
            processed: Mutex::new(Vec::new()),
        });

        queue.add("job-1", serde_json::json!({}));

        let mut worker = QueueWorker::new(queue.clone(), handler.clone())
            .with_poll_interval(Duration::from_millis(5));
        let handle = worker.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.shutdown();
        let _ = handle.await;

        assert_eq!(handler.processed.lock().as_slice(), ["job-1"]);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn dead_letters_after_exhausted_attempts() {
        let _ = tracing_subscriber::fmt::try_init();
        let queue = JobQueue::with_options(
            "test-queue",
            JobOptions {
                attempts: 2,
                backoff: Duration::from_millis(5),
            },
        );
        let handler = Arc::new(FlakyHandler {
            failures_before_success: Mutex::new(u32::MAX),
            processed: Mutex::new(Vec::new()),
        });

        queue.add("job-1", serde_json::json!({}));

        let mut worker = QueueWorker::new(queue.clone(), handler.clone())
            .with_poll_interval(Duration::from_millis(5));
        let handle = worker.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.shutdown();
        let _ = handle.await;

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.attempts_made, 2);
        assert!(handler.processed.lock().is_empty());
    }
}
