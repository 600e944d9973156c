//! In-process job queue with per-key deduplication and backoff retry
//!
//! Reference implementation of the at-least-once queue contract the
//! settlement pipelines consume. Jobs are deduplicated by caller-supplied
//! id for the lifetime of the queue, retried with exponential backoff up
//! to a bounded attempt count, and routed to a dead-letter list once
//! exhausted. Any durable queue with the same guarantees can stand in.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy applied to every job on the queue
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Maximum total attempts before a job is dead-lettered
    pub attempts: u32,
    /// Base delay for exponential backoff (doubles per retry)
    pub backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// A unit of deferred work
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A job that exhausted its retry budget
#[derive(Debug, Clone)]
pub struct DeadJob {
    pub job: Job,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

struct QueueInner {
    name: String,
    options: JobOptions,
    pending: Mutex<VecDeque<Job>>,
    known_ids: Mutex<HashSet<String>>,
    dead: Mutex<Vec<DeadJob>>,
}

/// Cloneable handle to a named in-process queue
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, JobOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: JobOptions) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                options,
                pending: Mutex::new(VecDeque::new()),
                known_ids: Mutex::new(HashSet::new()),
                dead: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &JobOptions {
        &self.inner.options
    }

    /// Enqueue a job under a deterministic id. A second add with the same
    /// id collapses into the first; returns whether the job was accepted.
    pub fn add(&self, job_id: impl Into<String>, payload: serde_json::Value) -> bool {
        let job_id = job_id.into();
        {
            let mut ids = self.inner.known_ids.lock();
            if !ids.insert(job_id.clone()) {
                debug!(queue = %self.inner.name, %job_id, "duplicate job id, skipping");
                return false;
            }
        }

        self.inner.pending.lock().push_back(Job {
            id: job_id,
            payload,
            attempts_made: 0,
            enqueued_at: Utc::now(),
        });
        true
    }

    /// Claim the next pending job, if any
    pub fn take(&self) -> Option<Job> {
        self.inner.pending.lock().pop_front()
    }

    /// Put a failed job back for another attempt. The id stays known, so
    /// concurrent duplicate submissions remain deduplicated.
    pub fn requeue(&self, job: Job) {
        self.inner.pending.lock().push_back(job);
    }

    /// Route an exhausted job to the dead-letter list
    pub fn dead_letter(&self, job: Job, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(queue = %self.inner.name, job_id = %job.id, %reason, "job dead-lettered");
        self.inner.dead.lock().push(DeadJob {
            job,
            reason,
            failed_at: Utc::now(),
        });
    }

    /// Dead-lettered jobs, for manual inspection
    pub fn dead_letters(&self) -> Vec<DeadJob> {
        self.inner.dead.lock().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pending.lock().is_empty()
    }

    /// Exponential backoff delay before the given attempt number retries
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.inner.options.backoff * 2u32.pow(exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_deduplicates_by_job_id() {
        let queue = JobQueue::new("approval-queue");
        assert!(queue.add("approval-tok1", serde_json::json!({"decision": "approved"})));
        assert!(!queue.add("approval-tok1", serde_json::json!({"decision": "rejected"})));
        assert_eq!(queue.pending_len(), 1);

        let job = queue.take().unwrap();
        assert_eq!(job.payload["decision"], "approved");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let queue = JobQueue::with_options(
            "q",
            JobOptions {
                attempts: 5,
                backoff: Duration::from_millis(100),
            },
        );
        assert_eq!(queue.backoff_for(1), Duration::from_millis(100));
        assert_eq!(queue.backoff_for(2), Duration::from_millis(200));
        assert_eq!(queue.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn dead_letter_keeps_the_job_for_inspection() {
        let queue = JobQueue::new("q");
        queue.add("j1", serde_json::json!({}));
        let job = queue.take().unwrap();
        queue.dead_letter(job, "boom");

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, "j1");
        assert_eq!(dead[0].reason, "boom");
    }
}
