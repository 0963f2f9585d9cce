//! Job system interfaces for relay.
//!
//! This module provides policy-light interfaces for job execution:
//! - [`JobStore`] - Trait for claiming and managing jobs from persistent storage
//! - [`ClaimedJob`] - A job claimed by a worker, ready for execution
//! - [`FailureKind`] - Classification of job failures for retry decisions
//!
//! # Design Philosophy
//!
//! relay owns interfaces only. Policy decisions (polling cadence, retry backoff,
//! concurrency limits) belong in the application's job worker implementation.
//! Payload interpretation belongs there too — `ClaimedJob::payload` is plain
//! `serde_json::Value`; the worker deserializes it into whatever shape that
//! queue's jobs carry.
//!
//! # Example
//!
//! ```ignore
//! use relay::job::{JobStore, ClaimedJob, FailureKind};
//!
//! // Implement JobStore for your database
//! struct PostgresJobStore { /* ... */ }
//!
//! #[async_trait]
//! impl JobStore for PostgresJobStore {
//!     async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
//!         // Use FOR UPDATE SKIP LOCKED pattern
//!     }
//!     // ... other methods
//! }
//!
//! // Worker loop (policy lives here, not in relay)
//! loop {
//!     let jobs = store.claim_ready("worker-1", 10).await?;
//!     for job in jobs {
//!         match run_stage(&job).await {
//!             Ok(()) => store.mark_succeeded(job.id).await?,
//!             Err(e) => store.mark_failed(job.id, &e.to_string(), FailureKind::Retryable).await?,
//!         }
//!     }
//!     tokio::time::sleep(poll_interval).await;
//! }
//! ```

use anyhow::Result;
use uuid::Uuid;

/// Trait for claiming jobs from a persistent store.
///
/// The store decides what "ready" means (scheduling, retries, visibility timeout).
/// Workers stay dumb and just poll for ready jobs.
///
/// # Implementer Notes
///
/// - Use `FOR UPDATE SKIP LOCKED` (PostgreSQL) or equivalent for atomic claiming
/// - Set lease expiration when claiming to handle worker crashes
/// - The store should handle retry delay calculation internally
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Claim ready jobs for execution.
    ///
    /// The store decides what "ready" means:
    /// - `next_run_at <= now` for scheduled jobs
    /// - `status = pending` and not claimed
    /// - Retry delay elapsed for failed jobs
    ///
    /// # Arguments
    ///
    /// * `worker_id` - Identifier for this worker (for lease tracking)
    /// * `limit` - Maximum number of jobs to claim
    ///
    /// # Returns
    ///
    /// A vector of claimed jobs, which may be empty if no jobs are ready.
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>>;

    /// Mark a job as succeeded.
    ///
    /// The store should update the job status and record completion time.
    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    /// Mark a job as failed.
    ///
    /// # Arguments
    ///
    /// * `job_id` - The job that failed
    /// * `error` - Error message to store
    /// * `kind` - Whether this failure is retryable
    ///
    /// For retryable failures, the store should:
    /// - Increment retry count
    /// - Calculate next retry time (exponential backoff)
    /// - Mark as pending if retries remain, dead-letter otherwise
    ///
    /// For non-retryable failures, the store should:
    /// - Mark as dead-letter immediately
    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: FailureKind) -> Result<()>;

    /// Send a heartbeat to extend the lease.
    ///
    /// Workers should call this periodically for long-running jobs to prevent
    /// the job from being reclaimed by another worker.
    async fn heartbeat(&self, job_id: Uuid) -> Result<()>;
}

/// Classification of job failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Failure may be transient; the job should be retried.
    ///
    /// Examples: network timeout, temporary unavailability, rate limiting
    Retryable,

    /// Failure is permanent; the job should not be retried.
    ///
    /// Examples: deserialization failure, unsupported version, invalid input
    NonRetryable,
}

/// A job claimed by a worker, ready for execution.
///
/// Contains all information needed to deserialize and execute the job command.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Unique identifier for this job.
    pub id: Uuid,

    /// The queue this job was claimed from (e.g. "ingestion", "outbox-relay").
    pub queue_name: String,

    /// The job type (e.g., "ingestion:ocr", "vendor-metrics:event").
    /// Used by the worker to route the job to the right handler.
    pub job_type: String,

    /// The serialized job payload.
    pub payload: serde_json::Value,

    /// The payload schema version.
    /// Used for backward-compatible deserialization.
    pub version: i32,

    /// The attempt number (1-based).
    /// First attempt is 1, first retry is 2, etc.
    pub attempt: i32,

    /// The attempt ceiling; `mark_failed` dead-letters once `attempt` reaches this.
    pub max_attempts: i32,

    /// The worker id that currently holds the claim lock.
    pub locked_by: String,

    /// When the claim lock expires; the reaper treats an unrenewed lock past
    /// this instant as a crashed worker.
    pub lock_expires_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claimed_job_debug() {
        let job = ClaimedJob {
            id: Uuid::nil(),
            queue_name: "test".to_string(),
            job_type: "test".to_string(),
            payload: serde_json::json!({}),
            version: 1,
            attempt: 1,
            max_attempts: 3,
            locked_by: "worker-1".to_string(),
            lock_expires_at: chrono::Utc::now() + chrono::Duration::seconds(30),
        };
        let debug = format!("{:?}", job);
        assert!(debug.contains("ClaimedJob"));
        assert!(debug.contains("test"));
    }

    #[test]
    fn test_failure_kind_eq() {
        assert_eq!(FailureKind::Retryable, FailureKind::Retryable);
        assert_eq!(FailureKind::NonRetryable, FailureKind::NonRetryable);
        assert_ne!(FailureKind::Retryable, FailureKind::NonRetryable);
    }
}
