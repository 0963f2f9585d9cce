//! PostgreSQL-backed [`JobStore`] and [`JobQueue`] implementation.
//!
//! This is the one concrete storage backend relay ships with (behind the
//! `postgres` feature). It fulfils [`crate::job::JobStore`] with the locking
//! discipline that trait's docs describe: `FOR UPDATE SKIP LOCKED` for
//! contention-safe claiming, a lease expiry for crash recovery, and
//! exponential backoff with jitter for retries.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE relay_jobs (
//!     id              UUID PRIMARY KEY,
//!     queue_name      TEXT NOT NULL,
//!     job_type        TEXT NOT NULL,
//!     payload         JSONB NOT NULL,
//!     version         INT NOT NULL DEFAULT 1,
//!     idempotency_key TEXT,
//!     state           TEXT NOT NULL DEFAULT 'waiting',
//!     attempt         INT NOT NULL DEFAULT 1,
//!     max_attempts    INT NOT NULL DEFAULT 3,
//!     priority        INT NOT NULL DEFAULT 0,
//!     next_run_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     locked_by       TEXT,
//!     lock_expires_at TIMESTAMPTZ,
//!     last_error      TEXT,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE UNIQUE INDEX relay_jobs_idempotency_key_uniq
//!     ON relay_jobs (queue_name, idempotency_key)
//!     WHERE idempotency_key IS NOT NULL AND state IN ('waiting', 'running');
//! CREATE INDEX relay_jobs_claim_order
//!     ON relay_jobs (queue_name, next_run_at, priority DESC)
//!     WHERE state = 'waiting';
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::job::{ClaimedJob, FailureKind, JobStore};

/// Backoff policy for a single queue: `delay = min(cap, base * 2^(attempt-1)) * U(0.5, 1.5)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    /// Compute the retry delay for a 1-based attempt number.
    ///
    /// `attempt` is the attempt that just failed; the next attempt waits
    /// this long before becoming claimable again.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exp = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let scaled = self.base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let capped = scaled.min(self.cap);
        let jitter = 0.5 + fastrand::f64(); // U(0.5, 1.5)
        capped.mul_f64(jitter)
    }
}

/// Options accepted by [`PgJobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<i32>,
    pub priority: Option<i32>,
}

/// Concrete Postgres job store + enqueue side, sharing one pool.
///
/// Implements [`JobStore`] (claim/ack/nack, used by workers) directly; the
/// enqueue path is exposed as inherent methods instead since enqueue needs
/// richer options (`idempotency_key`, `delay`, `priority`) than a
/// policy-light trait signature would carry — application code calls
/// `enqueue` directly rather than through a generic interface.
pub struct PgJobStore {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enqueue a job. Idempotent: a colliding non-terminal `idempotency_key`
    /// on the same queue returns the existing job id instead of inserting.
    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Uuid> {
        if let Some(key) = &opts.idempotency_key {
            let existing: Option<Uuid> = sqlx::query_scalar(
                r#"SELECT id FROM relay_jobs
                   WHERE queue_name = $1 AND idempotency_key = $2
                     AND state IN ('waiting', 'running')"#,
            )
            .bind(queue)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("idempotency lookup failed")?;

            if let Some(id) = existing {
                return Ok(id);
            }
        }

        let id = Uuid::new_v4();
        let next_run_at = Utc::now() + chrono::Duration::from_std(opts.delay.unwrap_or_default())
            .unwrap_or_default();

        sqlx::query(
            r#"INSERT INTO relay_jobs
                 (id, queue_name, job_type, payload, idempotency_key,
                  max_attempts, priority, next_run_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(id)
        .bind(queue)
        .bind(job_type)
        .bind(&payload)
        .bind(&opts.idempotency_key)
        .bind(opts.max_attempts.unwrap_or(3))
        .bind(opts.priority.unwrap_or(0))
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .context("failed to enqueue job")?;

        Ok(id)
    }

    /// Atomically claim the lowest `(next_run_at, -priority)` ready job on a
    /// queue, setting it RUNNING and locking it to `worker_id`.
    pub async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        job_timeout: Duration,
    ) -> Result<Option<ClaimedJob>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"SELECT id, job_type, payload, version, attempt, max_attempts
               FROM relay_jobs
               WHERE queue_name = $1 AND state = 'waiting' AND next_run_at <= now()
               ORDER BY next_run_at ASC, priority DESC
               FOR UPDATE SKIP LOCKED
               LIMIT 1"#,
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await
        .context("claim_next select failed")?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: Uuid = row.get("id");
        let lock_expires_at = Utc::now()
            + chrono::Duration::from_std(job_timeout).unwrap_or_else(|_| chrono::Duration::seconds(30));

        sqlx::query(
            r#"UPDATE relay_jobs
               SET state = 'running', locked_by = $2, lock_expires_at = $3, updated_at = now()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(lock_expires_at)
        .execute(&mut *tx)
        .await
        .context("claim_next update failed")?;

        tx.commit().await?;

        Ok(Some(ClaimedJob {
            id,
            queue_name: queue.to_string(),
            job_type: row.get("job_type"),
            payload: row.get("payload"),
            version: row.get("version"),
            attempt: row.get("attempt"),
            max_attempts: row.get("max_attempts"),
            locked_by: worker_id.to_string(),
            lock_expires_at,
        }))
    }

    /// Sweep RUNNING jobs whose lease has expired and nack them with `"lock expired"`.
    ///
    /// Run periodically by a background task; recovers work orphaned by a
    /// crashed worker process.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired: Vec<(Uuid, i32, i32)> = sqlx::query_as(
            r#"SELECT id, attempt, max_attempts FROM relay_jobs
               WHERE state = 'running' AND lock_expires_at < $1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("reaper scan failed")?;

        for (id, _attempt, _max) in &expired {
            JobStore::mark_failed(self, *id, "lock expired", FailureKind::Retryable).await?;
        }

        Ok(expired.len() as u64)
    }

    /// Explicit admin operation: return a DLQ job to WAITING with `attempt = 1`.
    pub async fn retry_from_dlq(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE relay_jobs
               SET state = 'waiting', attempt = 1, next_run_at = now(),
                   locked_by = NULL, lock_expires_at = NULL, last_error = NULL,
                   updated_at = now()
               WHERE id = $1 AND state = 'dlq'"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("retry_from_dlq failed")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        // Policy-light trait signature has no queue or timeout; the concrete
        // store exposes `claim_next` for single-queue, timeout-aware polling
        // and implements this trait method against an implicit default queue
        // for callers that only need the generic interface.
        let mut out = Vec::new();
        for _ in 0..limit {
            match self
                .claim_next("default", worker_id, Duration::from_secs(30))
                .await?
            {
                Some(job) => out.push(job),
                None => break,
            }
        }
        Ok(out)
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE relay_jobs SET state = 'completed', updated_at = now() WHERE id = $1"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("mark_succeeded failed")?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let row = sqlx::query(
            r#"SELECT attempt, max_attempts FROM relay_jobs WHERE id = $1 FOR UPDATE"#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("mark_failed lookup failed")?;

        let Some(row) = row else { return Ok(()) };
        let attempt: i32 = row.get("attempt");
        let max_attempts: i32 = row.get("max_attempts");

        let dead_letter = kind == FailureKind::NonRetryable || attempt >= max_attempts;

        if dead_letter {
            sqlx::query(
                r#"UPDATE relay_jobs
                   SET state = 'dlq', last_error = $2, locked_by = NULL,
                       lock_expires_at = NULL, updated_at = now()
                   WHERE id = $1"#,
            )
            .bind(job_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .context("mark_failed dlq update failed")?;
        } else {
            let delay = self.backoff.delay_for(attempt);
            let next_run_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"UPDATE relay_jobs
                   SET state = 'waiting', attempt = attempt + 1, next_run_at = $2,
                       locked_by = NULL, lock_expires_at = NULL, last_error = $3,
                       updated_at = now()
                   WHERE id = $1"#,
            )
            .bind(job_id)
            .bind(next_run_at)
            .bind(error)
            .execute(&self.pool)
            .await
            .context("mark_failed retry update failed")?;
        }

        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE relay_jobs
               SET lock_expires_at = now() + interval '30 seconds'
               WHERE id = $1 AND state = 'running'"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("heartbeat failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(600),
        };

        // attempt=1 -> base*1 in [2.5, 7.5]s
        let d1 = policy.delay_for(1);
        assert!(d1.as_secs_f64() >= 2.5 && d1.as_secs_f64() <= 7.5);

        // large attempt hits the cap (times jitter bound 1.5)
        let d_big = policy.delay_for(40);
        assert!(d_big.as_secs_f64() <= 600.0 * 1.5 + 1.0);
    }

    #[test]
    fn backoff_never_negative_or_zero_for_attempt_one() {
        let policy = BackoffPolicy::default();
        let d = policy.delay_for(1);
        assert!(d.as_secs_f64() > 0.0);
    }
}
