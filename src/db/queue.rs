//! Queue operations: enqueue with coalescing, atomic claim, retry and
//! dead-lettering, pair blocking.
//!
//! The claim statement is the one place that guarantees no job is ever
//! delivered twice: a single `UPDATE … RETURNING` against the best
//! pending row, executed on the serialized writer connection.

use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::job::*;
use crate::telemetry::metrics;

const JOB_COLUMNS: &str = "id, student_id, area_code, catalog, run, priority, input_data, \
     link_only, speculative, state, attempts, max_attempts, last_error, claimed_by, \
     submitted_at, updated_at, expires_at, not_before";

/// Result of enqueuing a job.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// A new pending job was created.
    Created(Job),
    /// An existing pending job for the pair absorbed this submission:
    /// its input was replaced and its priority raised to the minimum of
    /// the two.
    Coalesced(Job),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueOutcome::Created(job) | EnqueueOutcome::Coalesced(job) => job,
        }
    }
}

/// What happened to a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued for another attempt, claimable after the backoff gate.
    Requeued { attempts: u32 },
    /// Exhausted retries or non-retryable: dead-lettered.
    Dead { attempts: u32 },
    /// A newer pending job for the same pair arrived while this one was
    /// in flight; the failed job is dropped in its favor.
    Superseded,
}

/// Bounded-retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`: `base * 2^(attempts - 1)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.base_delay * 2u32.saturating_pow(exp)
    }
}

impl super::Db {
    /// Submit a job. Coalesces into an existing pending job for the same
    /// (student, area) pair; rejects blocked pairs and invalid input.
    pub async fn enqueue(&self, new: NewJob) -> Result<EnqueueOutcome> {
        validate_new_job(&new)?;

        let now = Utc::now();
        let id = JobId::new();
        let mut tx = self.pool().begin().await?;

        let blocked: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM queue_blocks WHERE student_id = ? AND area_code = ?",
        )
        .bind(&new.student_id)
        .bind(&new.area_code)
        .fetch_optional(&mut *tx)
        .await?;

        if blocked.is_some() {
            metrics::jobs_enqueued().add(1, &[KeyValue::new("outcome", "blocked")]);
            return Err(Error::QueueBlocked {
                student_id: new.student_id,
                area_code: new.area_code,
            });
        }

        // Coalesce: newest submission wins the payload, most urgent
        // priority wins. Claimed jobs are left alone; the unique index
        // only covers pending rows.
        let coalesced: Option<(String,)> = sqlx::query_as(
            "UPDATE queue
             SET input_data = ?, priority = MIN(priority, ?), catalog = ?, run = ?,
                 link_only = ?, speculative = ?, expires_at = ?, updated_at = ?
             WHERE student_id = ? AND area_code = ? AND state = 'pending'
             RETURNING id",
        )
        .bind(&new.input_data)
        .bind(new.priority)
        .bind(&new.catalog)
        .bind(new.run)
        .bind(new.link_only)
        .bind(new.speculative)
        .bind(new.expires_at)
        .bind(now)
        .bind(&new.student_id)
        .bind(&new.area_code)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((existing_id,)) = coalesced {
            let job = get_job_on(&mut *tx, &existing_id).await?;
            tx.commit().await?;

            debug!(
                job_id = %job.id,
                student_id = %job.student_id,
                area_code = %job.area_code,
                priority = job.priority,
                "enqueue coalesced into pending job"
            );
            metrics::jobs_enqueued().add(1, &[KeyValue::new("outcome", "coalesced")]);
            return Ok(EnqueueOutcome::Coalesced(job));
        }

        sqlx::query(
            "INSERT INTO queue (
                id, student_id, area_code, catalog, run, priority, input_data,
                link_only, speculative, state, attempts, submitted_at, updated_at,
                expires_at, max_attempts
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
        )
        .bind(id.0.to_string())
        .bind(&new.student_id)
        .bind(&new.area_code)
        .bind(&new.catalog)
        .bind(new.run)
        .bind(new.priority)
        .bind(&new.input_data)
        .bind(new.link_only)
        .bind(new.speculative)
        .bind(now)
        .bind(now)
        .bind(new.expires_at)
        .bind(new.max_attempts.map(|n| n as i64))
        .execute(&mut *tx)
        .await?;

        let job = get_job_on(&mut *tx, &id.0.to_string()).await?;
        tx.commit().await?;

        debug!(
            job_id = %job.id,
            student_id = %job.student_id,
            area_code = %job.area_code,
            priority = job.priority,
            "job enqueued"
        );
        metrics::jobs_enqueued().add(1, &[KeyValue::new("outcome", "created")]);
        Ok(EnqueueOutcome::Created(job))
    }

    /// Claim the most urgent deliverable pending job for a worker.
    ///
    /// Expired pending jobs found on the way are dropped with a logged
    /// diagnostic; they are never delivered and never reported as
    /// failures. Returns None when nothing is claimable.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let expired: Vec<(String, String, String)> = sqlx::query_as(
            "DELETE FROM queue
             WHERE state = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?
             RETURNING id, student_id, area_code",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for (job_id, student_id, area_code) in &expired {
            warn!(%job_id, %student_id, %area_code, "dropping expired job");
            metrics::queue_operations().add(1, &[KeyValue::new("operation", "expire")]);
        }

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE queue
             SET state = 'claimed', claimed_by = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM queue
                 WHERE state = 'pending'
                   AND (not_before IS NULL OR not_before <= ?)
                 ORDER BY priority ASC, submitted_at ASC
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::queue_operations().add(
            1,
            &[KeyValue::new(
                "operation",
                if row.is_some() { "claim" } else { "claim_empty" },
            )],
        );

        match row {
            Some(row) => {
                let job = row.try_into_job()?;
                debug!(job_id = %job.id, worker_id, "job claimed");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Retire a claimed job after its result was finalized. Jobs are
    /// ephemeral: the row is deleted.
    pub async fn complete(&self, id: JobId) -> Result<()> {
        let affected = sqlx::query("DELETE FROM queue WHERE id = ? AND state = 'claimed'")
            .bind(id.0.to_string())
            .execute(self.pool())
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(Error::NotFound(format!("claimed job {id}")));
        }

        metrics::queue_operations().add(1, &[KeyValue::new("operation", "complete")]);
        Ok(())
    }

    /// Record a failed attempt on a claimed job. Retryable failures
    /// re-queue behind a backoff gate until attempts run out; the rest
    /// dead-letter immediately.
    pub async fn fail(
        &self,
        id: JobId,
        error: &str,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let job = get_job_on(&mut *tx, &id.0.to_string()).await?;
        if job.state != JobState::Claimed {
            return Err(Error::InvalidTransition {
                from: job.state.to_string(),
                to: "failed".to_string(),
            });
        }

        let attempts = job.attempts + 1;
        let max = job.max_attempts.unwrap_or(policy.max_attempts);

        let outcome = if !retryable || attempts >= max {
            sqlx::query(
                "UPDATE queue
                 SET state = 'dead', attempts = ?, last_error = ?, claimed_by = NULL,
                     updated_at = ?
                 WHERE id = ?",
            )
            .bind(attempts as i64)
            .bind(error)
            .bind(now)
            .bind(id.0.to_string())
            .execute(&mut *tx)
            .await?;

            warn!(
                job_id = %id,
                attempts,
                max,
                retryable,
                error,
                "job dead-lettered"
            );
            FailOutcome::Dead { attempts }
        } else {
            // A newer pending job for the pair may have arrived while
            // this one was in flight; it subsumes the retry.
            let newer: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM queue
                 WHERE student_id = ? AND area_code = ? AND state = 'pending'",
            )
            .bind(&job.student_id)
            .bind(&job.area_code)
            .fetch_optional(&mut *tx)
            .await?;

            if newer.is_some() {
                sqlx::query("DELETE FROM queue WHERE id = ?")
                    .bind(id.0.to_string())
                    .execute(&mut *tx)
                    .await?;

                info!(job_id = %id, "failed job superseded by newer pending job");
                FailOutcome::Superseded
            } else {
                let not_before = now + policy.backoff(attempts);
                sqlx::query(
                    "UPDATE queue
                     SET state = 'pending', attempts = ?, last_error = ?,
                         claimed_by = NULL, not_before = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(attempts as i64)
                .bind(error)
                .bind(not_before)
                .bind(now)
                .bind(id.0.to_string())
                .execute(&mut *tx)
                .await?;

                info!(
                    job_id = %id,
                    attempts,
                    not_before = %not_before,
                    error,
                    "job re-queued for retry"
                );
                FailOutcome::Requeued { attempts }
            }
        };

        tx.commit().await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "fail")]);
        Ok(outcome)
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let mut conn = self.pool().acquire().await?;
        get_job_on(&mut *conn, &id.0.to_string()).await
    }

    /// List jobs, optionally filtered by state, most urgent first.
    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = match state {
            Some(state) => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM queue WHERE state = ?
                     ORDER BY priority ASC, submitted_at ASC LIMIT ?"
                ))
                .bind(state.to_string())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM queue
                     ORDER BY priority ASC, submitted_at ASC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Dead-lettered jobs, for operator inspection.
    pub async fn list_dead(&self) -> Result<Vec<Job>> {
        self.list_jobs(Some(JobState::Dead), i64::MAX).await
    }

    /// Drop expired pending jobs outside of the claim path. Returns the
    /// number dropped.
    pub async fn sweep_expired_jobs(&self) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM queue
             WHERE state = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();

        if affected > 0 {
            info!(count = affected, "swept expired pending jobs");
        }
        Ok(affected)
    }

    // -----------------------------------------------------------------------
    // Pair blocking
    // -----------------------------------------------------------------------

    /// Reject future enqueues for the pair until unblocked. Idempotent.
    pub async fn block(&self, student_id: &str, area_code: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO queue_blocks (student_id, area_code, created_at)
             VALUES (?, ?, ?)",
        )
        .bind(student_id)
        .bind(area_code)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        info!(student_id, area_code, "queue blocked");
        Ok(())
    }

    /// Clear a block. Returns whether one existed.
    pub async fn unblock(&self, student_id: &str, area_code: &str) -> Result<bool> {
        let affected =
            sqlx::query("DELETE FROM queue_blocks WHERE student_id = ? AND area_code = ?")
                .bind(student_id)
                .bind(area_code)
                .execute(self.pool())
                .await?
                .rows_affected();

        if affected > 0 {
            info!(student_id, area_code, "queue unblocked");
        }
        Ok(affected > 0)
    }

    pub async fn is_blocked(&self, student_id: &str, area_code: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM queue_blocks WHERE student_id = ? AND area_code = ?")
                .bind(student_id)
                .bind(area_code)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.is_some())
    }
}

fn validate_new_job(new: &NewJob) -> Result<()> {
    if new.student_id.trim().is_empty() {
        return Err(Error::Validation("student_id must not be empty".into()));
    }
    if new.area_code.trim().is_empty() {
        return Err(Error::Validation("area_code must not be empty".into()));
    }
    if new.catalog.trim().is_empty() {
        return Err(Error::Validation("catalog must not be empty".into()));
    }
    if let Some(expires_at) = new.expires_at {
        if expires_at <= Utc::now() {
            return Err(Error::Validation("expires_at is already past".into()));
        }
    }
    Ok(())
}

async fn get_job_on(
    conn: &mut sqlx::SqliteConnection,
    id: &str,
) -> Result<Job> {
    let row: Option<JobRow> =
        sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM queue WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
        .try_into_job()
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    student_id: String,
    area_code: String,
    catalog: String,
    run: i64,
    priority: i32,
    input_data: serde_json::Value,
    link_only: bool,
    speculative: bool,
    state: String,
    attempts: i64,
    max_attempts: Option<i64>,
    last_error: Option<String>,
    claimed_by: Option<String>,
    submitted_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
    expires_at: Option<chrono::DateTime<Utc>>,
    not_before: Option<chrono::DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(
                self.id
                    .parse()
                    .map_err(|e: uuid::Error| Error::Other(format!("bad job id: {e}")))?,
            ),
            student_id: self.student_id,
            area_code: self.area_code,
            catalog: self.catalog,
            run: self.run,
            priority: self.priority,
            input_data: self.input_data,
            link_only: self.link_only,
            speculative: self.speculative,
            state: self.state.parse()?,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts.map(|n| n as u32),
            last_error: self.last_error,
            claimed_by: self.claimed_by,
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            not_before: self.not_before,
        })
    }
}
