//! PostgreSQL-backed store implementations.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never take the
//! same job; a claimed job carries a lease and lapses back to claimable when
//! the lease expires. The partial unique index on active idempotency keys
//! backs up the enqueue-time check. Shared counters CAS on
//! `shared_state.version`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter};
use crate::error::{EnqueueError, ErrorClass, FailureRecord};
use crate::job::{Job, JobStatus, NewJob};

use super::{
    DeadLetterStore, FailOutcome, JobStore, QueueStats, StateStore, VersionedDoc,
    DEFAULT_VISIBILITY_TIMEOUT,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply the schema. Idempotent; call at startup.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("migrations failed")?;
    Ok(())
}

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, next_run_at, \
     last_error, failure_history, idempotency_key, lease_expires_at, worker_id, \
     created_at, updated_at";

const DEAD_LETTER_COLUMNS: &str = "id, job_id, job_type, original_job, failure_history, moved_at, \
     resolved, resolved_at, replayed_job_id";

// ============================================================================
// Jobs
// ============================================================================

pub struct PostgresJobStore {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_visibility_timeout(pool, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    async fn find_active_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE idempotency_key = $1
              AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn fetch(&self, job_id: Uuid) -> Result<Job> {
        sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("job not found: {job_id}"))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<Uuid, EnqueueError> {
        let job = new_job.into_job()?;

        // Friendly pre-check; the partial unique index is the authority.
        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = self.find_active_by_idempotency_key(key).await? {
                return Err(EnqueueError::Duplicate {
                    existing: existing.id,
                });
            }
        }

        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, attempts, max_attempts, next_run_at,
                last_error, failure_history, idempotency_key, lease_expires_at, worker_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.next_run_at)
        .bind(&job.last_error)
        .bind(&job.failure_history)
        .bind(&job.idempotency_key)
        .bind(job.lease_expires_at)
        .bind(&job.worker_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => Ok(id),
            Err(err) if is_unique_violation(&err) => {
                // Lost the race to a concurrent enqueue with the same key.
                let key = job.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .find_active_by_idempotency_key(key)
                    .await?
                    .map(|j| j.id)
                    .unwrap_or(job.id);
                Err(EnqueueError::Duplicate { existing })
            }
            Err(err) => Err(EnqueueError::Store(err.into())),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn claim_due(&self, worker_id: &str, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM jobs
                WHERE (status = 'pending' AND (next_run_at IS NULL OR next_run_at <= NOW()))
                   OR (status = 'processing' AND lease_expires_at < NOW())
                ORDER BY COALESCE(next_run_at, created_at)
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                worker_id = $2,
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM due)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(limit)
        .bind(worker_id)
        .bind(self.visibility_timeout.as_millis().to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        failure: FailureRecord,
        retry_delay: Duration,
    ) -> Result<FailOutcome> {
        // The claiming worker is the only writer for a Processing job, so
        // read-modify-write is race-free here.
        let mut job = self.fetch(job_id).await?;

        job.attempts += 1;
        job.last_error = Some(failure.message.clone());
        let permanent = failure.class == ErrorClass::Permanent;
        job.failure_history.0.push(failure);

        let retryable = !permanent && job.attempts < job.max_attempts;
        let next_run_at = if retryable {
            Some(
                Utc::now()
                    + chrono::Duration::from_std(retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(1)),
            )
        } else {
            None
        };
        job.status = if retryable {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        job.next_run_at = next_run_at.or(job.next_run_at);
        job.worker_id = None;
        job.lease_expires_at = None;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1,
                attempts = $2,
                last_error = $3,
                failure_history = $4,
                next_run_at = $5,
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $6
            "#,
        )
        .bind(job.status)
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(&job.failure_history)
        .bind(job.next_run_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if retryable {
            Ok(FailOutcome::Rescheduled {
                next_run_at: next_run_at.expect("retryable path always sets next_run_at"),
            })
        } else {
            Ok(FailOutcome::Exhausted { job })
        }
    }

    async fn defer(&self, job_id: Uuid, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                next_run_at = $1,
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(until)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'processing'
            "#,
        )
        .bind(self.visibility_timeout.as_millis().to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead_lettered(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead_lettered',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            r#"
            SELECT COUNT(*), MIN(created_at)
            FROM jobs
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let oldest_pending_age = row
            .1
            .map(|oldest| Utc::now() - oldest)
            .and_then(|age| age.to_std().ok());
        Ok(QueueStats {
            queue_depth: row.0,
            oldest_pending_age,
        })
    }
}

// ============================================================================
// Dead letters
// ============================================================================

pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn move_to_dead_letter(&self, job: &Job) -> Result<DeadLetterEntry> {
        let entry = DeadLetterEntry::for_job(job);

        // ON CONFLICT (job_id) DO NOTHING makes the move idempotent; the
        // follow-up select returns whichever entry won.
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, job_id, job_type, original_job, failure_history, moved_at,
                resolved, resolved_at, replayed_job_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id)
        .bind(&entry.job_type)
        .bind(&entry.original_job)
        .bind(&entry.failure_history)
        .bind(entry.moved_at)
        .bind(entry.resolved)
        .bind(entry.resolved_at)
        .bind(entry.replayed_job_id)
        .execute(&self.pool)
        .await?;

        sqlx::query_as::<_, DeadLetterEntry>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE job_id = $1"
        ))
        .bind(job.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("dead letter vanished for job {}", job.id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letters
            WHERE ($1::text IS NULL OR job_type = $1)
              AND ($2::timestamptz IS NULL OR moved_at >= $2)
              AND ($3::timestamptz IS NULL OR moved_at < $3)
              AND (resolved = FALSE OR $4)
            ORDER BY moved_at DESC
            LIMIT $5
            "#,
        ))
        .bind(&filter.job_type)
        .bind(filter.moved_after)
        .bind(filter.moved_before)
        .bind(filter.include_resolved)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn mark_resolved(&self, id: Uuid, replayed_job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters
            SET resolved = TRUE,
                resolved_at = NOW(),
                replayed_job_id = $1
            WHERE id = $2 AND resolved = FALSE
            "#,
        )
        .bind(replayed_job_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish "already resolved" from "no such entry".
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(anyhow!("dead letter entry not found: {id}")),
        }
    }

    async fn purge_resolved(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM dead_letters WHERE resolved = TRUE AND moved_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Shared state
// ============================================================================

pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StateStore for PostgresStateStore {
    async fn load(&self, key: &str) -> Result<Option<VersionedDoc>> {
        let row = sqlx::query_as::<_, (Json<serde_json::Value>, i64)>(
            "SELECT doc, version FROM shared_state WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(doc, version)| (doc.0, version as u64)))
    }

    async fn store(
        &self,
        key: &str,
        doc: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO shared_state (key, doc, version)
                    VALUES ($1, $2, 1)
                    ON CONFLICT (key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(Json(doc))
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    r#"
                    UPDATE shared_state
                    SET doc = $1,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE key = $2 AND version = $3
                    "#,
                )
                .bind(Json(doc))
                .bind(key)
                .bind(version as i64)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM shared_state WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM shared_state WHERE key LIKE $1 || '%' ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }
}
