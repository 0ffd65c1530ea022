//! Storage seams for the reliability core.
//!
//! The stores own policy-light persistence; callers stay dumb. Three traits:
//!
//! - [`JobStore`]: durable job records with atomic claims. The store decides
//!   what "due" means (schedule reached, lease lapsed); workers just poll.
//! - [`DeadLetterStore`]: permanently failed jobs, inspectable and
//!   replayable.
//! - [`StateStore`]: versioned JSON documents with per-key compare-and-swap.
//!   Circuit, rate-window, quota, and cache state all live here so every
//!   worker process observes the same counters. Per-process in-memory
//!   globals would diverge across workers.
//!
//! Two implementations ship: [`memory`] (deterministic, for tests and
//! single-process embedding) and [`postgres`] (production, `FOR UPDATE SKIP
//! LOCKED` claims in the usual idiom).

pub mod memory;
pub mod postgres;

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter};
use crate::error::{EnqueueError, FailureRecord};
use crate::job::{Job, NewJob};

/// Default protection window for a claimed job. A worker that crashes
/// mid-job loses its claim after this long and the job becomes reclaimable.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of recording a failure against a job.
#[derive(Debug)]
pub enum FailOutcome {
    /// Budget remains; the job went back to Pending with a future
    /// `next_run_at`, so the backoff wait occupies no worker.
    Rescheduled { next_run_at: DateTime<Utc> },
    /// Budget is spent (or the failure was permanent). The job is parked in
    /// `Failed` and must be moved to the dead letter store.
    Exhausted { job: Job },
}

/// Queue-level numbers for the health probe.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Jobs currently Pending.
    pub queue_depth: i64,
    /// Age of the oldest Pending job, if any.
    pub oldest_pending_age: Option<Duration>,
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Rejects the submission with
    /// [`EnqueueError::Duplicate`] when an active (Pending/Processing) job
    /// already holds the idempotency key.
    async fn enqueue(&self, new_job: NewJob) -> Result<Uuid, EnqueueError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Atomically claim up to `limit` due jobs for `worker_id`, marking them
    /// Processing with a fresh lease. Due means: Pending with `next_run_at`
    /// reached, or Processing with a lapsed lease.
    async fn claim_due(&self, worker_id: &str, limit: i64) -> Result<Vec<Job>>;

    /// Terminal success.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Record a failure: append to the history, increment attempts, and
    /// either reschedule (Pending, `next_run_at = now + retry_delay`) or
    /// report exhaustion. Permanent failures exhaust immediately regardless
    /// of remaining budget.
    async fn fail(
        &self,
        job_id: Uuid,
        failure: FailureRecord,
        retry_delay: Duration,
    ) -> Result<FailOutcome>;

    /// Return a claimed job to Pending without consuming an attempt. Used
    /// when the call was skipped (circuit open, rate limited, quota
    /// exhausted) rather than failed.
    async fn defer(&self, job_id: Uuid, until: DateTime<Utc>) -> Result<()>;

    /// Cancel a Pending job. Returns false if the job was already claimed or
    /// finished.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Heartbeat: push the lease out for a long-running claimed job.
    async fn extend_lease(&self, job_id: Uuid) -> Result<()>;

    /// Final transition after the dead-letter move succeeded.
    async fn mark_dead_lettered(&self, job_id: Uuid) -> Result<()>;

    async fn queue_stats(&self) -> Result<QueueStats>;
}

#[async_trait::async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Record a dead letter for `job`. Idempotent per job id: a second move
    /// returns the existing entry untouched.
    async fn move_to_dead_letter(&self, job: &Job) -> Result<DeadLetterEntry>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>>;

    /// Mark an entry resolved, recording the replayed job. Returns false if
    /// it was already resolved (the caller must reject the replay).
    async fn mark_resolved(&self, id: Uuid, replayed_job_id: Uuid) -> Result<bool>;

    /// Drop resolved entries older than the retention cutoff. Returns the
    /// number removed.
    async fn purge_resolved(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// A versioned document read from the state store.
pub type VersionedDoc = (serde_json::Value, u64);

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<VersionedDoc>>;

    /// Compare-and-swap. `expected = None` creates the key only if absent;
    /// `expected = Some(v)` replaces only if the stored version is still
    /// `v`. Returns false when the expectation failed and the caller should
    /// re-read and retry.
    async fn store(
        &self,
        key: &str,
        doc: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<bool>;

    /// Delete a key. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys under a prefix (admin and health enumeration).
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// How many CAS rounds a caller makes before treating contention as a store
/// failure. High enough that real contention wins through, low enough that a
/// broken store cannot spin forever.
pub const CAS_MAX_ROUNDS: usize = 16;
