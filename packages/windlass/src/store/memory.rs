//! In-memory store implementations.
//!
//! Deterministic backing for tests and single-process embedding. These honor
//! the same contracts as the Postgres implementations (atomic claims,
//! versioned CAS, idempotent dead-letter moves) behind a process-local
//! mutex instead of row locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter};
use crate::error::{EnqueueError, ErrorClass, FailureRecord};
use crate::job::{Job, JobStatus, NewJob};

use super::{
    DeadLetterStore, FailOutcome, JobStore, QueueStats, StateStore, VersionedDoc,
    DEFAULT_VISIBILITY_TIMEOUT,
};

// ============================================================================
// Jobs
// ============================================================================

pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    visibility_timeout: Duration,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            visibility_timeout,
        }
    }

    /// Snapshot every job, newest first. Test/inspection helper.
    pub async fn all_jobs(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        all
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<Uuid, EnqueueError> {
        let job = new_job.into_job()?;
        let mut jobs = self.jobs.lock().await;

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = jobs
                .values()
                .find(|j| j.status.is_active() && j.idempotency_key.as_ref() == Some(key))
            {
                return Err(EnqueueError::Duplicate {
                    existing: existing.id,
                });
            }
        }

        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn claim_due(&self, worker_id: &str, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| j.id)
            .collect();
        due.sort_by_key(|id| {
            let j = &jobs[id];
            j.next_run_at.unwrap_or(j.created_at)
        });
        due.truncate(limit.max(0) as usize);

        let lease = chrono::Duration::from_std(self.visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let job = jobs.get_mut(&id).expect("id came from this map");
            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id.to_string());
            job.lease_expires_at = Some(now + lease);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;
        job.status = JobStatus::Completed;
        job.worker_id = None;
        job.lease_expires_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        failure: FailureRecord,
        retry_delay: Duration,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;

        job.attempts += 1;
        job.last_error = Some(failure.message.clone());
        let permanent = failure.class == ErrorClass::Permanent;
        job.failure_history.0.push(failure);
        job.updated_at = now;
        job.worker_id = None;
        job.lease_expires_at = None;

        if !permanent && job.attempts < job.max_attempts {
            let next_run_at = now
                + chrono::Duration::from_std(retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            job.status = JobStatus::Pending;
            job.next_run_at = Some(next_run_at);
            Ok(FailOutcome::Rescheduled { next_run_at })
        } else {
            job.status = JobStatus::Failed;
            Ok(FailOutcome::Exhausted { job: job.clone() })
        }
    }

    async fn defer(&self, job_id: Uuid, until: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;
        job.status = JobStatus::Pending;
        job.next_run_at = Some(until);
        job.worker_id = None;
        job.lease_expires_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Processing {
                let lease = chrono::Duration::from_std(self.visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                job.lease_expires_at = Some(Utc::now() + lease);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_dead_lettered(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::DeadLettered;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let jobs = self.jobs.lock().await;
        let pending: Vec<&Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        let oldest_pending_age = pending
            .iter()
            .map(|j| now - j.created_at)
            .max()
            .and_then(|age| age.to_std().ok());
        Ok(QueueStats {
            queue_depth: pending.len() as i64,
            oldest_pending_age,
        })
    }
}

// ============================================================================
// Dead letters
// ============================================================================

#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<HashMap<Uuid, DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn move_to_dead_letter(&self, job: &Job) -> Result<DeadLetterEntry> {
        let mut entries = self.entries.lock().await;
        // Idempotent per job: a second move returns the existing entry.
        if let Some(existing) = entries.values().find(|e| e.job_id == job.id) {
            return Ok(existing.clone());
        }
        let entry = DeadLetterEntry::for_job(job);
        entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self.entries.lock().await.get(&id).cloned())
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.lock().await;
        let mut matched: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by_key(|e| std::cmp::Reverse(e.moved_at));
        matched.truncate(filter.limit.max(0) as usize);
        Ok(matched)
    }

    async fn mark_resolved(&self, id: Uuid, replayed_job_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("dead letter entry not found: {id}"))?;
        if entry.resolved {
            return Ok(false);
        }
        entry.resolved = true;
        entry.resolved_at = Some(Utc::now());
        entry.replayed_job_id = Some(replayed_job_id);
        Ok(true)
    }

    async fn purge_resolved(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !(e.resolved && e.moved_at < older_than));
        Ok((before - entries.len()) as u64)
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// Versioned key-value documents with compare-and-swap, sharded by key.
///
/// `set_unavailable` simulates a backing-store outage so tests can verify
/// the fail-closed behavior of the gates.
#[derive(Default)]
pub struct MemoryStateStore {
    docs: DashMap<String, VersionedDoc>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("state store unavailable");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<VersionedDoc>> {
        self.check_available()?;
        Ok(self.docs.get(key).map(|entry| entry.value().clone()))
    }

    async fn store(
        &self,
        key: &str,
        doc: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<bool> {
        self.check_available()?;
        match self.docs.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match expected {
                Some(version) if occupied.get().1 == version => {
                    occupied.insert((doc, version + 1));
                    Ok(true)
                }
                _ => Ok(false),
            },
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    // Expected an existing version but the key vanished.
                    return Ok(false);
                }
                vacant.insert((doc, 1));
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.docs.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let mut keys: Vec<String> = self
            .docs
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
