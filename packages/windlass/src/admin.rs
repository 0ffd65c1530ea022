//! Operator surface: inspect dead letters, replay them, read circuit and
//! quota state. Read-only plus replay; no domain logic. The transport that
//! exposes this (CLI, HTTP, whatever the operators run) lives outside this
//! crate.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::circuit::{CircuitBreaker, CircuitSnapshot};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter};
use crate::error::{EnqueueError, ReplayError};
use crate::job::NewJob;
use crate::limits::{Gates, QuotaUsage};
use crate::store::{DeadLetterStore, JobStore};

/// Receipt for a successful replay.
#[derive(Debug, Clone)]
pub struct ReplayReceipt {
    pub entry_id: Uuid,
    pub new_job_id: Uuid,
}

pub struct AdminApi {
    jobs: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    circuit: Arc<CircuitBreaker>,
    gates: Arc<Gates>,
}

impl AdminApi {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        circuit: Arc<CircuitBreaker>,
        gates: Arc<Gates>,
    ) -> Self {
        Self {
            jobs,
            dead_letters,
            circuit,
            gates,
        }
    }

    /// Dead letters matching the filter, newest first.
    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>> {
        self.dead_letters.list(filter).await
    }

    /// Re-enqueue a dead-lettered job once the external issue is resolved.
    ///
    /// The fresh job starts with zero attempts and a derived idempotency key
    /// so a racing second replay cannot double-enqueue. The entry is marked
    /// resolved afterwards; replaying an already-resolved entry is rejected.
    pub async fn replay(&self, entry_id: Uuid) -> Result<ReplayReceipt, ReplayError> {
        let entry = self
            .dead_letters
            .get(entry_id)
            .await?
            .ok_or(ReplayError::NotFound(entry_id))?;
        if entry.resolved {
            return Err(ReplayError::AlreadyResolved { id: entry_id });
        }

        let payload = entry
            .original_job
            .0
            .payload()
            .context("dead letter snapshot payload does not decode")?;

        let new_job = NewJob::builder()
            .payload(payload)
            .idempotency_key(entry.replay_idempotency_key())
            .max_attempts(entry.original_job.0.max_attempts)
            .build();

        let new_job_id = match self.jobs.enqueue(new_job).await {
            Ok(id) => id,
            // The derived key is already active: another replay of this
            // entry beat us to it.
            Err(EnqueueError::Duplicate { .. }) => {
                return Err(ReplayError::AlreadyResolved { id: entry_id });
            }
            Err(err) => return Err(ReplayError::Enqueue(err)),
        };

        self.dead_letters.mark_resolved(entry_id, new_job_id).await?;
        info!(entry_id = %entry_id, new_job_id = %new_job_id, "dead letter replayed");

        Ok(ReplayReceipt {
            entry_id,
            new_job_id,
        })
    }

    /// Every dependency's breaker state.
    pub async fn circuit_states(&self) -> Result<Vec<CircuitSnapshot>> {
        self.circuit.all_snapshots().await
    }

    /// Daily quota usage for every quota-limited dependency.
    pub async fn quota_usage(&self) -> Result<Vec<QuotaUsage>> {
        self.gates.all_usage().await
    }

    /// Drop resolved dead letters past the retention window.
    pub async fn purge_resolved_dead_letters(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        self.dead_letters.purge_resolved(older_than).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitConfig;
    use crate::job::{JobPayload, JobStatus};
    use crate::store::memory::{MemoryDeadLetterStore, MemoryJobStore, MemoryStateStore};
    use crate::store::StateStore;
    use std::collections::HashMap;

    fn admin() -> (AdminApi, Arc<MemoryJobStore>, Arc<MemoryDeadLetterStore>) {
        let jobs = Arc::new(MemoryJobStore::new());
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        let state = Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>;
        let circuit = Arc::new(CircuitBreaker::new(
            Arc::clone(&state),
            CircuitConfig::default(),
        ));
        let gates = Arc::new(Gates::new(state, HashMap::new()));
        (
            AdminApi::new(
                Arc::clone(&jobs) as Arc<dyn JobStore>,
                Arc::clone(&dead_letters) as Arc<dyn DeadLetterStore>,
                circuit,
                gates,
            ),
            jobs,
            dead_letters,
        )
    }

    fn payload() -> JobPayload {
        JobPayload::UploadAttachment {
            attachment_id: Uuid::new_v4(),
            source_url: "https://example.test/file.pdf".into(),
            content_type: "application/pdf".into(),
        }
    }

    #[tokio::test]
    async fn replay_re_enqueues_fresh_and_resolves() {
        let (admin, jobs, dead_letters) = admin();

        let mut dead = NewJob::immediate(payload()).into_job().unwrap();
        dead.attempts = 3;
        dead.status = JobStatus::Failed;
        let entry = dead_letters.move_to_dead_letter(&dead).await.unwrap();

        let receipt = admin.replay(entry.id).await.unwrap();
        let replayed = jobs.get(receipt.new_job_id).await.unwrap().unwrap();
        assert_eq!(replayed.attempts, 0);
        assert_eq!(replayed.status, JobStatus::Pending);
        assert_eq!(
            replayed.idempotency_key.as_deref(),
            Some(format!("replay:{}", entry.id).as_str())
        );

        let resolved = dead_letters.get(entry.id).await.unwrap().unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.replayed_job_id, Some(receipt.new_job_id));
    }

    #[tokio::test]
    async fn second_replay_is_rejected() {
        let (admin, _jobs, dead_letters) = admin();
        let dead = NewJob::immediate(payload()).into_job().unwrap();
        let entry = dead_letters.move_to_dead_letter(&dead).await.unwrap();

        admin.replay(entry.id).await.unwrap();
        assert!(matches!(
            admin.replay(entry.id).await.unwrap_err(),
            ReplayError::AlreadyResolved { .. }
        ));
    }

    #[tokio::test]
    async fn replay_of_unknown_entry_is_not_found() {
        let (admin, _jobs, _dead_letters) = admin();
        assert!(matches!(
            admin.replay(Uuid::new_v4()).await.unwrap_err(),
            ReplayError::NotFound(_)
        ));
    }
}
