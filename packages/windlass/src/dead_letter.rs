//! Dead letters: durable holding area for jobs that exhausted their retry
//! budget, pending operator inspection or replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::FailureRecord;
use crate::job::Job;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    /// The job this entry was created from. Unique: a job is dead-lettered
    /// exactly once.
    pub job_id: Uuid,
    pub job_type: String,
    /// Snapshot of the job as it looked when it exhausted its budget.
    pub original_job: Json<Job>,
    /// Every recorded attempt: classification, message, timestamp. Length 1
    /// for permanent failures, the signal that retrying would not help.
    pub failure_history: Json<Vec<FailureRecord>>,
    pub moved_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    /// The fresh job created by replay, once resolved.
    pub replayed_job_id: Option<Uuid>,
}

impl DeadLetterEntry {
    /// Build the entry for a job whose budget is spent.
    pub fn for_job(job: &Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            original_job: Json(job.clone()),
            failure_history: Json(job.failure_history.0.clone()),
            moved_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            replayed_job_id: None,
        }
    }

    /// The idempotency key a replayed job carries, derived so that replaying
    /// the same entry twice cannot double-enqueue.
    pub fn replay_idempotency_key(&self) -> String {
        format!("replay:{}", self.id)
    }
}

/// Admin-surface query over dead letters.
#[derive(Debug, Clone, TypedBuilder)]
pub struct DeadLetterFilter {
    #[builder(default, setter(strip_option, into))]
    pub job_type: Option<String>,
    #[builder(default, setter(strip_option))]
    pub moved_after: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub moved_before: Option<DateTime<Utc>>,
    /// Resolved entries are hidden unless asked for.
    #[builder(default = false)]
    pub include_resolved: bool,
    #[builder(default = 100)]
    pub limit: i64,
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DeadLetterFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        if let Some(job_type) = &self.job_type {
            if &entry.job_type != job_type {
                return false;
            }
        }
        if let Some(after) = self.moved_after {
            if entry.moved_at < after {
                return false;
            }
        }
        if let Some(before) = self.moved_before {
            if entry.moved_at >= before {
                return false;
            }
        }
        if entry.resolved && !self.include_resolved {
            return false;
        }
        true
    }
}
