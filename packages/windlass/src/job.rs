//! Job model for durable background execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::FailureRecord;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    /// Retry budget spent; awaiting the move to the dead letter store.
    Failed,
    DeadLettered,
    Cancelled,
}

impl JobStatus {
    /// Active statuses hold the idempotency key; terminal ones release it.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLettered | JobStatus::Cancelled
        )
    }
}

/// The external system a job ultimately calls. Circuit breakers, rate
/// windows, and quotas are all keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    MessagingGateway,
    Calendar,
    Inference,
    ObjectStore,
    PushGateway,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::MessagingGateway => "messaging",
            Dependency::Calendar => "calendar",
            Dependency::Inference => "inference",
            Dependency::ObjectStore => "object-store",
            Dependency::PushGateway => "push",
        }
    }

    pub const ALL: [Dependency; 5] = [
        Dependency::MessagingGateway,
        Dependency::Calendar,
        Dependency::Inference,
        Dependency::ObjectStore,
        Dependency::PushGateway,
    ];
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Tagged union of job payloads, one variant per job kind. Validated at
/// enqueue time; the tag doubles as `job_type` on the stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Pull a contact's external calendar into the local schedule.
    SyncCalendar {
        account_id: Uuid,
        calendar_id: String,
    },
    /// Send an outbound message through the messaging gateway.
    SendMessage {
        contact_id: Uuid,
        to: String,
        body: String,
    },
    /// Transcribe a call recording via the inference service.
    TranscribeRecording { recording_id: Uuid, media_url: String },
    /// Copy an attachment into the object store.
    UploadAttachment {
        attachment_id: Uuid,
        source_url: String,
        content_type: String,
    },
    /// Dispatch a push notification to a device.
    DispatchNotification {
        device_token: String,
        title: String,
        body: String,
    },
}

impl JobPayload {
    /// The tag stored as `job_type` and used for handler dispatch.
    pub fn job_type(&self) -> &'static str {
        match self {
            JobPayload::SyncCalendar { .. } => "calendar:sync",
            JobPayload::SendMessage { .. } => "message:send",
            JobPayload::TranscribeRecording { .. } => "recording:transcribe",
            JobPayload::UploadAttachment { .. } => "attachment:upload",
            JobPayload::DispatchNotification { .. } => "notification:dispatch",
        }
    }

    /// The external system this payload targets.
    pub fn dependency(&self) -> Dependency {
        match self {
            JobPayload::SyncCalendar { .. } => Dependency::Calendar,
            JobPayload::SendMessage { .. } => Dependency::MessagingGateway,
            JobPayload::TranscribeRecording { .. } => Dependency::Inference,
            JobPayload::UploadAttachment { .. } => Dependency::ObjectStore,
            JobPayload::DispatchNotification { .. } => Dependency::PushGateway,
        }
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_type: String,
    pub payload: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,

    /// Invocations actually made against the provider so far.
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,

    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default = Json(Vec::new()))]
    pub failure_history: Json<Vec<FailureRecord>>,

    #[builder(default)]
    pub idempotency_key: Option<String>,

    // Claim ownership
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Deserialize the stored payload back into the tagged union.
    pub fn payload(&self) -> Result<JobPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Whether this job is due for a claim at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.next_run_at.map_or(true, |at| at <= now),
            // A lapsed lease makes a claimed job reclaimable.
            JobStatus::Processing => self.lease_expires_at.map_or(false, |at| at < now),
            _ => false,
        }
    }
}

/// A job submission. Built by the domain layer, validated and persisted by
/// [`crate::store::JobStore::enqueue`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewJob {
    pub payload: JobPayload,
    #[builder(default, setter(strip_option, into))]
    pub idempotency_key: Option<String>,
    #[builder(default = 3)]
    pub max_attempts: i32,
    /// When to first run the job. `None` means immediately.
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Convenience constructor for an immediate job with defaults.
    pub fn immediate(payload: JobPayload) -> Self {
        Self::builder().payload(payload).build()
    }

    /// Materialize the durable record.
    pub fn into_job(self) -> Result<Job, serde_json::Error> {
        let job_type = self.payload.job_type().to_string();
        let payload = serde_json::to_value(&self.payload)?;
        Ok(Job::builder()
            .job_type(job_type)
            .payload(payload)
            .max_attempts(self.max_attempts)
            .next_run_at(self.run_at.unwrap_or_else(Utc::now))
            .idempotency_key(self.idempotency_key)
            .build())
    }
}
