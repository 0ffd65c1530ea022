//! Worker service: polls the job store, executes claimed jobs through the
//! retry executor, and finalizes the outcome.
//!
//! # Flow
//!
//! ```text
//! Worker (N pollers)
//!     │
//!     ├─► claim_due(worker_id, batch)        atomic claim + lease
//!     ├─► decode payload (HandlerRegistry)   unknown/invalid → permanent
//!     ├─► RetryExecutor::execute_once        circuit + gates + timeout
//!     └─► complete / fail / defer
//!             └─► exhausted → DeadLetterStore (+ mark_dead_lettered)
//! ```
//!
//! Outcome policy: success completes; a provider failure consumes one
//! attempt and either reschedules with the executor's backoff delay or
//! dead-letters on exhaustion; a skipped call (circuit open, rate limited,
//! quota exhausted, state store down) defers the job to the retry-after hint
//! without consuming an attempt. Backoff waits therefore never occupy a
//! worker slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorClass, ExecuteError, FailureRecord, ProviderError};
use crate::executor::RetryExecutor;
use crate::job::{Job, JobPayload};
use crate::store::{DeadLetterStore, FailOutcome, JobStore};

/// Handler for one payload variant. Implementations talk to the external
/// system and report failures as [`ProviderError`] so classification stays
/// with the reliability core.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job, payload: JobPayload) -> Result<(), ProviderError>;
}

/// Maps `job_type` tags to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this job type.
    pub fn register(&mut self, job_type: &'static str, handler: Arc<dyn JobHandler>) {
        if self.handlers.contains_key(job_type) {
            panic!("handler already registered for job type: {job_type}");
        }
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent poll loops.
    pub pollers: usize,
    /// Jobs claimed per poll.
    pub batch_size: i64,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Lease extension cadence for long-running jobs.
    pub heartbeat_interval: Duration,
    /// Defer distance for skipped calls that carry no retry-after hint.
    pub default_defer: Duration,
    /// Identifier prefix for this worker instance.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pollers: 2,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            default_defer: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    executor: Arc<RetryExecutor>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        executor: Arc<RetryExecutor>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            dead_letters,
            executor,
            registry,
            config,
        }
    }

    /// Run the poller pool until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            pollers = self.config.pollers,
            batch_size = self.config.batch_size,
            "worker starting"
        );

        let mut handles = Vec::with_capacity(self.config.pollers.max(1));
        for n in 0..self.config.pollers.max(1) {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            let poller_id = format!("{}-{n}", self.config.worker_id);
            handles.push(tokio::spawn(async move {
                worker.poll_loop(poller_id, shutdown).await;
            }));
        }
        futures::future::join_all(handles).await;

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    async fn poll_loop(&self, poller_id: String, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.tick(&poller_id).await {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(count) => {
                    debug!(poller_id = %poller_id, count, "processed batch");
                }
                Err(err) => {
                    error!(poller_id = %poller_id, error = %err, "poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    /// Claim and process one batch. Returns how many jobs were claimed.
    /// Exposed for embedders that drive their own scheduling, and for tests.
    pub async fn tick(&self, poller_id: &str) -> Result<usize> {
        let jobs = self
            .store
            .claim_due(poller_id, self.config.batch_size)
            .await?;
        let count = jobs.len();
        if count == 0 {
            return Ok(0);
        }

        let mut handles = Vec::with_capacity(count);
        for job in jobs {
            handles.push(self.process_job(job));
        }
        futures::future::join_all(handles).await;
        Ok(count)
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let payload = match job.payload() {
            Ok(payload) => payload,
            Err(err) => {
                error!(job_id = %job_id, job_type = %job_type, error = %err, "payload does not decode");
                self.fail_permanently(&job, format!("invalid payload: {err}"))
                    .await;
                return;
            }
        };

        let Some(handler) = self.registry.get(&job.job_type) else {
            error!(job_id = %job_id, job_type = %job_type, "no handler registered");
            self.fail_permanently(&job, format!("no handler registered for {job_type}"))
                .await;
            return;
        };

        let dependency = payload.dependency().as_str();
        let outcome = self
            .execute_with_heartbeat(&job, payload, dependency, handler)
            .await;

        match outcome {
            Ok(()) => {
                debug!(job_id = %job_id, job_type = %job_type, "job succeeded");
                if let Err(err) = self.store.complete(job_id).await {
                    error!(job_id = %job_id, error = %err, "failed to mark job completed");
                }
            }
            Err(ExecuteError::Provider { class, source, .. }) => {
                let failure = FailureRecord::new(job.attempts + 1, class, source.to_string());
                self.record_failure(&job, failure).await;
            }
            Err(skipped) => {
                // The dependency was never invoked: circuit open, gate
                // denial, or unreachable shared state. Park the job without
                // spending an attempt.
                let delay = skipped.retry_after().unwrap_or(self.config.default_defer);
                let until = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                debug!(
                    job_id = %job_id,
                    job_type = %job_type,
                    reason = %skipped,
                    defer_until = %until,
                    "call skipped, deferring job"
                );
                if let Err(err) = self.store.defer(job_id, until).await {
                    error!(job_id = %job_id, error = %err, "failed to defer job");
                }
            }
        }
    }

    /// Execute the handler while a background task keeps the claim's lease
    /// fresh, so long calls are not reclaimed mid-flight.
    async fn execute_with_heartbeat(
        &self,
        job: &Job,
        payload: JobPayload,
        dependency: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), ExecuteError> {
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_guard = heartbeat_cancel.clone();
        let store = Arc::clone(&self.store);
        let interval = self.config.heartbeat_interval;
        let job_id = job.id;

        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = heartbeat_guard.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = store.extend_lease(job_id).await {
                            warn!(job_id = %job_id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let result = self
            .executor
            .execute_once(dependency, || handler.run(job, payload.clone()))
            .await;

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        result
    }

    async fn record_failure(&self, job: &Job, failure: FailureRecord) {
        let delay = self.executor.retry_delay(job.attempts as u32);
        match self.store.fail(job.id, failure, delay).await {
            Ok(FailOutcome::Rescheduled { next_run_at }) => {
                debug!(job_id = %job.id, next_run_at = %next_run_at, "job rescheduled");
            }
            Ok(FailOutcome::Exhausted { job }) => {
                self.dead_letter(job).await;
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to record job failure");
            }
        }
    }

    async fn fail_permanently(&self, job: &Job, message: String) {
        let failure = FailureRecord::new(job.attempts + 1, ErrorClass::Permanent, message);
        self.record_failure(job, failure).await;
    }

    async fn dead_letter(&self, job: Job) {
        match self.dead_letters.move_to_dead_letter(&job).await {
            Ok(entry) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    entry_id = %entry.id,
                    attempts = job.attempts,
                    "job dead-lettered"
                );
                if let Err(err) = self.store.mark_dead_lettered(job.id).await {
                    error!(job_id = %job.id, error = %err, "failed to mark job dead-lettered");
                }
            }
            Err(err) => {
                // The job stays in Failed; the move is retried the next time
                // an operator or sweep touches it.
                error!(job_id = %job.id, error = %err, "dead-letter move failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl JobHandler for NoopHandler {
        async fn run(&self, _job: &Job, _payload: JobPayload) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[test]
    fn registry_lookup_and_membership() {
        let mut registry = HandlerRegistry::new();
        registry.register("message:send", Arc::new(NoopHandler));

        assert!(registry.has("message:send"));
        assert!(registry.get("message:send").is_some());
        assert!(!registry.has("calendar:sync"));
        assert!(registry.get("calendar:sync").is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn registry_rejects_duplicate_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register("message:send", Arc::new(NoopHandler));
        registry.register("message:send", Arc::new(NoopHandler));
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = WorkerConfig::default();
        assert_eq!(config.pollers, 2);
        assert_eq!(config.batch_size, 10);
        assert!(config.worker_id.starts_with("worker-"));
    }
}
