//! # Windlass
//!
//! The outbound-reliability core: durable background jobs executed against
//! unreliable third-party services (a messaging gateway, a calendar
//! provider, an inference service, an object store, a push dispatcher) with
//! failure isolation, bounded retry, cost-capped rate limiting, and
//! guaranteed eventual handling of permanent failures.
//!
//! ## Architecture
//!
//! ```text
//! domain event
//!     │
//!     ▼ JobStore::enqueue (idempotency-keyed)
//! ┌─────────┐   claim_due    ┌────────┐   execute_once   ┌───────────────┐
//! │ JobStore│ ─────────────► │ Worker │ ───────────────► │ RetryExecutor │
//! └─────────┘                └────────┘                  └───────┬───────┘
//!     ▲    ▲                     │                               │
//!     │    └── complete/fail/defer                               ▼
//!     │                          │                  CircuitBreaker + Gates
//!     │        exhausted budget  ▼                   (shared StateStore)
//!     │                  ┌────────────────┐                      │
//!     │     replay       │ DeadLetterStore│                      ▼
//!     └───────────────── │   + AdminApi   │              external provider
//!                        └────────────────┘
//! ```
//!
//! ## Key invariants
//!
//! 1. **At-least-once, never silently dropped**: a job ends Completed or
//!    DeadLettered; dead letters persist until replayed or purged.
//! 2. **One claim owner**: claims are atomic per record and protected by a
//!    visibility timeout; a crashed worker's job becomes reclaimable.
//! 3. **One active job per idempotency key**: enqueueing a duplicate while
//!    the first is Pending/Processing is rejected.
//! 4. **Shared counters are authoritative**: circuit, rate, and quota state
//!    live behind per-key compare-and-swap in a single store, never in
//!    per-process globals.
//! 5. **Safety gates fail closed**: an unreachable limiter store denies the
//!    call. Cost safety beats availability here, deliberately.
//! 6. **Waits never hold workers**: backoff and retry-after waits are
//!    expressed as job reschedules, not in-worker sleeps.

pub mod admin;
pub mod backoff;
pub mod circuit;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod executor;
pub mod health;
pub mod job;
pub mod limits;
pub mod store;
pub mod worker;

pub use admin::{AdminApi, ReplayReceipt};
pub use backoff::BackoffCalculator;
pub use circuit::{Admission, CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use config::Config;
pub use dead_letter::{DeadLetterEntry, DeadLetterFilter};
pub use error::{
    EnqueueError, ErrorClass, ExecuteError, FailureRecord, ProviderError, ReplayError,
};
pub use executor::{ExecutorConfig, RetryExecutor};
pub use health::{HealthProbe, HealthSnapshot};
pub use job::{Dependency, Job, JobPayload, JobStatus, NewJob};
pub use limits::{GateConfig, GateDenial, Gates, QuotaUsage, ResultCache};
pub use store::memory::{MemoryDeadLetterStore, MemoryJobStore, MemoryStateStore};
pub use store::postgres::{
    run_migrations, PostgresDeadLetterStore, PostgresJobStore, PostgresStateStore,
};
pub use store::{DeadLetterStore, FailOutcome, JobStore, QueueStats, StateStore};
pub use worker::{HandlerRegistry, JobHandler, Worker, WorkerConfig};
