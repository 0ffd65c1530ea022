//! Error taxonomy for outbound calls and queue operations.
//!
//! Errors here are structured and pattern-matchable instead of generic
//! `anyhow::Error`. `anyhow` stays internal transport inside store
//! implementations; everything that crosses a module boundary is one of the
//! enums below.
//!
//! The classification rule lives on [`ProviderError::class`]:
//! - 4xx other than 429 → [`ErrorClass::Permanent`] (retrying cannot help)
//! - 429 → [`ErrorClass::RateLimited`] (carries any retry-after the provider sent)
//! - 5xx, timeout, connection failure → [`ErrorClass::Retryable`]

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Classification of an outbound-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retrying cannot help (4xx other than 429). Dead-lettered after a
    /// single recorded attempt.
    Permanent,
    /// Possibly transient (5xx, timeout, connection failure). Retried while
    /// attempt budget remains.
    Retryable,
    /// The provider asked us to slow down (429). Not a dependency failure.
    RateLimited,
}

impl ErrorClass {
    /// Whether a failure of this class consumes retry budget.
    pub fn consumes_attempt(&self) -> bool {
        !matches!(self, ErrorClass::RateLimited)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// A failure returned by one invocation of an external provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success status.
    #[error("provider returned status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Retry-after hint, when the provider sent one (429 responses).
        retry_after: Option<Duration>,
    },

    /// The per-call deadline elapsed. The call is abandoned, not cancelled
    /// mid-flight.
    #[error("call exceeded its deadline of {timeout:?}")]
    Timeout { timeout: Duration },

    /// The call never produced a response (DNS, connect, TLS, broken pipe).
    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl ProviderError {
    /// Build from a non-success HTTP status plus response body excerpt.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Status { status: 429, .. } => ErrorClass::RateLimited,
            ProviderError::Status {
                status: 400..=499, ..
            } => ErrorClass::Permanent,
            ProviderError::Status { .. } => ErrorClass::Retryable,
            ProviderError::Timeout { .. } => ErrorClass::Retryable,
            ProviderError::Transport { .. } => ErrorClass::Retryable,
        }
    }

    /// Retry-after hint carried by the failure, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured deadline; zero means
            // "unknown" and is only used for display.
            return ProviderError::Timeout {
                timeout: Duration::ZERO,
            };
        }
        match err.status() {
            Some(status) => ProviderError::Status {
                status: status.as_u16(),
                message: err.to_string(),
                retry_after: None,
            },
            None => ProviderError::Transport {
                message: err.to_string(),
            },
        }
    }
}

/// One recorded failure in a job's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    /// 1-based attempt number this failure belongs to.
    pub attempt: i32,
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(attempt: i32, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            attempt,
            class,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Outcome of [`crate::executor::RetryExecutor`] wrapping one external call.
///
/// This is the explicit result type that crosses module boundaries: either
/// the call's value, or a structured account of why it did not happen.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The dependency's circuit is open; the call was skipped.
    #[error("circuit for {dependency} is open")]
    CircuitOpen {
        dependency: String,
        retry_after: Option<Duration>,
    },

    /// The daily cost ceiling is exhausted; the call was skipped.
    #[error("daily quota exhausted for {dependency}")]
    QuotaExceeded {
        dependency: String,
        retry_after: Duration,
    },

    /// The sliding-window limit is saturated; the call was skipped.
    #[error("rate limit hit for {dependency}")]
    RateLimited {
        dependency: String,
        retry_after: Duration,
    },

    /// The shared state backing a safety gate was unreachable. The call is
    /// denied (fail closed), trading availability for cost safety.
    #[error("shared state store unavailable; denying call to {dependency}")]
    StoreUnavailable { dependency: String },

    /// The provider was invoked and failed; retry budget is spent.
    #[error("{source}")]
    Provider {
        class: ErrorClass,
        /// How many invocations were actually made.
        attempts: u32,
        #[source]
        source: ProviderError,
    },
}

impl ExecuteError {
    /// Whether the dependency was actually invoked. Skipped calls update
    /// neither the circuit nor the job's attempt budget.
    pub fn dependency_was_invoked(&self) -> bool {
        matches!(self, ExecuteError::Provider { .. })
    }

    /// Retry-after hint, when the outcome carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExecuteError::CircuitOpen { retry_after, .. } => *retry_after,
            ExecuteError::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            ExecuteError::RateLimited { retry_after, .. } => Some(*retry_after),
            ExecuteError::StoreUnavailable { .. } => None,
            ExecuteError::Provider { source, .. } => source.retry_after(),
        }
    }
}

/// Enqueue-time rejections.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// An active (Pending or Processing) job already holds this idempotency key.
    #[error("a job with this idempotency key is already active: {existing}")]
    Duplicate { existing: Uuid },

    /// The payload did not match the tagged union for its job type.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Replay rejections from the admin surface.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("dead letter entry not found: {0}")]
    NotFound(Uuid),

    /// The entry was already replayed; a second replay is rejected.
    #[error("dead letter entry {id} is already resolved")]
    AlreadyResolved { id: Uuid },

    #[error("re-enqueue failed: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_4xx_is_permanent() {
        let err = ProviderError::from_status(404, "not found");
        assert_eq!(err.class(), ErrorClass::Permanent);
        let err = ProviderError::from_status(422, "unprocessable");
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn status_429_is_rate_limited() {
        let err = ProviderError::Status {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(17)),
        };
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
    }

    #[test]
    fn status_5xx_timeout_and_transport_are_retryable() {
        assert_eq!(
            ProviderError::from_status(503, "unavailable").class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ProviderError::Timeout {
                timeout: Duration::from_secs(30)
            }
            .class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ProviderError::Transport {
                message: "connection refused".into()
            }
            .class(),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn rate_limited_does_not_consume_attempt() {
        assert!(ErrorClass::Permanent.consumes_attempt());
        assert!(ErrorClass::Retryable.consumes_attempt());
        assert!(!ErrorClass::RateLimited.consumes_attempt());
    }

    #[test]
    fn skipped_outcomes_report_no_invocation() {
        let skipped = ExecuteError::CircuitOpen {
            dependency: "inference".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(!skipped.dependency_was_invoked());

        let invoked = ExecuteError::Provider {
            class: ErrorClass::Retryable,
            attempts: 3,
            source: ProviderError::from_status(500, "boom"),
        };
        assert!(invoked.dependency_was_invoked());
    }

    #[test]
    fn error_class_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorClass::RateLimited).unwrap(),
            "\"rate_limited\""
        );
    }
}
