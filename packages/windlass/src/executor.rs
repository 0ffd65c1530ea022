//! RetryExecutor: one external call wrapped in the full reliability policy.
//!
//! The order of operations around each invocation:
//!
//! 1. Circuit admission: fail fast while Open, no cost incurred.
//! 2. Cost gates, for quota-sensitive dependencies: quota then window,
//!    fail closed on store trouble.
//! 3. The call itself, bounded by a per-call timeout. An elapsed deadline
//!    abandons the call (no forced mid-flight cancellation) and classifies
//!    as Retryable.
//! 4. Classification and breaker bookkeeping. Skipped calls (circuit open,
//!    gate denial, provider 429) never count as dependency failures.
//!
//! Control flow is an explicit result type, never an exception-style escape:
//! `Ok(value)` or [`ExecuteError`] carrying the classification and the number
//! of attempts actually made.
//!
//! Two entry points: [`RetryExecutor::execute`] owns the in-process retry
//! loop for direct callers; [`RetryExecutor::execute_once`] makes a single
//! attempt for the worker, which expresses backoff waits as job reschedules
//! instead of occupying a worker slot for the wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::backoff::BackoffCalculator;
use crate::circuit::{Admission, CircuitBreaker};
use crate::error::{ErrorClass, ExecuteError, ProviderError};
use crate::limits::{GateDenial, Gates, ResultCache};

/// Fallback retry-after when a 429 arrives without a hint.
const DEFAULT_RATE_LIMIT_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// In-process attempt budget for [`RetryExecutor::execute`].
    pub max_attempts: u32,
    /// Deadline for each individual invocation.
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct RetryExecutor {
    circuit: Arc<CircuitBreaker>,
    gates: Arc<Gates>,
    cache: Arc<ResultCache>,
    backoff: BackoffCalculator,
    config: ExecutorConfig,
}

impl RetryExecutor {
    pub fn new(
        circuit: Arc<CircuitBreaker>,
        gates: Arc<Gates>,
        cache: Arc<ResultCache>,
        backoff: BackoffCalculator,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            circuit,
            gates,
            cache,
            backoff,
            config,
        }
    }

    /// The delay a rescheduler should apply after `attempt` failures.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Run `op` with the full in-process retry loop: Retryable failures
    /// consume budget with backoff waits in between, up to `max_attempts`.
    pub async fn execute<T, F, Fut>(&self, dependency: &str, op: F) -> Result<T, ExecuteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run(dependency, op, self.config.max_attempts).await
    }

    /// Make exactly one attempt. Retryable failures surface immediately so
    /// the caller can reschedule instead of waiting in place.
    pub async fn execute_once<T, F, Fut>(&self, dependency: &str, op: F) -> Result<T, ExecuteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run(dependency, op, 1).await
    }

    /// Read-through variant: a fresh cache entry for `cache_key` bypasses
    /// the circuit, both gates, and the call itself.
    pub async fn execute_cached<T, F, Fut>(
        &self,
        dependency: &str,
        cache_key: &str,
        op: F,
    ) -> Result<T, ExecuteError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if let Some(value) = self.cache.get(cache_key).await {
            match serde_json::from_value(value) {
                Ok(decoded) => {
                    debug!(dependency, cache_key, "cache hit, skipping call");
                    return Ok(decoded);
                }
                Err(err) => {
                    warn!(cache_key, error = %err, "cache entry undecodable, refetching");
                }
            }
        }

        let value = self.run(dependency, op, self.config.max_attempts).await?;
        if let Ok(encoded) = serde_json::to_value(&value) {
            if let Err(err) = self.cache.put(cache_key, encoded).await {
                warn!(cache_key, error = %err, "cache write failed");
            }
        }
        Ok(value)
    }

    async fn run<T, F, Fut>(
        &self,
        dependency: &str,
        mut op: F,
        budget: u32,
    ) -> Result<T, ExecuteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts: u32 = 0;

        loop {
            // 1. Circuit admission.
            let admission = match self.circuit.admit(dependency).await {
                Ok(admission) => admission,
                Err(err) => {
                    error!(dependency, error = %err, "circuit state unreachable, denying call");
                    return Err(ExecuteError::StoreUnavailable {
                        dependency: dependency.to_string(),
                    });
                }
            };
            let probe = match admission {
                Admission::Denied { retry_after } => {
                    return Err(ExecuteError::CircuitOpen {
                        dependency: dependency.to_string(),
                        retry_after,
                    });
                }
                Admission::Allowed { probe } => probe,
            };

            // 2. Cost gates. A denial here skipped the call, so a held probe
            // slot goes back.
            if self.gates.is_limited(dependency) {
                if let Err(denial) = self.gates.admit(dependency, None).await {
                    if probe {
                        if let Err(err) = self.circuit.release_probe(dependency).await {
                            warn!(dependency, error = %err, "failed to release probe slot");
                        }
                    }
                    return Err(match denial {
                        GateDenial::QuotaExhausted { retry_after } => {
                            ExecuteError::QuotaExceeded {
                                dependency: dependency.to_string(),
                                retry_after,
                            }
                        }
                        GateDenial::RateLimited { retry_after } => ExecuteError::RateLimited {
                            dependency: dependency.to_string(),
                            retry_after,
                        },
                        GateDenial::StoreUnavailable => ExecuteError::StoreUnavailable {
                            dependency: dependency.to_string(),
                        },
                    });
                }
            }

            // 3. The invocation, bounded by the per-call deadline.
            attempts += 1;
            let outcome = match tokio::time::timeout(self.config.call_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout {
                    timeout: self.config.call_timeout,
                }),
            };

            // 4. Classification and breaker bookkeeping.
            match outcome {
                Ok(value) => {
                    if let Err(err) = self.circuit.record_success(dependency, probe).await {
                        warn!(dependency, error = %err, "failed to record circuit success");
                    }
                    return Ok(value);
                }
                Err(provider_err) => {
                    let class = provider_err.class();
                    match class {
                        ErrorClass::RateLimited => {
                            // The provider answered; it is not failing. The
                            // probe slot goes back untouched.
                            if probe {
                                if let Err(err) = self.circuit.release_probe(dependency).await {
                                    warn!(dependency, error = %err, "failed to release probe slot");
                                }
                            }
                            return Err(ExecuteError::RateLimited {
                                dependency: dependency.to_string(),
                                retry_after: provider_err
                                    .retry_after()
                                    .unwrap_or(DEFAULT_RATE_LIMIT_RETRY),
                            });
                        }
                        ErrorClass::Permanent => {
                            self.record_failure(dependency, probe).await;
                            return Err(ExecuteError::Provider {
                                class,
                                attempts,
                                source: provider_err,
                            });
                        }
                        ErrorClass::Retryable => {
                            self.record_failure(dependency, probe).await;
                            if attempts >= budget {
                                return Err(ExecuteError::Provider {
                                    class,
                                    attempts,
                                    source: provider_err,
                                });
                            }
                            let delay = self.backoff.delay(attempts - 1);
                            debug!(
                                dependency,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %provider_err,
                                "retryable failure, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    async fn record_failure(&self, dependency: &str, probe: bool) {
        if let Err(err) = self.circuit.record_failure(dependency, probe).await {
            warn!(dependency, error = %err, "failed to record circuit failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitConfig, CircuitState};
    use crate::limits::GateConfig;
    use crate::store::memory::MemoryStateStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        executor: RetryExecutor,
        circuit: Arc<CircuitBreaker>,
        state: Arc<MemoryStateStore>,
    }

    fn harness(limits: HashMap<String, GateConfig>) -> Harness {
        let state = Arc::new(MemoryStateStore::new());
        let circuit = Arc::new(CircuitBreaker::new(
            Arc::clone(&state) as Arc<dyn crate::store::StateStore>,
            CircuitConfig::default(),
        ));
        let gates = Arc::new(Gates::new(
            Arc::clone(&state) as Arc<dyn crate::store::StateStore>,
            limits,
        ));
        let cache = Arc::new(ResultCache::new(
            Arc::clone(&state) as Arc<dyn crate::store::StateStore>,
            Duration::from_secs(300),
        ));
        let executor = RetryExecutor::new(
            Arc::clone(&circuit),
            gates,
            cache,
            BackoffCalculator::new(Duration::from_millis(10), Duration::from_secs(1)),
            ExecutorConfig {
                max_attempts: 3,
                call_timeout: Duration::from_secs(5),
            },
        );
        Harness {
            executor,
            circuit,
            state,
        }
    }

    fn no_limits() -> HashMap<String, GateConfig> {
        HashMap::new()
    }

    #[tokio::test]
    async fn success_passes_the_value_through() {
        let h = harness(no_limits());
        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = h
            .executor
            .execute("messaging", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_failure_aborts_without_consuming_budget() {
        let h = harness(no_limits());
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = h
            .executor
            .execute("messaging", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status(404, "gone")) }
            })
            .await;

        match result.unwrap_err() {
            ExecuteError::Provider {
                class, attempts, ..
            } => {
                assert_eq!(class, ErrorClass::Permanent);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected Provider, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_consume_the_whole_budget() {
        let h = harness(no_limits());
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = h
            .executor
            .execute("messaging", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status(503, "unavailable")) }
            })
            .await;

        match result.unwrap_err() {
            ExecuteError::Provider {
                class, attempts, ..
            } => {
                assert_eq!(class, ErrorClass::Retryable);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Provider, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_timeout_classifies_as_retryable() {
        let h = harness(no_limits());
        let result: Result<(), _> = h
            .executor
            .execute_once("object-store", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        match result.unwrap_err() {
            ExecuteError::Provider { class, source, .. } => {
                assert_eq!(class, ErrorClass::Retryable);
                assert!(matches!(source, ProviderError::Timeout { .. }));
            }
            other => panic!("expected Provider, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_invoking() {
        let h = harness(no_limits());

        // Two full budgets of 500s trips the default threshold of 5.
        for _ in 0..2 {
            let _ = h
                .executor
                .execute("inference", || async {
                    Err::<(), _>(ProviderError::from_status(500, "boom"))
                })
                .await;
        }
        assert_eq!(
            h.circuit.snapshot("inference").await.unwrap().state,
            CircuitState::Open
        );

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = h
            .executor
            .execute("inference", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(
            result.unwrap_err(),
            ExecuteError::CircuitOpen { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "dependency must not be invoked");
    }

    #[tokio::test]
    async fn provider_429_surfaces_with_hint_and_spares_the_circuit() {
        let h = harness(no_limits());
        let result: Result<(), _> = h
            .executor
            .execute("messaging", || async {
                Err(ProviderError::Status {
                    status: 429,
                    message: "too many".into(),
                    retry_after: Some(Duration::from_secs(12)),
                })
            })
            .await;

        match result.unwrap_err() {
            ExecuteError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(12));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        let snapshot = h.circuit.snapshot("messaging").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn gate_denial_skips_the_call() {
        let mut limits = HashMap::new();
        limits.insert(
            "inference".to_string(),
            GateConfig {
                per_minute: Some(1),
                per_day: None,
            },
        );
        let h = harness(limits);

        let ok: Result<(), _> = h.executor.execute("inference", || async { Ok(()) }).await;
        ok.unwrap();

        let calls = AtomicU32::new(0);
        let denied: Result<(), _> = h
            .executor
            .execute("inference", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(
            denied.unwrap_err(),
            ExecuteError::RateLimited { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // A skipped call is not a dependency failure.
        assert_eq!(
            h.circuit
                .snapshot("inference")
                .await
                .unwrap()
                .consecutive_failures,
            0
        );
    }

    #[tokio::test]
    async fn state_store_outage_denies_the_call() {
        let h = harness(no_limits());
        h.state.set_unavailable(true);

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = h
            .executor
            .execute("push", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(
            result.unwrap_err(),
            ExecuteError::StoreUnavailable { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_hit_bypasses_gates_and_the_call() {
        let mut limits = HashMap::new();
        limits.insert(
            "inference".to_string(),
            GateConfig {
                per_minute: Some(1),
                per_day: None,
            },
        );
        let h = harness(limits);

        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = Arc::clone(&calls);
        let first: String = h
            .executor
            .execute_cached("inference", "transcript:rec-9", move || {
                op_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok("hello world".to_string()) }
            })
            .await
            .unwrap();
        assert_eq!(first, "hello world");

        // The window is spent; only the cache can satisfy this one.
        let op_calls = Arc::clone(&calls);
        let second: String = h
            .executor
            .execute_cached("inference", "transcript:rec-9", move || {
                op_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok("never".to_string()) }
            })
            .await
            .unwrap();
        assert_eq!(second, "hello world");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_the_circuit_through_the_executor() {
        let state = Arc::new(MemoryStateStore::new());
        let circuit = Arc::new(CircuitBreaker::new(
            Arc::clone(&state) as Arc<dyn crate::store::StateStore>,
            CircuitConfig {
                failure_threshold: 2,
                cooldown: Duration::from_millis(0),
            },
        ));
        let gates = Arc::new(Gates::new(
            Arc::clone(&state) as Arc<dyn crate::store::StateStore>,
            HashMap::new(),
        ));
        let cache = Arc::new(ResultCache::new(
            Arc::clone(&state) as Arc<dyn crate::store::StateStore>,
            Duration::from_secs(300),
        ));
        let executor = RetryExecutor::new(
            Arc::clone(&circuit),
            gates,
            cache,
            BackoffCalculator::new(Duration::from_millis(1), Duration::from_millis(1)),
            ExecutorConfig {
                max_attempts: 1,
                call_timeout: Duration::from_secs(5),
            },
        );

        for _ in 0..2 {
            let _ = executor
                .execute_once("calendar", || async {
                    Err::<(), _>(ProviderError::from_status(500, "boom"))
                })
                .await;
        }
        assert_eq!(
            circuit.snapshot("calendar").await.unwrap().state,
            CircuitState::Open
        );

        // Zero cooldown: the next call is the probe, and it succeeds.
        let ok: Result<i32, _> = executor.execute_once("calendar", || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let snapshot = circuit.snapshot("calendar").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }
}
