//! Per-dependency circuit breaker.
//!
//! One logical breaker per dependency key, with its state held as a
//! versioned document in the shared [`StateStore`]. Every transition goes
//! through compare-and-swap, so concurrent callers across worker processes
//! never double-count failures, race past the threshold, or both win the
//! half-open probe slot.
//!
//! # State transitions
//! ```text
//! Closed → Open      consecutive failures reach the threshold
//! Open → HalfOpen    cooldown elapsed; the transitioning caller takes the probe
//! HalfOpen → Closed  probe succeeded (failure count resets)
//! HalfOpen → Open    probe failed (cooldown restarts)
//! ```
//!
//! While Open, calls fail fast without touching the dependency. While
//! HalfOpen, exactly one caller holds the probe; everyone else is denied.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{StateStore, CAS_MAX_ROUNDS};

const KEY_PREFIX: &str = "circuit:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays Open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// The persisted per-dependency document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CircuitDoc {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    /// At most one probe call is in flight while HalfOpen.
    probe_in_flight: bool,
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed. `probe` marks the single call admitted through a HalfOpen
    /// breaker; its outcome decides the next state.
    Allowed { probe: bool },
    /// Fail fast without invoking the dependency.
    Denied { retry_after: Option<Duration> },
}

/// Read-only view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn StateStore>, config: CircuitConfig) -> Self {
        Self { store, config }
    }

    fn key(dependency: &str) -> String {
        format!("{KEY_PREFIX}{dependency}")
    }

    async fn load_doc(&self, key: &str) -> Result<(CircuitDoc, Option<u64>)> {
        match self.store.load(key).await? {
            Some((value, version)) => {
                let doc = serde_json::from_value(value)
                    .context("corrupt circuit document")?;
                Ok((doc, Some(version)))
            }
            None => Ok((CircuitDoc::default(), None)),
        }
    }

    async fn save_doc(&self, key: &str, doc: &CircuitDoc, version: Option<u64>) -> Result<bool> {
        self.store
            .store(key, serde_json::to_value(doc)?, version)
            .await
    }

    /// Ask whether a call to `dependency` may proceed right now.
    pub async fn admit(&self, dependency: &str) -> Result<Admission> {
        let key = Self::key(dependency);
        let now = Utc::now();

        for _ in 0..CAS_MAX_ROUNDS {
            let (mut doc, version) = self.load_doc(&key).await?;

            match doc.state {
                CircuitState::Closed => return Ok(Admission::Allowed { probe: false }),
                CircuitState::Open => {
                    let cooldown = chrono::Duration::from_std(self.config.cooldown)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    let reopen_at = doc.opened_at.map(|at| at + cooldown).unwrap_or(now);
                    if now < reopen_at {
                        let retry_after = (reopen_at - now).to_std().ok();
                        return Ok(Admission::Denied { retry_after });
                    }
                    // Cooldown elapsed: whoever wins this CAS takes the probe.
                    doc.state = CircuitState::HalfOpen;
                    doc.probe_in_flight = true;
                    if self.save_doc(&key, &doc, version).await? {
                        info!(dependency, "circuit half-open, admitting probe");
                        return Ok(Admission::Allowed { probe: true });
                    }
                }
                CircuitState::HalfOpen => {
                    if doc.probe_in_flight {
                        return Ok(Admission::Denied {
                            retry_after: Some(self.config.cooldown),
                        });
                    }
                    doc.probe_in_flight = true;
                    if self.save_doc(&key, &doc, version).await? {
                        return Ok(Admission::Allowed { probe: true });
                    }
                }
            }
        }
        bail!("circuit admit for {dependency}: contention exceeded {CAS_MAX_ROUNDS} rounds");
    }

    /// Record a successful invocation.
    pub async fn record_success(&self, dependency: &str, probe: bool) -> Result<()> {
        let key = Self::key(dependency);
        for _ in 0..CAS_MAX_ROUNDS {
            let (mut doc, version) = self.load_doc(&key).await?;

            if probe {
                info!(dependency, "probe succeeded, closing circuit");
                doc = CircuitDoc::default();
            } else {
                if doc.consecutive_failures == 0 && doc.state == CircuitState::Closed {
                    return Ok(());
                }
                doc.consecutive_failures = 0;
            }

            if self.save_doc(&key, &doc, version).await? {
                return Ok(());
            }
        }
        bail!("circuit record_success for {dependency}: contention exceeded {CAS_MAX_ROUNDS} rounds");
    }

    /// Record a failed invocation.
    pub async fn record_failure(&self, dependency: &str, probe: bool) -> Result<()> {
        let key = Self::key(dependency);
        let now = Utc::now();

        for _ in 0..CAS_MAX_ROUNDS {
            let (mut doc, version) = self.load_doc(&key).await?;

            if probe {
                warn!(dependency, "probe failed, reopening circuit");
                doc.state = CircuitState::Open;
                doc.opened_at = Some(now);
                doc.probe_in_flight = false;
                doc.consecutive_failures = doc.consecutive_failures.saturating_add(1);
            } else {
                match doc.state {
                    CircuitState::Closed => {
                        doc.consecutive_failures = doc.consecutive_failures.saturating_add(1);
                        if doc.consecutive_failures >= self.config.failure_threshold {
                            warn!(
                                dependency,
                                failures = doc.consecutive_failures,
                                "failure threshold reached, opening circuit"
                            );
                            doc.state = CircuitState::Open;
                            doc.opened_at = Some(now);
                        }
                    }
                    // A late-arriving failure from a call that started before
                    // the breaker tripped changes nothing.
                    CircuitState::Open | CircuitState::HalfOpen => return Ok(()),
                }
            }

            if self.save_doc(&key, &doc, version).await? {
                return Ok(());
            }
        }
        bail!("circuit record_failure for {dependency}: contention exceeded {CAS_MAX_ROUNDS} rounds");
    }

    /// Give back a probe slot without recording an outcome. Used when the
    /// admitted call was skipped after all (a cost gate denied it), so the
    /// slot must not stay occupied forever.
    pub async fn release_probe(&self, dependency: &str) -> Result<()> {
        let key = Self::key(dependency);
        for _ in 0..CAS_MAX_ROUNDS {
            let (mut doc, version) = self.load_doc(&key).await?;
            if doc.state != CircuitState::HalfOpen || !doc.probe_in_flight {
                return Ok(());
            }
            doc.probe_in_flight = false;
            if self.save_doc(&key, &doc, version).await? {
                return Ok(());
            }
        }
        bail!("circuit release_probe for {dependency}: contention exceeded {CAS_MAX_ROUNDS} rounds");
    }

    /// Current state of one dependency's breaker.
    pub async fn snapshot(&self, dependency: &str) -> Result<CircuitSnapshot> {
        let (doc, _) = self.load_doc(&Self::key(dependency)).await?;
        Ok(CircuitSnapshot {
            dependency: dependency.to_string(),
            state: doc.state,
            consecutive_failures: doc.consecutive_failures,
            opened_at: doc.opened_at,
        })
    }

    /// Every breaker the store has seen, for the admin surface.
    pub async fn all_snapshots(&self) -> Result<Vec<CircuitSnapshot>> {
        let mut snapshots = Vec::new();
        for key in self.store.keys(KEY_PREFIX).await? {
            let dependency = key.trim_start_matches(KEY_PREFIX).to_string();
            snapshots.push(self.snapshot(&dependency).await?);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStateStore;

    fn breaker(cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(MemoryStateStore::new()),
            CircuitConfig {
                failure_threshold: 5,
                cooldown,
            },
        )
    }

    #[tokio::test]
    async fn five_consecutive_failures_open_the_circuit() {
        let breaker = breaker(Duration::from_secs(30));

        for _ in 0..4 {
            breaker.record_failure("messaging", false).await.unwrap();
            assert!(matches!(
                breaker.admit("messaging").await.unwrap(),
                Admission::Allowed { probe: false }
            ));
        }

        breaker.record_failure("messaging", false).await.unwrap();
        let snapshot = breaker.snapshot("messaging").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_failures, 5);
        assert!(matches!(
            breaker.admit("messaging").await.unwrap(),
            Admission::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn a_success_resets_the_failure_streak() {
        let breaker = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure("calendar", false).await.unwrap();
        }
        breaker.record_success("calendar", false).await.unwrap();
        for _ in 0..4 {
            breaker.record_failure("calendar", false).await.unwrap();
        }
        assert_eq!(
            breaker.snapshot("calendar").await.unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn cooldown_admits_exactly_one_probe() {
        let breaker = breaker(Duration::from_millis(20));
        for _ in 0..5 {
            breaker.record_failure("inference", false).await.unwrap();
        }
        assert!(matches!(
            breaker.admit("inference").await.unwrap(),
            Admission::Denied { .. }
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            breaker.admit("inference").await.unwrap(),
            Admission::Allowed { probe: true }
        );
        // The probe slot is taken; everyone else fails fast.
        assert!(matches!(
            breaker.admit("inference").await.unwrap(),
            Admission::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn probe_success_closes_and_resets() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            breaker.record_failure("push", false).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(
            breaker.admit("push").await.unwrap(),
            Admission::Allowed { probe: true }
        );

        breaker.record_success("push", true).await.unwrap();
        let snapshot = breaker.snapshot("push").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(matches!(
            breaker.admit("push").await.unwrap(),
            Admission::Allowed { probe: false }
        ));
    }

    #[tokio::test]
    async fn probe_failure_restarts_the_cooldown() {
        let breaker = breaker(Duration::from_millis(25));
        for _ in 0..5 {
            breaker.record_failure("object-store", false).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            breaker.admit("object-store").await.unwrap(),
            Admission::Allowed { probe: true }
        );

        breaker.record_failure("object-store", true).await.unwrap();
        let snapshot = breaker.snapshot("object-store").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(matches!(
            breaker.admit("object-store").await.unwrap(),
            Admission::Denied { .. }
        ));

        // After another cooldown a fresh probe is admitted.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            breaker.admit("object-store").await.unwrap(),
            Admission::Allowed { probe: true }
        );
    }

    #[tokio::test]
    async fn concurrent_admits_after_cooldown_yield_a_single_probe() {
        let breaker = Arc::new(breaker(Duration::from_millis(10)));
        for _ in 0..5 {
            breaker.record_failure("messaging", false).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(15)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            handles.push(tokio::spawn(
                async move { breaker.admit("messaging").await },
            ));
        }

        let mut probes = 0;
        for handle in handles {
            if let Admission::Allowed { probe: true } = handle.await.unwrap().unwrap() {
                probes += 1;
            }
        }
        assert_eq!(probes, 1);
    }

    #[tokio::test]
    async fn breakers_are_isolated_per_dependency() {
        let breaker = breaker(Duration::from_secs(30));
        for _ in 0..5 {
            breaker.record_failure("messaging", false).await.unwrap();
        }
        assert!(matches!(
            breaker.admit("messaging").await.unwrap(),
            Admission::Denied { .. }
        ));
        assert!(matches!(
            breaker.admit("calendar").await.unwrap(),
            Admission::Allowed { probe: false }
        ));
    }
}
