//! Cost-control gates: daily quota, sliding-window rate limit, result cache.
//!
//! Two gates run in order before any quota-sensitive call:
//!
//! 1. **Daily quota**: a hard ceiling of calls per UTC day. Exceeded means
//!    the call is denied regardless of minute-level headroom.
//! 2. **Sliding window**: a cap on calls inside a rolling window (one
//!    minute by default), denied with a retry-after estimate.
//!
//! Both counters live in the shared [`StateStore`] so every worker process
//! sees the same numbers. If that store is unreachable the gates **fail
//! closed**: the call is denied. This trades availability for cost safety
//! and is intentional; do not invert it.
//!
//! [`ResultCache`] gives read-through reuse: an identical semantic input
//! within its TTL bypasses both gates entirely, because no call is made.
//! Writers must invalidate the entry when the underlying input changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::store::{StateStore, CAS_MAX_ROUNDS};

const QUOTA_PREFIX: &str = "quota:";
const RATE_PREFIX: &str = "rate:";
const CACHE_PREFIX: &str = "cache:";

/// Per-dependency limits. `None` disables that gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateConfig {
    pub per_minute: Option<u32>,
    pub per_day: Option<u32>,
}

impl GateConfig {
    pub fn is_limited(&self) -> bool {
        self.per_minute.is_some() || self.per_day.is_some()
    }
}

/// Why a gated call was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDenial {
    /// The daily ceiling is spent; headroom returns at the next UTC midnight.
    QuotaExhausted { retry_after: Duration },
    /// The rolling window is saturated.
    RateLimited { retry_after: Duration },
    /// The backing store was unreachable; the call is denied (fail closed).
    StoreUnavailable,
}

/// Quota numbers for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub dependency: String,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    /// When the daily counter resets (next UTC midnight).
    pub window_reset_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QuotaDoc {
    count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RateDoc {
    /// Timestamps of admitted calls, pruned to the rolling window.
    calls: Vec<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDoc {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    tomorrow
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// The quota key embeds the UTC calendar day, so the counter resets at the
/// day boundary by construction.
fn quota_key(dependency: &str, now: DateTime<Utc>) -> String {
    format!("{QUOTA_PREFIX}{dependency}:{}", now.format("%Y-%m-%d"))
}

fn rate_key(dependency: &str, identifier: Option<&str>) -> String {
    match identifier {
        Some(id) => format!("{RATE_PREFIX}{dependency}:{id}"),
        None => format!("{RATE_PREFIX}{dependency}"),
    }
}

pub struct Gates {
    store: Arc<dyn StateStore>,
    limits: HashMap<String, GateConfig>,
    window: Duration,
}

impl Gates {
    pub fn new(store: Arc<dyn StateStore>, limits: HashMap<String, GateConfig>) -> Self {
        Self::with_window(store, limits, Duration::from_secs(60))
    }

    pub fn with_window(
        store: Arc<dyn StateStore>,
        limits: HashMap<String, GateConfig>,
        window: Duration,
    ) -> Self {
        Self {
            store,
            limits,
            window,
        }
    }

    /// Whether `dependency` has any gate configured at all.
    pub fn is_limited(&self, dependency: &str) -> bool {
        self.limits
            .get(dependency)
            .map_or(false, GateConfig::is_limited)
    }

    /// Evaluate both gates and, if they admit the call, consume from both.
    ///
    /// A denial carries the retry-after estimate. Any store failure denies
    /// the call. Fail closed.
    pub async fn admit(
        &self,
        dependency: &str,
        identifier: Option<&str>,
    ) -> Result<(), GateDenial> {
        let Some(config) = self.limits.get(dependency).copied() else {
            return Ok(());
        };
        if !config.is_limited() {
            return Ok(());
        }

        match self.admit_inner(dependency, identifier, config).await {
            Ok(decision) => decision,
            Err(err) => {
                // Fail closed: an unreachable limiter store denies the call.
                error!(
                    dependency,
                    error = %err,
                    "limiter store unreachable, denying call"
                );
                Err(GateDenial::StoreUnavailable)
            }
        }
    }

    async fn admit_inner(
        &self,
        dependency: &str,
        identifier: Option<&str>,
        config: GateConfig,
    ) -> Result<Result<(), GateDenial>> {
        let now = Utc::now();

        // Gate 1: the daily ceiling is checked first. A saturated quota
        // denies even when the minute window has headroom.
        if let Some(per_day) = config.per_day {
            let (doc, _) = self.load_quota(dependency, now).await?;
            if doc.count >= per_day {
                return Ok(Err(GateDenial::QuotaExhausted {
                    retry_after: (next_utc_midnight(now) - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                }));
            }
        }

        // Gate 2: the rolling window, consumed atomically.
        if let Some(per_minute) = config.per_minute {
            if let Err(denial) = self
                .consume_window(dependency, identifier, per_minute, now)
                .await?
            {
                return Ok(Err(denial));
            }
        }

        // Consume quota last, re-validating the ceiling under CAS so the
        // hard limit is never exceeded even under races. The window slot
        // consumed above is not returned on a quota loss; overcounting the
        // window can only deny more, never overspend.
        if let Some(per_day) = config.per_day {
            if let Err(denial) = self.consume_quota(dependency, per_day, now).await? {
                return Ok(Err(denial));
            }
        }

        Ok(Ok(()))
    }

    async fn load_quota(
        &self,
        dependency: &str,
        now: DateTime<Utc>,
    ) -> Result<(QuotaDoc, Option<u64>)> {
        let key = quota_key(dependency, now);
        match self.store.load(&key).await? {
            Some((value, version)) => Ok((
                serde_json::from_value(value).context("corrupt quota document")?,
                Some(version),
            )),
            None => Ok((QuotaDoc::default(), None)),
        }
    }

    async fn consume_quota(
        &self,
        dependency: &str,
        per_day: u32,
        now: DateTime<Utc>,
    ) -> Result<Result<(), GateDenial>> {
        let key = quota_key(dependency, now);
        for _ in 0..CAS_MAX_ROUNDS {
            let (mut doc, version) = self.load_quota(dependency, now).await?;
            if doc.count >= per_day {
                return Ok(Err(GateDenial::QuotaExhausted {
                    retry_after: (next_utc_midnight(now) - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                }));
            }
            doc.count += 1;
            if self
                .store
                .store(&key, serde_json::to_value(&doc)?, version)
                .await?
            {
                return Ok(Ok(()));
            }
        }
        bail!("quota consume for {dependency}: contention exceeded {CAS_MAX_ROUNDS} rounds");
    }

    async fn consume_window(
        &self,
        dependency: &str,
        identifier: Option<&str>,
        per_minute: u32,
        now: DateTime<Utc>,
    ) -> Result<Result<(), GateDenial>> {
        let key = rate_key(dependency, identifier);
        let window = chrono::Duration::from_std(self.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        for _ in 0..CAS_MAX_ROUNDS {
            let (mut doc, version): (RateDoc, Option<u64>) = match self.store.load(&key).await? {
                Some((value, version)) => (
                    serde_json::from_value(value).context("corrupt rate document")?,
                    Some(version),
                ),
                None => (RateDoc::default(), None),
            };

            let cutoff = now - window;
            doc.calls.retain(|at| *at > cutoff);

            if doc.calls.len() >= per_minute as usize {
                // The window opens again once its oldest entry slides out.
                let oldest = doc.calls.iter().min().copied().unwrap_or(now);
                let retry_after = ((oldest + window) - now).to_std().unwrap_or(Duration::ZERO);
                return Ok(Err(GateDenial::RateLimited { retry_after }));
            }

            doc.calls.push(now);
            if self
                .store
                .store(&key, serde_json::to_value(&doc)?, version)
                .await?
            {
                return Ok(Ok(()));
            }
        }
        bail!("rate window consume for {dependency}: contention exceeded {CAS_MAX_ROUNDS} rounds");
    }

    /// Daily quota usage for one dependency (admin surface).
    pub async fn usage(&self, dependency: &str) -> Result<Option<QuotaUsage>> {
        let Some(config) = self.limits.get(dependency) else {
            return Ok(None);
        };
        let Some(limit) = config.per_day else {
            return Ok(None);
        };
        let now = Utc::now();
        let (doc, _) = self.load_quota(dependency, now).await?;
        Ok(Some(QuotaUsage {
            dependency: dependency.to_string(),
            used: doc.count,
            limit,
            remaining: limit.saturating_sub(doc.count),
            window_reset_at: next_utc_midnight(now),
        }))
    }

    /// Usage for every quota-limited dependency.
    pub async fn all_usage(&self) -> Result<Vec<QuotaUsage>> {
        let mut usages = Vec::new();
        let mut dependencies: Vec<&String> = self.limits.keys().collect();
        dependencies.sort();
        for dependency in dependencies {
            if let Some(usage) = self.usage(dependency).await? {
                usages.push(usage);
            }
        }
        Ok(usages)
    }
}

// ============================================================================
// Result cache
// ============================================================================

/// Read-through cache over the shared state store. A fresh entry for an
/// identical semantic input short-circuits the call and both gates.
pub struct ResultCache {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(key: &str) -> String {
        format!("{CACHE_PREFIX}{key}")
    }

    /// A cache miss on a store failure is fine: the caller proceeds to the
    /// gates, which fail closed on their own.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let full_key = Self::key(key);
        let loaded = match self.store.load(&full_key).await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(key, error = %err, "cache read failed, treating as miss");
                return None;
            }
        };
        let (value, _) = loaded?;
        let doc: CacheDoc = serde_json::from_value(value).ok()?;
        if doc.expires_at <= Utc::now() {
            return None;
        }
        Some(doc.value)
    }

    pub async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let full_key = Self::key(key);
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let doc = CacheDoc {
            value,
            expires_at: Utc::now() + ttl,
        };
        let encoded = serde_json::to_value(&doc)?;

        for _ in 0..CAS_MAX_ROUNDS {
            let version = self.store.load(&full_key).await?.map(|(_, v)| v);
            if self.store.store(&full_key, encoded.clone(), version).await? {
                return Ok(());
            }
        }
        bail!("cache put for {key}: contention exceeded {CAS_MAX_ROUNDS} rounds");
    }

    /// Writers call this when the underlying input changes.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.store.remove(&Self::key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStateStore;
    use serde_json::json;

    fn gates_with(
        store: Arc<MemoryStateStore>,
        per_minute: Option<u32>,
        per_day: Option<u32>,
        window: Duration,
    ) -> Gates {
        let mut limits = HashMap::new();
        limits.insert(
            "inference".to_string(),
            GateConfig {
                per_minute,
                per_day,
            },
        );
        Gates::with_window(store, limits, window)
    }

    #[tokio::test]
    async fn window_denies_the_call_past_the_limit() {
        let store = Arc::new(MemoryStateStore::new());
        let gates = gates_with(store, Some(3), None, Duration::from_secs(60));

        for _ in 0..3 {
            gates.admit("inference", None).await.unwrap();
        }
        match gates.admit("inference", None).await.unwrap_err() {
            GateDenial::RateLimited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_admits_again_once_it_slides() {
        let store = Arc::new(MemoryStateStore::new());
        let gates = gates_with(store, Some(2), None, Duration::from_millis(40));

        gates.admit("inference", None).await.unwrap();
        gates.admit("inference", None).await.unwrap();
        assert!(gates.admit("inference", None).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        gates.admit("inference", None).await.unwrap();
    }

    #[tokio::test]
    async fn quota_is_a_hard_ceiling_checked_before_the_window() {
        let store = Arc::new(MemoryStateStore::new());
        // Generous window, tiny quota.
        let gates = gates_with(store, Some(100), Some(2), Duration::from_secs(60));

        gates.admit("inference", None).await.unwrap();
        gates.admit("inference", None).await.unwrap();
        match gates.admit("inference", None).await.unwrap_err() {
            GateDenial::QuotaExhausted { retry_after } => {
                // Headroom returns at the next UTC midnight, at most a day out.
                assert!(retry_after <= Duration::from_secs(86_400));
            }
            other => panic!("expected QuotaExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let store = Arc::new(MemoryStateStore::new());
        let gates = gates_with(
            Arc::clone(&store),
            Some(10),
            Some(10),
            Duration::from_secs(60),
        );

        gates.admit("inference", None).await.unwrap();
        store.set_unavailable(true);
        assert_eq!(
            gates.admit("inference", None).await.unwrap_err(),
            GateDenial::StoreUnavailable
        );
    }

    #[tokio::test]
    async fn unlimited_dependencies_pass_through() {
        let store = Arc::new(MemoryStateStore::new());
        let gates = gates_with(store, Some(1), None, Duration::from_secs(60));

        // No config for this dependency at all.
        for _ in 0..10 {
            gates.admit("calendar", None).await.unwrap();
        }
        assert!(!gates.is_limited("calendar"));
        assert!(gates.is_limited("inference"));
    }

    #[tokio::test]
    async fn identifiers_scope_their_own_windows() {
        let store = Arc::new(MemoryStateStore::new());
        let gates = gates_with(store, Some(1), None, Duration::from_secs(60));

        gates.admit("inference", Some("acct-a")).await.unwrap();
        assert!(gates.admit("inference", Some("acct-a")).await.is_err());
        gates.admit("inference", Some("acct-b")).await.unwrap();
    }

    #[tokio::test]
    async fn usage_reports_used_and_remaining() {
        let store = Arc::new(MemoryStateStore::new());
        let gates = gates_with(store, None, Some(5), Duration::from_secs(60));

        gates.admit("inference", None).await.unwrap();
        gates.admit("inference", None).await.unwrap();

        let usage = gates.usage("inference").await.unwrap().unwrap();
        assert_eq!(usage.used, 2);
        assert_eq!(usage.limit, 5);
        assert_eq!(usage.remaining, 3);
        assert!(usage.window_reset_at > Utc::now());
    }

    #[tokio::test]
    async fn quota_key_changes_at_the_utc_day_boundary() {
        let before = DateTime::parse_from_rfc3339("2026-03-01T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        let after = DateTime::parse_from_rfc3339("2026-03-02T00:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_ne!(quota_key("inference", before), quota_key("inference", after));
        assert_eq!(
            next_utc_midnight(before),
            DateTime::parse_from_rfc3339("2026-03-02T00:00:00Z").unwrap()
        );
    }

    #[tokio::test]
    async fn cache_round_trip_and_expiry() {
        let store = Arc::new(MemoryStateStore::new());
        let cache = ResultCache::new(Arc::clone(&store) as Arc<dyn StateStore>, Duration::from_millis(30));

        cache.put("transcript:rec-1", json!("hello")).await.unwrap();
        assert_eq!(cache.get("transcript:rec-1").await, Some(json!("hello")));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("transcript:rec-1").await, None);
    }

    #[tokio::test]
    async fn cache_invalidate_removes_the_entry() {
        let store = Arc::new(MemoryStateStore::new());
        let cache = ResultCache::new(store, Duration::from_secs(300));

        cache.put("k", json!(1)).await.unwrap();
        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn cache_store_outage_reads_as_miss() {
        let store = Arc::new(MemoryStateStore::new());
        let cache = ResultCache::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Duration::from_secs(300),
        );
        cache.put("k", json!(1)).await.unwrap();
        store.set_unavailable(true);
        assert_eq!(cache.get("k").await, None);
    }
}
